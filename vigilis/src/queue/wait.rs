//! Blocking for readiness and attributing raw records to watched objects.

use super::buffer::EventBuffer;
use super::lifecycle::{Core, WAKE_BIT};
use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::events::{Events, Timeout};
use crate::utils::Key;

use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

impl<T, B> Core<T, B>
where
    T: Clone + Send + Sync + 'static,
    B: Backend,
{
    /// Runs one wait and returns what it delivered, in kernel order.
    ///
    /// The buffer lock is held for the whole call, so waits on the same
    /// queue run one after another. Duplicates have their own buffers and
    /// wait in parallel.
    pub(crate) fn wait_ready(
        &self,
        max_events: usize,
        timeout: Timeout,
    ) -> Result<Vec<(Events, T)>> {
        if max_events == 0 {
            return Err(Error::InvalidArgument("max_events must be at least 1"));
        }
        if max_events > i32::MAX as usize {
            return Err(Error::InvalidArgument("max_events exceeds the kernel limit"));
        }

        let mut buffer = self.buffer.lock();
        if buffer.reserve(max_events) {
            debug!(queue = self.id, capacity = max_events, "event buffer grown");
        }

        let fd = self.begin_wait()?;
        let result = self.wait_loop(&mut buffer, fd, max_events, timeout);

        if self.end_wait() {
            return Err(Error::Closed);
        }
        result
    }

    fn wait_loop(
        &self,
        buffer: &mut EventBuffer<B::Record>,
        fd: RawFd,
        max_events: usize,
        timeout: Timeout,
    ) -> Result<Vec<(Events, T)>> {
        let deadline = timeout.deadline(self.family.host.now());
        let mut remaining = timeout.as_duration();

        loop {
            let n = match self.backend.wait(fd, buffer.slots(max_events), remaining) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    self.check_open()?;
                    remaining = self.remaining(timeout, deadline);
                    trace!(queue = self.id, ?remaining, "wait interrupted, retrying");
                    continue;
                }
                Err(source) => return Err(Error::syscall(B::WAIT, source)),
            };

            let ready = self.demux(buffer.filled(n));

            if n == buffer.capacity() {
                let capacity = buffer.grow();
                debug!(queue = self.id, capacity, "event buffer filled, grown");
            }

            // One kernel wakeup per wait, even if it only carried wake
            // sources or stale tags.
            if ready.len() < n {
                trace!(queue = self.id, records = n, delivered = ready.len(), "records dropped");
            }
            return Ok(ready);
        }
    }

    /// Time left before `deadline`, clamped to zero.
    fn remaining(&self, timeout: Timeout, deadline: Option<Instant>) -> Option<Duration> {
        match deadline {
            Some(deadline) => Some(deadline.saturating_duration_since(self.family.host.now())),
            None => timeout.as_duration(),
        }
    }

    /// Resolves raw records through the kernel tag.
    ///
    /// Wake sources and tags whose entry is already gone are dropped.
    fn demux(&self, records: &[B::Record]) -> Vec<(Events, T)> {
        let table = self.family.table.read();

        records
            .iter()
            .filter_map(|record| {
                let (tag, events) = self.backend.decode(record);
                if tag & WAKE_BIT != 0 {
                    return None;
                }
                table
                    .lookup(Key::from_tag(tag))
                    .map(|entry| (events, entry.object.clone()))
            })
            .collect()
    }
}
