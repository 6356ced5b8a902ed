//! The readiness queue.
//!
//! A [`Queue`] owns one kernel event-queue descriptor and attributes every
//! event it receives to the object registered for the descriptor. Interest
//! bookkeeping lives in a table shared with every [`Queue::duplicate`] of the
//! queue, so any duplicate can register a descriptor and any other one can
//! receive its events.

mod buffer;
mod lifecycle;
mod table;
mod wait;

pub use lifecycle::after_fork;

use crate::backend::{Backend, DefaultBackend};
use crate::builder::{DEFAULT_MAX_EVENTS, QueueBuilder};
use crate::descriptor::AsDescriptor;
use crate::error::{Error, Result};
use crate::events::{Events, Timeout};
use crate::host::Host;
use crate::utils::Key;

use lifecycle::{Core, Family};
use table::InterestTable;

use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use tracing::warn;

/// A kernel readiness queue watching descriptors on behalf of objects of
/// type `T`.
///
/// `T` is the handle handed back with each event, typically an `Arc<_>` or a
/// small id. Every method takes `&self`: a queue may be shared between
/// threads, and [`close`](Queue::close) called from one thread makes a
/// [`wait`](Queue::wait) blocked in another return [`Error::Closed`].
///
/// Waits on one queue are serialized. For parallel waits, give each thread
/// its own [`duplicate`](Queue::duplicate).
///
/// # Examples
///
/// ```rust,ignore
/// use vigilis::{Events, Queue, Timeout};
///
/// let queue = Queue::open(true)?;
/// queue.register(&stream, "client", Events::READABLE)?;
///
/// queue.wait(16, Timeout::Forever, |events, name| {
///     println!("{name}: {events:?}");
/// })?;
/// ```
pub struct Queue<T: 'static, B: Backend = DefaultBackend> {
    core: Arc<Core<T, B>>,
}

impl<T> Queue<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Opens a queue on the platform's default backend.
    ///
    /// With `cloexec` the kernel descriptor is not inherited across `exec`.
    pub fn open(cloexec: bool) -> Result<Self> {
        QueueBuilder::new().cloexec(cloexec).open()
    }
}

impl<T, B> Queue<T, B>
where
    T: Clone + Send + Sync + 'static,
    B: Backend,
{
    pub(crate) fn from_builder(
        backend: B,
        host: Arc<dyn Host<T>>,
        cloexec: bool,
        capacity: usize,
    ) -> Result<Self> {
        let family = Family::new(host);
        let core = Core::open(family, backend, cloexec, capacity)?;
        Ok(Self { core })
    }

    /// Returns a second queue on the same kernel event set.
    ///
    /// The duplicate has its own descriptor and event buffer but shares the
    /// interest table, so registrations made through either one are seen by
    /// both. Closing one leaves the other working.
    pub fn duplicate(&self) -> Result<Self> {
        Ok(Self {
            core: self.core.duplicate()?,
        })
    }

    /// Closes the kernel descriptor.
    ///
    /// Closing a queue that was waiting to be recreated after a fork
    /// succeeds without a syscall. Closing twice fails with
    /// [`Error::Closed`]. The shared interest table is dropped once every
    /// duplicate is closed.
    pub fn close(&self) -> Result<()> {
        self.core.close()
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Hands out the kernel descriptor, for example to put the queue itself
    /// into another poller.
    ///
    /// The queue still owns the descriptor. After a fork, however, the child
    /// leaves an exported descriptor open for its holder to close.
    pub fn export_fd(&self) -> Result<RawFd> {
        self.core.export()
    }

    /// Starts watching `fd` for `events`, attributing its events to `object`.
    ///
    /// Overwrites any existing registration of `fd`. If the kernel already
    /// knew the descriptor, the registration is modified instead.
    pub fn register(&self, fd: impl AsDescriptor, object: T, events: Events) -> Result<()> {
        let fd = fd.descriptor();
        let core = &self.core;
        let queue = core.ensure_active()?;
        let mut hooks = Hooks::new();

        let result = {
            let mut table = core.family.table.write();
            let key = table.stage(fd, object, events);

            let result = match core.family.retry_exhausted_io(B::CTL, || {
                core.backend.add(queue, fd, events, key.tag())
            }) {
                Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                    warn!(fd, "interest cache out of sync (add -> mod)");
                    self.rewatch(&mut table, &mut hooks, queue, fd, events, key)
                }
                other => other,
            };

            settle(&mut table, &mut hooks, key, B::CTL, result)
        };

        hooks.run(&*core.family.host);
        result
    }

    /// Changes the interest of a watched descriptor.
    ///
    /// A descriptor the kernel does not know is added instead.
    pub fn modify(&self, fd: impl AsDescriptor, object: T, events: Events) -> Result<()> {
        let fd = fd.descriptor();
        let core = &self.core;
        let queue = core.ensure_active()?;
        let mut hooks = Hooks::new();

        let result = {
            let mut table = core.family.table.write();
            let key = table.stage(fd, object, events);

            let result = match self.rewatch(&mut table, &mut hooks, queue, fd, events, key) {
                Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
                    warn!(fd, "interest cache out of sync (mod -> add)");
                    core.family.retry_exhausted_io(B::CTL, || {
                        core.backend.add(queue, fd, events, key.tag())
                    })
                }
                other => other,
            };

            settle(&mut table, &mut hooks, key, B::CTL, result)
        };

        hooks.run(&*core.family.host);
        result
    }

    /// Replaces the kernel watch on `fd` with `events` under `key`.
    ///
    /// `EXCLUSIVE` registrations cannot be modified in place; they are
    /// deleted and added again. If the add then fails, the old entry stays
    /// as bookkeeping only.
    fn rewatch(
        &self,
        table: &mut InterestTable<T>,
        hooks: &mut Hooks<T>,
        queue: RawFd,
        fd: RawFd,
        events: Events,
        key: Key,
    ) -> io::Result<()> {
        let core = &self.core;
        let previous = table.get(fd).map_or(Events::empty(), |entry| entry.events);

        if !(previous | events).contains(Events::EXCLUSIVE) {
            return core.backend.modify(queue, fd, previous, events, key.tag());
        }

        match core.backend.delete(queue, fd, previous) {
            Err(e) if e.raw_os_error() != Some(libc::ENOENT) => return Err(e),
            _ => {}
        }

        let result = core.family.retry_exhausted_io(B::CTL, || {
            core.backend.add(queue, fd, events, key.tag())
        });
        if result.is_err() {
            if let Some(object) = table.forget(fd) {
                hooks.released.push(object.clone());
            }
        }
        result
    }

    /// Registers or modifies as needed, skipping the syscall entirely when
    /// `fd` is already watched for the same object with the same events.
    ///
    /// One-shot interest always reaches the kernel, since it has to be
    /// rearmed after firing.
    pub fn update(&self, fd: impl AsDescriptor, object: T, events: Events) -> Result<()>
    where
        T: PartialEq,
    {
        let fd = fd.descriptor();
        self.core.ensure_active()?;

        let live = {
            let table = self.core.family.table.read();
            match table.get(fd) {
                Some(entry) if entry.live => {
                    if entry.object == object && entry.events == events && !events.is_oneshot() {
                        return Ok(());
                    }
                    true
                }
                _ => false,
            }
        };

        if live {
            self.modify(fd, object, events)
        } else {
            self.register(fd, object, events)
        }
    }

    /// Stops watching `fd` and returns the object it was registered for.
    ///
    /// The entry is dropped even if the kernel call fails. A descriptor the
    /// kernel already forgot, for example because it was closed, is not an
    /// error.
    pub fn unregister(&self, fd: impl AsDescriptor) -> Result<Option<T>> {
        let fd = fd.descriptor();
        let core = &self.core;
        let queue = core.ensure_active()?;

        let (entry, result) = {
            let mut table = core.family.table.write();
            let entry = table.remove(fd);
            let previous = entry.as_ref().map_or(Events::all(), |entry| entry.events);

            let result = match core.backend.delete(queue, fd, previous) {
                Err(e) if matches!(e.raw_os_error(), Some(libc::ENOENT) | Some(libc::EBADF)) => {
                    Ok(())
                }
                other => other,
            };
            (entry, result)
        };

        let object = entry.map(|entry| {
            if entry.live {
                core.family.host.release(&entry.object);
            }
            entry.object
        });

        result.map_err(|source| Error::syscall(B::CTL, source))?;
        Ok(object)
    }

    /// Blocks until events arrive or `timeout` passes, calling `f` once per
    /// event with its flags and object.
    ///
    /// Returns the number of events delivered, at most `max_events`. Zero
    /// means the timeout expired, or that the kernel only reported
    /// descriptors unregistered in the meantime. Signals do not cut the wait
    /// short: the call resumes with whatever time is left.
    ///
    /// `f` runs after the internal locks are released, so it may register
    /// or unregister descriptors on this queue.
    pub fn wait<F>(&self, max_events: usize, timeout: impl Into<Timeout>, mut f: F) -> Result<usize>
    where
        F: FnMut(Events, &T),
    {
        let ready = self.core.wait_ready(max_events, timeout.into())?;

        for (events, object) in &ready {
            f(*events, object);
        }

        Ok(ready.len())
    }

    /// Like [`wait`](Queue::wait), collecting the events instead.
    pub fn wait_events(
        &self,
        max_events: usize,
        timeout: impl Into<Timeout>,
    ) -> Result<Vec<(Events, T)>> {
        self.core.wait_ready(max_events, timeout.into())
    }

    /// Waits forever for up to 64 events.
    pub fn wait_default<F>(&self, f: F) -> Result<usize>
    where
        F: FnMut(Events, &T),
    {
        self.wait(DEFAULT_MAX_EVENTS, Timeout::Forever, f)
    }

    /// The object registered for `fd`.
    pub fn object_for(&self, fd: impl AsDescriptor) -> Option<T> {
        let table = self.core.family.table.read();
        table.get(fd.descriptor()).map(|entry| entry.object.clone())
    }

    /// The interest last applied to `fd`.
    pub fn events_for(&self, fd: impl AsDescriptor) -> Option<Events> {
        let table = self.core.family.table.read();
        table.get(fd.descriptor()).map(|entry| entry.events)
    }

    pub fn contains(&self, fd: impl AsDescriptor) -> bool {
        self.core.family.table.read().contains(fd.descriptor())
    }

    /// Number of watched descriptors, shared by all duplicates.
    pub fn len(&self) -> usize {
        self.core.family.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current event buffer capacity. Blocks while a wait is running.
    pub fn buffer_capacity(&self) -> usize {
        self.core.buffer.lock().capacity()
    }
}

/// Publishes or discards a staged registration after its syscall.
fn settle<T: Clone>(
    table: &mut InterestTable<T>,
    hooks: &mut Hooks<T>,
    key: Key,
    op: &'static str,
    result: io::Result<()>,
) -> Result<()> {
    match result {
        Ok(()) => {
            hooks.pinned = table.lookup(key).map(|entry| entry.object.clone());
            if let Some(displaced) = table.commit(key) {
                if displaced.live {
                    hooks.released.push(displaced.object);
                }
            }
            Ok(())
        }
        Err(source) => {
            table.abort(key);
            Err(Error::syscall(op, source))
        }
    }
}

/// Host callbacks collected under the table lock, run once it is released.
struct Hooks<T> {
    pinned: Option<T>,
    released: Vec<T>,
}

impl<T> Hooks<T> {
    fn new() -> Self {
        Self {
            pinned: None,
            released: Vec::new(),
        }
    }

    fn run(self, host: &dyn Host<T>)
    where
        T: 'static,
    {
        if let Some(object) = &self.pinned {
            host.pin(object);
        }
        for object in &self.released {
            host.release(object);
        }
    }
}

impl<T, B> fmt::Debug for Queue<T, B>
where
    T: Clone + Send + Sync + 'static,
    B: Backend,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.core.id)
            .field("closed", &self.is_closed())
            .field("watched", &self.len())
            .finish()
    }
}
