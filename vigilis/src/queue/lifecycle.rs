//! Queue lifecycle: creation, duplication, close and fork recovery.
//!
//! Every queue owns one kernel descriptor and moves through three states:
//!
//! ```text
//!   open/duplicate ──► Active(fd) ──close──► Closed
//!                        │   ▲
//!          after_fork()  │   │ next operation
//!                        ▼   │
//!                   PendingRecreate ──close──► Closed
//! ```
//!
//! Queues derived from one `open` through `duplicate` form a *family*: they
//! share the interest table and one kernel event set, while each member owns
//! its own descriptor, event buffer and wake source.
//!
//! A process-wide registry tracks every live queue so that [`after_fork`]
//! can reach them. The registry holds weak references only; dropping a queue
//! removes it.

use super::buffer::EventBuffer;
use super::table::InterestTable;
use crate::backend::Backend;
use crate::error::{Error, Result, is_exhaustion};
use crate::host::Host;

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Weak};
use tracing::{debug, warn};

/// High bit of a kernel tag: the record is a queue wake source, not an entry.
pub(crate) const WAKE_BIT: u64 = 1 << 63;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

trait ForkRecover: Send + Sync {
    fn after_fork(&self);
}

static LIVE: LazyLock<Mutex<HashMap<u64, Weak<dyn ForkRecover>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn untrack(id: u64) {
    LIVE.lock().remove(&id);
}

/// Prepares every live queue for use in a freshly forked child.
///
/// Must be called in the child right after `fork(2)` returns, before any
/// queue is used again. Each queue drops its inherited kernel descriptor
/// and recreates a fresh one on its next operation. Interest entries are
/// kept as bookkeeping but are no longer registered with the kernel; the
/// caller re-registers the descriptors it still wants to watch.
///
/// The hook takes internal locks. A lock that some other parent thread held
/// at the moment of the fork stays held forever in the child, so the fork
/// itself should not race with queue operations on other threads.
pub fn after_fork() {
    let queues: Vec<Arc<dyn ForkRecover>> =
        LIVE.lock().values().filter_map(Weak::upgrade).collect();

    for queue in &queues {
        queue.after_fork();
    }

    debug!(count = queues.len(), "queues marked for recreation after fork");
}

enum Kernel<W> {
    Active { fd: RawFd, waker: W },
    PendingRecreate,
    Closed,
}

struct State<W> {
    kernel: Kernel<W>,
    /// A `wait` is between `begin_wait` and `end_wait`.
    waiting: bool,
    /// The descriptor was handed out through `export`.
    exported: bool,
    /// Closed while a wait was blocked on it; reclaimed by that wait.
    orphan: Option<(RawFd, W)>,
}

/// State shared by every queue derived from one `open`.
pub(crate) struct Family<T: 'static, B: Backend> {
    pub(crate) table: RwLock<InterestTable<T>>,
    pub(crate) host: Arc<dyn Host<T>>,
    members: Mutex<Vec<Weak<Core<T, B>>>>,
    /// Serializes recreation so a family comes back as one kernel set.
    rebirth: Mutex<()>,
}

impl<T, B> Family<T, B>
where
    T: Clone + Send + Sync + 'static,
    B: Backend,
{
    pub(crate) fn new(host: Arc<dyn Host<T>>) -> Arc<Self> {
        Arc::new(Self {
            table: RwLock::new(InterestTable::new()),
            host,
            members: Mutex::new(Vec::new()),
            rebirth: Mutex::new(()),
        })
    }

    /// Runs `call`, retrying once after a collector hint if the kernel ran
    /// out of descriptors or memory.
    pub(crate) fn retry_exhausted_io<R>(
        &self,
        op: &'static str,
        mut call: impl FnMut() -> io::Result<R>,
    ) -> io::Result<R> {
        match call() {
            Err(source) if is_exhaustion(&source) => {
                let first = Error::ResourceExhausted { op, source };
                warn!(error = %first, "collecting and retrying once");
                self.host.collect();
                call()
            }
            other => other,
        }
    }

    pub(crate) fn retry_exhausted<R>(
        &self,
        op: &'static str,
        call: impl FnMut() -> io::Result<R>,
    ) -> Result<R> {
        self.retry_exhausted_io(op, call)
            .map_err(|source| Error::syscall(op, source))
    }

    fn join(&self, core: &Arc<Core<T, B>>) {
        let mut members = self.members.lock();
        members.retain(|member| member.strong_count() > 0);
        members.push(Arc::downgrade(core));
    }

    /// Duplicates the descriptor of an active member other than `id`.
    fn duplicate_sibling(&self, id: u64, backend: &B) -> Result<Option<RawFd>> {
        let members: Vec<Arc<Core<T, B>>> = self
            .members
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();

        for member in members.iter().filter(|member| member.id != id) {
            let state = member.state.lock();
            if let Kernel::Active { fd, .. } = state.kernel {
                return self
                    .retry_exhausted("fcntl", || backend.duplicate(fd))
                    .map(Some);
            }
        }

        Ok(None)
    }

    /// The kernel set was replaced: nothing in the table is registered.
    fn forget_kernel_state(&self) {
        let mut released = Vec::new();
        self.table
            .write()
            .forget_kernel_state(|object| released.push(object.clone()));

        for object in &released {
            self.host.release(object);
        }
    }

    /// Destroys the table once the last member is closed.
    fn member_closed(&self) {
        let members: Vec<Arc<Core<T, B>>> = self
            .members
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();

        if members.iter().all(|member| member.is_closed()) {
            let released = self.table.write().clear();
            for object in &released {
                self.host.release(object);
            }
            debug!("last queue of the family closed, interest table cleared");
        }
    }
}

impl<T: 'static, B: Backend> Drop for Family<T, B> {
    fn drop(&mut self) {
        for object in &self.table.get_mut().clear() {
            self.host.release(object);
        }
    }
}

/// One queue: a kernel descriptor plus the machinery to wait on it.
pub(crate) struct Core<T: 'static, B: Backend> {
    pub(crate) id: u64,
    pub(crate) backend: B,
    cloexec: bool,
    capacity: usize,
    state: Mutex<State<B::Waker>>,
    pub(crate) buffer: Mutex<EventBuffer<B::Record>>,
    pub(crate) family: Arc<Family<T, B>>,
}

impl<T, B> Core<T, B>
where
    T: Clone + Send + Sync + 'static,
    B: Backend,
{
    /// Creates the first queue of a new family.
    pub(crate) fn open(
        family: Arc<Family<T, B>>,
        backend: B,
        cloexec: bool,
        capacity: usize,
    ) -> Result<Arc<Self>> {
        let fd = family.retry_exhausted(B::CREATE, || backend.create(cloexec))?;
        let core = Self::adopt(family, backend, cloexec, capacity, fd)?;

        debug!(queue = core.id, fd, "queue opened");
        Ok(core)
    }

    /// Wraps an open kernel descriptor into a tracked queue.
    fn adopt(
        family: Arc<Family<T, B>>,
        backend: B,
        cloexec: bool,
        capacity: usize,
        fd: RawFd,
    ) -> Result<Arc<Self>> {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);

        let waker = match backend.waker(fd, WAKE_BIT | id) {
            Ok(waker) => waker,
            Err(source) => {
                let _ = backend.close(fd);
                return Err(Error::syscall(B::CTL, source));
            }
        };

        let core = Arc::new(Self {
            id,
            buffer: Mutex::new(EventBuffer::new(capacity, B::EMPTY)),
            backend,
            cloexec,
            capacity,
            state: Mutex::new(State {
                kernel: Kernel::Active { fd, waker },
                waiting: false,
                exported: false,
                orphan: None,
            }),
            family,
        });

        core.family.join(&core);
        let weak: Weak<dyn ForkRecover> = Arc::downgrade(&core) as Weak<dyn ForkRecover>;
        LIVE.lock().insert(id, weak);

        Ok(core)
    }

    /// Tag under which this queue's wake source is registered.
    #[inline]
    pub(crate) fn wake_tag(&self) -> u64 {
        WAKE_BIT | self.id
    }

    fn current(&self) -> Result<Option<RawFd>> {
        match self.state.lock().kernel {
            Kernel::Active { fd, .. } => Ok(Some(fd)),
            Kernel::PendingRecreate => Ok(None),
            Kernel::Closed => Err(Error::Closed),
        }
    }

    /// Returns the kernel descriptor, recreating it first after a fork.
    pub(crate) fn ensure_active(&self) -> Result<RawFd> {
        if let Some(fd) = self.current()? {
            return Ok(fd);
        }

        let _rebirth = self.family.rebirth.lock();
        if let Some(fd) = self.current()? {
            return Ok(fd);
        }

        let shared = self.family.duplicate_sibling(self.id, &self.backend)?;
        let fd = match shared {
            Some(fd) => fd,
            None => {
                self.family.forget_kernel_state();
                self.family
                    .retry_exhausted(B::CREATE, || self.backend.create(self.cloexec))?
            }
        };

        let waker = match self.backend.waker(fd, self.wake_tag()) {
            Ok(waker) => waker,
            Err(source) => {
                let _ = self.backend.close(fd);
                return Err(Error::syscall(B::CTL, source));
            }
        };

        let mut state = self.state.lock();
        if !matches!(state.kernel, Kernel::PendingRecreate) {
            drop(state);
            self.backend.drop_waker(fd, waker);
            let _ = self.backend.close(fd);
            return Err(Error::Closed);
        }
        state.kernel = Kernel::Active { fd, waker };
        drop(state);

        debug!(
            queue = self.id,
            fd,
            shared = shared.is_some(),
            "kernel queue recreated after fork"
        );
        Ok(fd)
    }

    /// A second queue sharing this one's kernel set and interest table.
    pub(crate) fn duplicate(&self) -> Result<Arc<Self>> {
        self.ensure_active()?;

        let fd = {
            let state = self.state.lock();
            match state.kernel {
                Kernel::Active { fd, .. } => self
                    .family
                    .retry_exhausted("fcntl", || self.backend.duplicate(fd))?,
                _ => return Err(Error::Closed),
            }
        };

        let core = Self::adopt(
            self.family.clone(),
            self.backend.clone(),
            self.cloexec,
            self.capacity,
            fd,
        )?;

        debug!(source = self.id, queue = core.id, fd, "queue duplicated");
        Ok(core)
    }

    /// Hands the descriptor to an external holder.
    pub(crate) fn export(&self) -> Result<RawFd> {
        let fd = self.ensure_active()?;

        let mut state = self.state.lock();
        if !matches!(state.kernel, Kernel::Active { fd: current, .. } if current == fd) {
            return Err(Error::Closed);
        }
        state.exported = true;
        Ok(fd)
    }

    pub(crate) fn close(&self) -> Result<()> {
        let reclaim = {
            let mut state = self.state.lock();
            match mem::replace(&mut state.kernel, Kernel::Closed) {
                Kernel::Active { fd, waker } if state.waiting => {
                    if let Err(e) = self.backend.wake(fd, &waker) {
                        warn!(queue = self.id, error = %e, "failed to wake blocked wait");
                    }
                    state.orphan = Some((fd, waker));
                    None
                }
                Kernel::Active { fd, waker } => Some((fd, waker)),
                Kernel::PendingRecreate => None,
                Kernel::Closed => return Err(Error::Closed),
            }
        };

        untrack(self.id);

        let result = match reclaim {
            Some((fd, waker)) => self.release(fd, waker),
            None => Ok(()),
        };

        self.family.member_closed();
        debug!(queue = self.id, "queue closed");

        result
    }

    fn release(&self, fd: RawFd, waker: B::Waker) -> Result<()> {
        self.backend.drop_waker(fd, waker);
        self.backend
            .close(fd)
            .map_err(|source| Error::syscall("close", source))
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(self.state.lock().kernel, Kernel::Closed)
    }

    /// Marks a wait as in progress and returns the descriptor to wait on.
    pub(crate) fn begin_wait(&self) -> Result<RawFd> {
        loop {
            let fd = self.ensure_active()?;

            let mut state = self.state.lock();
            let current = match state.kernel {
                Kernel::Active { fd, .. } => fd,
                Kernel::Closed => return Err(Error::Closed),
                Kernel::PendingRecreate => continue,
            };
            // Recreated again between the two locks.
            if current != fd {
                continue;
            }
            state.waiting = true;
            return Ok(fd);
        }
    }

    /// Re-validates the queue after an interrupted wait.
    ///
    /// Fails if the queue was closed, or if its descriptor was closed behind
    /// its back by other code.
    pub(crate) fn check_open(&self) -> Result<RawFd> {
        match self.state.lock().kernel {
            Kernel::Active { fd, .. } if self.backend.is_open(fd) => Ok(fd),
            _ => Err(Error::Closed),
        }
    }

    /// Ends a wait, reclaiming the descriptor if the queue was closed
    /// meanwhile. Returns whether it was.
    pub(crate) fn end_wait(&self) -> bool {
        let (orphan, closed) = {
            let mut state = self.state.lock();
            state.waiting = false;
            (
                state.orphan.take(),
                matches!(state.kernel, Kernel::Closed),
            )
        };

        if let Some((fd, waker)) = orphan {
            if let Err(e) = self.release(fd, waker) {
                debug!(queue = self.id, error = %e, "close after blocked wait failed");
            }
        }

        closed
    }
}

impl<T, B> ForkRecover for Core<T, B>
where
    T: Clone + Send + Sync + 'static,
    B: Backend,
{
    fn after_fork(&self) {
        let mut state = self.state.lock();
        state.waiting = false;
        let orphan = state.orphan.take();
        let exported = mem::take(&mut state.exported);

        let inherited = match mem::replace(&mut state.kernel, Kernel::PendingRecreate) {
            Kernel::Active { fd, waker } => Some((fd, waker)),
            Kernel::PendingRecreate => None,
            Kernel::Closed => {
                state.kernel = Kernel::Closed;
                None
            }
        };
        drop(state);

        if B::SURVIVES_FORK {
            if let Some((fd, waker)) = orphan {
                self.backend.drop_waker(fd, waker);
                let _ = self.backend.close(fd);
            }
            if let Some((fd, waker)) = inherited {
                self.backend.drop_waker(fd, waker);
                // An exported descriptor belongs to its holder now.
                if !exported {
                    let _ = self.backend.close(fd);
                }
            }
        }

        self.family.forget_kernel_state();
    }
}

impl<T: 'static, B: Backend> Drop for Core<T, B> {
    fn drop(&mut self) {
        untrack(self.id);

        let state = self.state.get_mut();
        let orphan = state.orphan.take();
        let active = match mem::replace(&mut state.kernel, Kernel::Closed) {
            Kernel::Active { fd, waker } => Some((fd, waker)),
            _ => None,
        };

        for (fd, waker) in orphan.into_iter().chain(active) {
            self.backend.drop_waker(fd, waker);
            if let Err(e) = self.backend.close(fd) {
                debug!(queue = self.id, error = %e, "close on drop failed");
            }
        }
    }
}
