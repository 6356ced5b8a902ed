//! Kernel event-queue adapters.
//!
//! A [`Backend`] translates the generic [`Events`] model to one kernel
//! facility and performs the raw syscalls. Backends are stateless handles;
//! all state (the queue descriptor, the interest table, the event buffer)
//! belongs to the queue that drives them.
//!
//! The concrete implementation used by default is selected at compile time
//! depending on the target operating system:
//!
//! - Linux and Android: [`Epoll`]
//! - macOS and the BSDs: [`Kqueue`]

use crate::events::Events;

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

pub(crate) mod unix;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use epoll::{Epoll, EventWaker};

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub use kqueue::{Kevent, Kqueue};

/// Backend used when none is configured.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub type DefaultBackend = Epoll;

/// Backend used when none is configured.
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub type DefaultBackend = Kqueue;

/// One kernel readiness facility.
///
/// Registration is synchronous on every backend: `add`, `modify` and `delete`
/// reach the kernel before they return, so interest changes are visible to
/// the very next `wait` on any queue sharing the kernel set.
///
/// `tag` values are opaque to the backend. They are stored in the kernel
/// registration and handed back unchanged by [`Backend::decode`].
pub trait Backend: Clone + Send + Sync + 'static {
    /// Raw kernel event record.
    type Record: Copy + Send;

    /// Per-queue wake source registered in the kernel set.
    type Waker: Send + Sync;

    /// Zeroed record used to fill the event buffer.
    const EMPTY: Self::Record;

    /// Syscall names used in error reports.
    const CREATE: &'static str;
    const CTL: &'static str;
    const WAIT: &'static str;

    /// Whether a forked child inherits the queue descriptor.
    ///
    /// An inherited descriptor still refers to the parent's kernel set and
    /// must be closed in the child. kqueue descriptors are not inherited, so
    /// the child leaves their numbers alone.
    const SURVIVES_FORK: bool = true;

    /// Creates a new kernel event queue.
    fn create(&self, cloexec: bool) -> io::Result<RawFd>;

    /// Returns a second descriptor for the same kernel event set.
    fn duplicate(&self, queue: RawFd) -> io::Result<RawFd> {
        unix::sys_dup_cloexec(queue)
    }

    fn close(&self, fd: RawFd) -> io::Result<()> {
        unix::sys_close(fd)
    }

    fn is_open(&self, fd: RawFd) -> bool {
        unix::sys_is_open(fd)
    }

    /// Starts watching `fd`. Fails with `EEXIST` if it is already watched.
    ///
    /// On failure nothing of the new registration is left in the kernel.
    fn add(&self, queue: RawFd, fd: RawFd, events: Events, tag: u64) -> io::Result<()>;

    /// Replaces the watch on `fd`. Fails with `ENOENT` if it is not watched.
    ///
    /// `previous` is the last interest applied, for backends that need to
    /// retract individual filters. Queues never pass [`Events::EXCLUSIVE`]
    /// on either side: such registrations are deleted and added again.
    fn modify(
        &self,
        queue: RawFd,
        fd: RawFd,
        previous: Events,
        events: Events,
        tag: u64,
    ) -> io::Result<()>;

    /// Stops watching `fd`.
    fn delete(&self, queue: RawFd, fd: RawFd, previous: Events) -> io::Result<()>;

    /// Blocks for readiness, filling `records` from the front.
    ///
    /// `None` waits forever. Returns the number of records filled.
    fn wait(
        &self,
        queue: RawFd,
        records: &mut [Self::Record],
        timeout: Option<Duration>,
    ) -> io::Result<usize>;

    /// Splits a record into its tag and generic readiness flags.
    fn decode(&self, record: &Self::Record) -> (u64, Events);

    /// Registers a wake source for the queue under `tag`.
    fn waker(&self, queue: RawFd, tag: u64) -> io::Result<Self::Waker>;

    /// Makes the wake source ready, returning any blocked `wait` on `queue`.
    fn wake(&self, queue: RawFd, waker: &Self::Waker) -> io::Result<()>;

    /// Releases the wake source. `queue` may already be closed.
    fn drop_waker(&self, queue: RawFd, waker: Self::Waker);
}
