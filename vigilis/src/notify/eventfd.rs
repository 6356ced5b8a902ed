use super::{create_retrying, would_block};
use crate::backend::unix::{sys_read_u64, sys_set_nonblock, sys_write_u64};
use crate::descriptor::AsDescriptor;
use crate::error::{Error, Result};

use libc::{EFD_CLOEXEC, EFD_NONBLOCK, EFD_SEMAPHORE};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

bitflags::bitflags! {
    /// Creation flags for [`EventFd`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct EventFdFlags: i32 {
        const CLOEXEC = EFD_CLOEXEC;
        const NONBLOCK = EFD_NONBLOCK;
        /// Each read takes 1 from the counter instead of draining it.
        const SEMAPHORE = EFD_SEMAPHORE;
    }
}

/// A kernel 64-bit counter, readable whenever it is non-zero.
#[derive(Debug)]
pub struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    pub fn new(initval: u32, flags: EventFdFlags) -> Result<Self> {
        Self::with_collector(initval, flags, || {})
    }

    /// Like [`new`](EventFd::new), calling `collect` before the single retry
    /// on descriptor exhaustion.
    pub fn with_collector(
        initval: u32,
        flags: EventFdFlags,
        collect: impl FnOnce(),
    ) -> Result<Self> {
        let fd = create_retrying("eventfd", collect, || unsafe {
            libc::eventfd(initval, flags.bits())
        })?;
        Ok(Self { fd })
    }

    /// Adds `value` to the counter.
    ///
    /// Blocks if the counter would overflow, unless the descriptor is
    /// non-blocking. `u64::MAX` is rejected by the kernel.
    pub fn incr(&self, value: u64) -> Result<()> {
        sys_write_u64(self.fd.as_raw_fd(), value).map_err(|e| Error::syscall("write", e))
    }

    /// Reads and resets the counter, blocking while it is zero.
    ///
    /// In semaphore mode only 1 is taken and returned.
    pub fn value(&self) -> Result<u64> {
        sys_read_u64(self.fd.as_raw_fd()).map_err(|e| Error::syscall("read", e))
    }

    /// Reads the counter without blocking, `None` if it is zero.
    ///
    /// Switches the descriptor to non-blocking mode for good.
    pub fn try_value(&self) -> Result<Option<u64>> {
        let fd = self.fd.as_raw_fd();
        sys_set_nonblock(fd).map_err(|e| Error::syscall("fcntl", e))?;
        would_block(sys_read_u64(fd), "read")
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for EventFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsDescriptor for EventFd {
    fn descriptor(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl From<EventFd> for OwnedFd {
    fn from(eventfd: EventFd) -> OwnedFd {
        eventfd.fd
    }
}
