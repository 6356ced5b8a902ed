use super::{call_retrying, create_retrying, would_block};
use crate::backend::unix::{sys_read, sys_set_nonblock};
use crate::descriptor::AsDescriptor;
use crate::error::{Error, Result};

use std::ffi::CString;
use std::fmt;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

bitflags::bitflags! {
    /// Creation flags for [`Inotify`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct InotifyFlags: i32 {
        const CLOEXEC = libc::IN_CLOEXEC;
        const NONBLOCK = libc::IN_NONBLOCK;
    }
}

bitflags::bitflags! {
    /// What a watch reports, and what a record says happened.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct WatchMask: u32 {
        const ACCESS = libc::IN_ACCESS;
        const MODIFY = libc::IN_MODIFY;
        const ATTRIB = libc::IN_ATTRIB;
        const CLOSE_WRITE = libc::IN_CLOSE_WRITE;
        const CLOSE_NOWRITE = libc::IN_CLOSE_NOWRITE;
        const OPEN = libc::IN_OPEN;
        const MOVED_FROM = libc::IN_MOVED_FROM;
        const MOVED_TO = libc::IN_MOVED_TO;
        const CREATE = libc::IN_CREATE;
        const DELETE = libc::IN_DELETE;
        const DELETE_SELF = libc::IN_DELETE_SELF;
        const MOVE_SELF = libc::IN_MOVE_SELF;

        /// Sent as needed, whether asked for or not.
        const UNMOUNT = libc::IN_UNMOUNT;
        const Q_OVERFLOW = libc::IN_Q_OVERFLOW;
        const IGNORED = libc::IN_IGNORED;
        const ISDIR = libc::IN_ISDIR;

        const ONLYDIR = libc::IN_ONLYDIR;
        const DONT_FOLLOW = libc::IN_DONT_FOLLOW;
        const EXCL_UNLINK = libc::IN_EXCL_UNLINK;
        /// Adds to the mask of an existing watch instead of replacing it.
        const MASK_ADD = libc::IN_MASK_ADD;
        const ONESHOT = libc::IN_ONESHOT;

        const CLOSE = Self::CLOSE_WRITE.bits() | Self::CLOSE_NOWRITE.bits();
        const MOVE = Self::MOVED_FROM.bits() | Self::MOVED_TO.bits();
        const ALL_EVENTS = libc::IN_ALL_EVENTS;
    }
}

/// Identifies one watch, as found in the `wd` field of each record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WatchDescriptor(i32);

impl WatchDescriptor {
    #[inline]
    pub fn as_raw(self) -> i32 {
        self.0
    }
}

/// A filesystem-change watch descriptor.
///
/// Records are returned exactly as the kernel packs them, one
/// `struct inotify_event` header followed by its padded name.
pub struct Inotify {
    fd: OwnedFd,
    collect: Option<Box<dyn Fn() + Send + Sync>>,
}

impl Inotify {
    pub fn new(flags: InotifyFlags) -> Result<Self> {
        let fd = create_retrying("inotify_init1", || {}, || unsafe {
            libc::inotify_init1(flags.bits())
        })?;
        Ok(Self { fd, collect: None })
    }

    /// Like [`new`](Inotify::new), calling `collect` before the single retry
    /// when creating the descriptor or adding a watch runs out of memory.
    pub fn with_collector(
        flags: InotifyFlags,
        collect: impl Fn() + Send + Sync + 'static,
    ) -> Result<Self> {
        let fd = create_retrying("inotify_init1", &collect, || unsafe {
            libc::inotify_init1(flags.bits())
        })?;
        Ok(Self {
            fd,
            collect: Some(Box::new(collect)),
        })
    }

    /// Starts watching `path`, or changes the mask of its existing watch.
    pub fn add_watch(&self, path: impl AsRef<Path>, mask: WatchMask) -> Result<WatchDescriptor> {
        let path = CString::new(path.as_ref().as_os_str().as_bytes())
            .map_err(|_| Error::InvalidArgument("path contains a NUL byte"))?;

        let collect = || {
            if let Some(collect) = &self.collect {
                collect();
            }
        };
        let wd = call_retrying("inotify_add_watch", collect, || unsafe {
            libc::inotify_add_watch(self.fd.as_raw_fd(), path.as_ptr(), mask.bits())
        })?;
        Ok(WatchDescriptor(wd))
    }

    /// Removes a watch. The kernel queues an `IGNORED` record for it.
    pub fn rm_watch(&self, wd: WatchDescriptor) -> Result<()> {
        let rc = unsafe { libc::inotify_rm_watch(self.fd.as_raw_fd(), wd.0 as _) };
        if rc == -1 {
            return Err(Error::last_os("inotify_rm_watch"));
        }
        Ok(())
    }

    /// Reads whole records into `buf`, blocking until there is one.
    ///
    /// Fails with `EINVAL` when `buf` cannot hold the next record.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        sys_read(self.fd.as_raw_fd(), buf).map_err(|e| Error::syscall("read", e))
    }

    /// Like [`read`](Inotify::read), `None` if nothing is queued.
    ///
    /// Switches the descriptor to non-blocking mode for good.
    pub fn try_read(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        let fd = self.fd.as_raw_fd();
        sys_set_nonblock(fd).map_err(|e| Error::syscall("fcntl", e))?;
        would_block(sys_read(fd, buf), "read")
    }
}

impl fmt::Debug for Inotify {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inotify")
            .field("fd", &self.fd)
            .field("collector", &self.collect.is_some())
            .finish()
    }
}

impl AsRawFd for Inotify {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for Inotify {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsDescriptor for Inotify {
    fn descriptor(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl From<Inotify> for OwnedFd {
    fn from(inotify: Inotify) -> OwnedFd {
        inotify.fd
    }
}
