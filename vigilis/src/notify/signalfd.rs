use super::{create_retrying, would_block};
use crate::backend::unix::sys_set_nonblock;
use crate::descriptor::AsDescriptor;
use crate::error::{Error, Result};

use libc::{SFD_CLOEXEC, SFD_NONBLOCK, c_int, c_void, sigset_t, signalfd_siginfo};
use std::fmt;
use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::ptr;

bitflags::bitflags! {
    /// Creation flags for [`SignalFd`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SignalFdFlags: i32 {
        const CLOEXEC = SFD_CLOEXEC;
        const NONBLOCK = SFD_NONBLOCK;
    }
}

/// A set of signal numbers.
#[derive(Clone, Copy)]
pub struct SigSet(sigset_t);

impl SigSet {
    pub fn empty() -> Self {
        let mut set: sigset_t = unsafe { mem::zeroed() };
        unsafe { libc::sigemptyset(&mut set) };
        Self(set)
    }

    /// The set holding each of `signals`.
    pub fn from_signals(signals: &[c_int]) -> Result<Self> {
        let mut set = Self::empty();
        for &signo in signals {
            set.add(signo)?;
        }
        Ok(set)
    }

    pub fn add(&mut self, signo: c_int) -> Result<()> {
        if unsafe { libc::sigaddset(&mut self.0, signo) } == -1 {
            return Err(Error::InvalidArgument("not a signal number"));
        }
        Ok(())
    }

    pub fn contains(&self, signo: c_int) -> bool {
        unsafe { libc::sigismember(&self.0, signo) == 1 }
    }

    /// Blocks the set in the calling thread, so its signals stay pending
    /// for a [`SignalFd`] instead of running their handlers.
    pub fn block(&self) -> Result<()> {
        self.mask(libc::SIG_BLOCK)
    }

    pub fn unblock(&self) -> Result<()> {
        self.mask(libc::SIG_UNBLOCK)
    }

    fn mask(&self, how: c_int) -> Result<()> {
        let rc = unsafe { libc::pthread_sigmask(how, &self.0, ptr::null_mut()) };
        if rc != 0 {
            return Err(Error::syscall("pthread_sigmask", io::Error::from_raw_os_error(rc)));
        }
        Ok(())
    }
}

impl Default for SigSet {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for SigSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let members = (1..=libc::SIGRTMAX()).filter(|&signo| self.contains(signo));
        f.debug_set().entries(members).finish()
    }
}

/// One dequeued signal, as filled in by the kernel.
#[derive(Clone, Copy)]
pub struct SigInfo(signalfd_siginfo);

impl SigInfo {
    pub fn signo(&self) -> u32 {
        self.0.ssi_signo
    }

    pub fn errno(&self) -> i32 {
        self.0.ssi_errno
    }

    /// How the signal was sent, e.g. `SI_USER` or `SI_TKILL`.
    pub fn code(&self) -> i32 {
        self.0.ssi_code
    }

    /// Sending process.
    pub fn pid(&self) -> u32 {
        self.0.ssi_pid
    }

    pub fn uid(&self) -> u32 {
        self.0.ssi_uid
    }

    /// Descriptor that became ready, for `SIGIO`.
    pub fn fd(&self) -> i32 {
        self.0.ssi_fd
    }

    /// Kernel timer id, for POSIX timer signals.
    pub fn tid(&self) -> u32 {
        self.0.ssi_tid
    }

    pub fn band(&self) -> u32 {
        self.0.ssi_band
    }

    pub fn overrun(&self) -> u32 {
        self.0.ssi_overrun
    }

    pub fn trapno(&self) -> u32 {
        self.0.ssi_trapno
    }

    /// Exit status or signal, for `SIGCHLD`.
    pub fn status(&self) -> i32 {
        self.0.ssi_status
    }

    /// Integer sent with `sigqueue(3)`.
    pub fn int(&self) -> i32 {
        self.0.ssi_int
    }

    /// Pointer sent with `sigqueue(3)`.
    pub fn ptr(&self) -> u64 {
        self.0.ssi_ptr as u64
    }

    pub fn utime(&self) -> u64 {
        self.0.ssi_utime as u64
    }

    pub fn stime(&self) -> u64 {
        self.0.ssi_stime as u64
    }

    /// Faulting address, for hardware-generated signals.
    pub fn addr(&self) -> u64 {
        self.0.ssi_addr as u64
    }
}

impl fmt::Debug for SigInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigInfo")
            .field("signo", &self.signo())
            .field("code", &self.code())
            .field("pid", &self.pid())
            .field("uid", &self.uid())
            .finish()
    }
}

/// A descriptor that dequeues blocked signals as readable records.
#[derive(Debug)]
pub struct SignalFd {
    fd: OwnedFd,
}

impl SignalFd {
    /// Watches `mask`. The signals must also be blocked, see
    /// [`SigSet::block`], or their default action still runs.
    pub fn new(mask: &SigSet, flags: SignalFdFlags) -> Result<Self> {
        Self::with_collector(mask, flags, || {})
    }

    /// Like [`new`](SignalFd::new), calling `collect` before the single retry
    /// on descriptor exhaustion.
    pub fn with_collector(
        mask: &SigSet,
        flags: SignalFdFlags,
        collect: impl FnOnce(),
    ) -> Result<Self> {
        let fd = create_retrying("signalfd", collect, || unsafe {
            libc::signalfd(-1, &mask.0, flags.bits())
        })?;
        Ok(Self { fd })
    }

    /// Replaces the watched set.
    pub fn set_mask(&self, mask: &SigSet) -> Result<()> {
        let rc = unsafe { libc::signalfd(self.fd.as_raw_fd(), &mask.0, 0) };
        if rc == -1 {
            return Err(Error::last_os("signalfd"));
        }
        Ok(())
    }

    /// Dequeues one signal, blocking until there is one.
    pub fn take(&self) -> Result<SigInfo> {
        read_siginfo(self.fd.as_raw_fd()).map_err(|e| Error::syscall("read", e))
    }

    /// Dequeues one signal, `None` if none is pending.
    ///
    /// Switches the descriptor to non-blocking mode for good.
    pub fn try_take(&self) -> Result<Option<SigInfo>> {
        let fd = self.fd.as_raw_fd();
        sys_set_nonblock(fd).map_err(|e| Error::syscall("fcntl", e))?;
        would_block(read_siginfo(fd), "read")
    }
}

fn read_siginfo(fd: RawFd) -> io::Result<SigInfo> {
    let mut info: signalfd_siginfo = unsafe { mem::zeroed() };
    let size = mem::size_of::<signalfd_siginfo>();
    let n = unsafe { libc::read(fd, &mut info as *mut signalfd_siginfo as *mut c_void, size) };

    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    if n as usize != size {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "short read of signalfd_siginfo",
        ));
    }
    Ok(SigInfo(info))
}

impl AsRawFd for SignalFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for SignalFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsDescriptor for SignalFd {
    fn descriptor(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl From<SignalFd> for OwnedFd {
    fn from(signalfd: SignalFd) -> OwnedFd {
        signalfd.fd
    }
}
