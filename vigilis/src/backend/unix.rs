use libc::{
    F_DUPFD_CLOEXEC, F_GETFD, F_GETFL, F_SETFD, F_SETFL, FD_CLOEXEC, O_NONBLOCK, c_int, c_void,
    close, dup, fcntl,
};
use std::io;
use std::mem;
use std::os::fd::RawFd;

/// Turns a libc `-1` return into the current `errno`.
#[inline]
pub(crate) fn cvt(rc: c_int) -> io::Result<c_int> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

/// Closes a file descriptor.
pub(crate) fn sys_close(fd: RawFd) -> io::Result<()> {
    cvt(unsafe { close(fd) }).map(|_| ())
}

/// Whether `fd` still names an open descriptor.
pub(crate) fn sys_is_open(fd: RawFd) -> bool {
    if fd < 0 {
        return false;
    }
    let rc = unsafe { fcntl(fd, F_GETFD) };
    !(rc == -1 && io::Error::last_os_error().raw_os_error() == Some(libc::EBADF))
}

/// Sets `FD_CLOEXEC` on a descriptor.
pub(crate) fn sys_set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = cvt(unsafe { fcntl(fd, F_GETFD) })?;
    if flags & FD_CLOEXEC != 0 {
        return Ok(());
    }
    cvt(unsafe { fcntl(fd, F_SETFD, flags | FD_CLOEXEC) }).map(|_| ())
}

/// Puts a descriptor into non-blocking mode. The flag sticks.
#[cfg_attr(not(any(target_os = "linux", target_os = "android")), allow(dead_code))]
pub(crate) fn sys_set_nonblock(fd: RawFd) -> io::Result<()> {
    let flags = cvt(unsafe { fcntl(fd, F_GETFL) })?;
    if flags & O_NONBLOCK != 0 {
        return Ok(());
    }
    cvt(unsafe { fcntl(fd, F_SETFL, flags | O_NONBLOCK) }).map(|_| ())
}

/// Duplicates a descriptor with close-on-exec set.
///
/// Uses `F_DUPFD_CLOEXEC` and falls back to `dup` + `FD_CLOEXEC` on kernels
/// that reject the atomic variant.
pub(crate) fn sys_dup_cloexec(fd: RawFd) -> io::Result<RawFd> {
    match cvt(unsafe { fcntl(fd, F_DUPFD_CLOEXEC, 0) }) {
        Ok(new) => Ok(new),
        Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
            let new = cvt(unsafe { dup(fd) })?;
            if let Err(e) = sys_set_cloexec(new) {
                let _ = sys_close(new);
                return Err(e);
            }
            Ok(new)
        }
        Err(e) => Err(e),
    }
}

/// Reads one native-endian `u64`, the unit of eventfd and timerfd.
#[cfg_attr(not(any(target_os = "linux", target_os = "android")), allow(dead_code))]
pub(crate) fn sys_read_u64(fd: RawFd) -> io::Result<u64> {
    let mut value: u64 = 0;
    let n = unsafe {
        libc::read(
            fd,
            &mut value as *mut u64 as *mut c_void,
            mem::size_of::<u64>(),
        )
    };

    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    if n as usize != mem::size_of::<u64>() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "short read of 8-byte counter",
        ));
    }
    Ok(value)
}

/// Reads whatever is available into `buf`.
#[cfg_attr(not(any(target_os = "linux", target_os = "android")), allow(dead_code))]
pub(crate) fn sys_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Writes one native-endian `u64`.
#[cfg_attr(not(any(target_os = "linux", target_os = "android")), allow(dead_code))]
pub(crate) fn sys_write_u64(fd: RawFd, value: u64) -> io::Result<()> {
    let n = unsafe {
        libc::write(
            fd,
            &value as *const u64 as *const c_void,
            mem::size_of::<u64>(),
        )
    };

    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
