//! Single-purpose notification descriptors.
//!
//! Every type here is a plain readable descriptor that can be registered
//! with a [`Queue`](crate::Queue) like any socket. Only their minimal
//! read/write contract is provided: inotify records come back as raw bytes,
//! and signal numbers are plain integers.

mod eventfd;
mod inotify;
mod signalfd;
mod timerfd;

pub use eventfd::{EventFd, EventFdFlags};
pub use inotify::{Inotify, InotifyFlags, WatchDescriptor, WatchMask};
pub use signalfd::{SigInfo, SigSet, SignalFd, SignalFdFlags};
pub use timerfd::{ClockId, TimerFd, TimerFdFlags, TimerSetFlags, TimerSpec};

use crate::backend::unix::cvt;
use crate::error::{Error, Result, is_exhaustion};

use libc::c_int;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use tracing::warn;

/// Runs `call`, retrying once after `collect` when the process or the
/// system ran out of descriptors or memory.
fn call_retrying(
    op: &'static str,
    collect: impl FnOnce(),
    mut call: impl FnMut() -> c_int,
) -> Result<c_int> {
    match cvt(call()) {
        Err(source) if is_exhaustion(&source) => {
            let first = Error::ResourceExhausted { op, source };
            warn!(error = %first, "collecting and retrying once");
            collect();
            cvt(call())
        }
        other => other,
    }
    .map_err(|source| Error::syscall(op, source))
}

/// Like [`call_retrying`], taking ownership of the new descriptor.
fn create_retrying(
    op: &'static str,
    collect: impl FnOnce(),
    create: impl FnMut() -> c_int,
) -> Result<OwnedFd> {
    let fd = call_retrying(op, collect, create)?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// `EAGAIN` on a non-blocking read means there was nothing to read.
fn would_block<R>(result: io::Result<R>, op: &'static str) -> Result<Option<R>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(source) => Err(Error::syscall(op, source)),
    }
}
