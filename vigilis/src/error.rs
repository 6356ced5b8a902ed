//! Error types surfaced by queues and auxiliary descriptors.
//!
//! Every failed kernel call carries the name of the operation that failed
//! together with the underlying [`io::Error`], so callers can log or retry
//! at a higher level without guessing where the failure came from.

use std::io;

use thiserror::Error;

/// Errors produced by this crate.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A kernel call failed.
    #[error("{op} failed: {source}")]
    Syscall {
        /// Name of the failing syscall, e.g. `"epoll_ctl"`.
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// The queue's kernel object is closed.
    #[error("queue is closed")]
    Closed,

    /// An argument was rejected before reaching the kernel.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The kernel ran out of descriptors or memory.
    ///
    /// Descriptor-allocating calls retry once after hinting the host
    /// collector and report this in the log. When the retry fails too the
    /// caller sees [`Error::Syscall`].
    #[error("{op} exhausted kernel resources: {source}")]
    ResourceExhausted {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

impl Error {
    #[inline]
    pub(crate) fn syscall(op: &'static str, source: io::Error) -> Self {
        Self::Syscall { op, source }
    }

    /// Wraps `errno` from the last failed call.
    #[cfg_attr(not(any(target_os = "linux", target_os = "android")), allow(dead_code))]
    #[inline]
    pub(crate) fn last_os(op: &'static str) -> Self {
        Self::syscall(op, io::Error::last_os_error())
    }

    /// Raw OS error code, if this error came from the kernel.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Syscall { source, .. } | Self::ResourceExhausted { source, .. } => {
                source.raw_os_error()
            }
            _ => None,
        }
    }

    /// Name of the failing kernel operation, if any.
    pub fn op(&self) -> Option<&'static str> {
        match self {
            Self::Syscall { op, .. } | Self::ResourceExhausted { op, .. } => Some(op),
            _ => None,
        }
    }
}

/// EMFILE, ENFILE and ENOMEM are the only failures worth a collector pass.
pub(crate) fn is_exhaustion(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOMEM)
    )
}

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_is_classified() {
        assert!(is_exhaustion(&io::Error::from_raw_os_error(libc::EMFILE)));
        assert!(is_exhaustion(&io::Error::from_raw_os_error(libc::ENOMEM)));
        assert!(!is_exhaustion(&io::Error::from_raw_os_error(libc::EINVAL)));

        let err = Error::ResourceExhausted {
            op: "epoll_create1",
            source: io::Error::from_raw_os_error(libc::ENFILE),
        };
        assert_eq!(err.errno(), Some(libc::ENFILE));
        assert_eq!(err.op(), Some("epoll_create1"));
    }

    #[test]
    fn messages_name_the_operation() {
        let err = Error::syscall("epoll_ctl", io::Error::from_raw_os_error(libc::EBADF));
        assert!(err.to_string().starts_with("epoll_ctl failed"));
        assert_eq!(Error::Closed.to_string(), "queue is closed");
        assert_eq!(Error::Closed.errno(), None);
    }
}
