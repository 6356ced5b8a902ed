//! Interest and readiness flags, and wait timeouts.
//!
//! [`Events`] is the backend-independent flag model. It is used both to
//! describe what a descriptor is watched for and to report what happened.
//! Backends translate it to their native encoding right before a syscall and
//! back again on delivery.

use crate::error::{Error, Result};

use std::time::{Duration, Instant};

bitflags::bitflags! {
    /// Interest / readiness flags.
    ///
    /// The numeric values mirror Linux's epoll numbering. Bits this type
    /// does not name are retained, so flags added by newer kernels reach
    /// the caller untouched.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Events: u32 {
        /// Data is available to read.
        const READABLE = 0x0001;
        /// Urgent (out-of-band) data is available.
        const PRIORITY = 0x0002;
        /// Writing will not block.
        const WRITABLE = 0x0004;
        /// Error condition. Always reported, no need to ask for it.
        const ERROR = 0x0008;
        /// Hang up. Always reported, no need to ask for it.
        const HANGUP = 0x0010;
        /// Peer shut down its writing half.
        const READ_HANGUP = 0x2000;
        /// Wake only one of several queues watching the same descriptor.
        const EXCLUSIVE = 1 << 28;
        /// Hold off system suspend while the event is pending.
        const WAKEUP = 1 << 29;
        /// Disable the registration once it fired.
        const ONESHOT = 1 << 30;
        /// Report transitions only.
        const EDGE = 1 << 31;
    }
}

impl Events {
    /// Keeps bits from the kernel whether or not they are named here.
    #[inline]
    pub fn from_raw(bits: u32) -> Self {
        Self::from_bits_retain(bits)
    }

    #[inline]
    pub fn is_readable(self) -> bool {
        self.contains(Self::READABLE)
    }

    #[inline]
    pub fn is_writable(self) -> bool {
        self.contains(Self::WRITABLE)
    }

    #[inline]
    pub fn is_oneshot(self) -> bool {
        self.contains(Self::ONESHOT)
    }

    /// Hang-up or error: the descriptor will not become useful again.
    #[inline]
    pub fn is_closed(self) -> bool {
        self.intersects(Self::HANGUP | Self::ERROR)
    }
}

/// How long a `wait` may block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Timeout {
    /// Block until an event arrives.
    #[default]
    Forever,
    /// Poll once without blocking.
    Immediate,
    /// Block at most this long.
    After(Duration),
}

impl Timeout {
    /// Integer milliseconds; negative values are rejected.
    pub fn from_millis(ms: i64) -> Result<Self> {
        match ms {
            ..0 => Err(Error::InvalidArgument("timeout must not be negative")),
            0 => Ok(Self::Immediate),
            _ => Ok(Self::After(Duration::from_millis(ms as u64))),
        }
    }

    /// Absolute deadline for a finite, non-zero timeout.
    pub(crate) fn deadline(self, now: Instant) -> Option<Instant> {
        match self {
            Self::After(d) if !d.is_zero() => now.checked_add(d),
            _ => None,
        }
    }

    /// Relative value handed to the backend, `None` meaning forever.
    pub(crate) fn as_duration(self) -> Option<Duration> {
        match self {
            Self::Forever => None,
            Self::Immediate => Some(Duration::ZERO),
            Self::After(d) => Some(d),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        if d.is_zero() {
            Self::Immediate
        } else {
            Self::After(d)
        }
    }
}

impl From<Option<Duration>> for Timeout {
    fn from(d: Option<Duration>) -> Self {
        d.map_or(Self::Forever, Self::from)
    }
}
