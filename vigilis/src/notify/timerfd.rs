use super::{create_retrying, would_block};
use crate::backend::unix::{sys_read_u64, sys_set_nonblock};
use crate::descriptor::AsDescriptor;
use crate::error::{Error, Result};

use libc::{
    CLOCK_BOOTTIME, CLOCK_MONOTONIC, CLOCK_REALTIME, TFD_CLOEXEC, TFD_NONBLOCK, TFD_TIMER_ABSTIME,
    itimerspec, timespec,
};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::time::Duration;

/// Clock a [`TimerFd`] counts against.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClockId {
    /// Wall clock; jumps when the system time is set.
    Realtime,
    #[default]
    Monotonic,
    /// Monotonic, and keeps counting while suspended.
    Boottime,
}

impl ClockId {
    fn raw(self) -> libc::clockid_t {
        match self {
            Self::Realtime => CLOCK_REALTIME,
            Self::Monotonic => CLOCK_MONOTONIC,
            Self::Boottime => CLOCK_BOOTTIME,
        }
    }
}

bitflags::bitflags! {
    /// Creation flags for [`TimerFd`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct TimerFdFlags: i32 {
        const CLOEXEC = TFD_CLOEXEC;
        const NONBLOCK = TFD_NONBLOCK;
    }
}

bitflags::bitflags! {
    /// Flags for [`TimerFd::settime`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct TimerSetFlags: i32 {
        /// `value` is an absolute point on the timer's clock.
        const ABSTIME = TFD_TIMER_ABSTIME;
    }
}

/// Timer setting: first expiration and period.
///
/// A zero `value` means disarmed, a zero `interval` a single expiration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimerSpec {
    pub interval: Duration,
    pub value: Duration,
}

fn to_timespec(d: Duration) -> timespec {
    timespec {
        tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: d.subsec_nanos() as _,
    }
}

fn from_timespec(ts: &timespec) -> Duration {
    Duration::new(ts.tv_sec.max(0) as u64, ts.tv_nsec.clamp(0, 999_999_999) as u32)
}

impl From<&itimerspec> for TimerSpec {
    fn from(its: &itimerspec) -> Self {
        Self {
            interval: from_timespec(&its.it_interval),
            value: from_timespec(&its.it_value),
        }
    }
}

/// A kernel timer delivering expirations through a descriptor.
#[derive(Debug)]
pub struct TimerFd {
    fd: OwnedFd,
}

impl TimerFd {
    pub fn new(clock: ClockId, flags: TimerFdFlags) -> Result<Self> {
        Self::with_collector(clock, flags, || {})
    }

    /// Like [`new`](TimerFd::new), calling `collect` before the single retry
    /// on descriptor exhaustion.
    pub fn with_collector(
        clock: ClockId,
        flags: TimerFdFlags,
        collect: impl FnOnce(),
    ) -> Result<Self> {
        let fd = create_retrying("timerfd_create", collect, || unsafe {
            libc::timerfd_create(clock.raw(), flags.bits())
        })?;
        Ok(Self { fd })
    }

    /// Arms the timer, or disarms it with a zero `value`, returning the
    /// previous setting.
    pub fn settime(
        &self,
        flags: TimerSetFlags,
        interval: Duration,
        value: Duration,
    ) -> Result<TimerSpec> {
        let new = itimerspec {
            it_interval: to_timespec(interval),
            it_value: to_timespec(value),
        };
        let mut old = itimerspec {
            it_interval: to_timespec(Duration::ZERO),
            it_value: to_timespec(Duration::ZERO),
        };

        let rc =
            unsafe { libc::timerfd_settime(self.fd.as_raw_fd(), flags.bits(), &new, &mut old) };
        if rc == -1 {
            return Err(Error::last_os("timerfd_settime"));
        }
        Ok(TimerSpec::from(&old))
    }

    /// Current setting, `value` being the time left to the next expiration.
    pub fn gettime(&self) -> Result<TimerSpec> {
        let mut curr = itimerspec {
            it_interval: to_timespec(Duration::ZERO),
            it_value: to_timespec(Duration::ZERO),
        };

        let rc = unsafe { libc::timerfd_gettime(self.fd.as_raw_fd(), &mut curr) };
        if rc == -1 {
            return Err(Error::last_os("timerfd_gettime"));
        }
        Ok(TimerSpec::from(&curr))
    }

    /// Expirations since the last read, blocking until there is one.
    pub fn expirations(&self) -> Result<u64> {
        sys_read_u64(self.fd.as_raw_fd()).map_err(|e| Error::syscall("read", e))
    }

    /// Expirations since the last read, `None` if there were none.
    ///
    /// Switches the descriptor to non-blocking mode for good.
    pub fn try_expirations(&self) -> Result<Option<u64>> {
        let fd = self.fd.as_raw_fd();
        sys_set_nonblock(fd).map_err(|e| Error::syscall("fcntl", e))?;
        would_block(sys_read_u64(fd), "read")
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for TimerFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsDescriptor for TimerFd {
    fn descriptor(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl From<TimerFd> for OwnedFd {
    fn from(timerfd: TimerFd) -> OwnedFd {
        timerfd.fd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disarmed_timer_has_no_expirations() {
        let tfd = TimerFd::new(ClockId::Monotonic, TimerFdFlags::CLOEXEC).unwrap();
        assert_eq!(tfd.gettime().unwrap(), TimerSpec::default());
        assert_eq!(tfd.try_expirations().unwrap(), None);
    }

    #[test]
    fn settime_returns_previous_setting() {
        let tfd = TimerFd::new(ClockId::Monotonic, TimerFdFlags::empty()).unwrap();
        let interval = Duration::from_secs(10);

        let old = tfd
            .settime(TimerSetFlags::empty(), interval, Duration::from_secs(60))
            .unwrap();
        assert_eq!(old, TimerSpec::default());

        let now = tfd.gettime().unwrap();
        assert_eq!(now.interval, interval);
        assert!(now.value > Duration::from_secs(50));

        let old = tfd
            .settime(TimerSetFlags::empty(), Duration::ZERO, Duration::ZERO)
            .unwrap();
        assert_eq!(old.interval, interval);
    }

    #[test]
    fn expires() {
        let tfd = TimerFd::new(ClockId::Monotonic, TimerFdFlags::CLOEXEC).unwrap();
        tfd.settime(TimerSetFlags::empty(), Duration::ZERO, Duration::from_millis(1))
            .unwrap();

        assert_eq!(tfd.expirations().unwrap(), 1);
    }
}
