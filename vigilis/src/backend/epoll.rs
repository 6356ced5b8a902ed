//! Linux `epoll` backend.
//!
//! Interest is a bitmask and the kernel hands back one record per ready
//! descriptor per call, carrying the 64-bit tag given at registration.
//! The wake source is an `eventfd` registered level-triggered, so every
//! waiter on the kernel set keeps seeing it until it is released.

use super::Backend;
use super::unix::{cvt, sys_close, sys_write_u64};
use crate::events::Events;

use libc::{
    EFD_CLOEXEC, EFD_NONBLOCK, EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD,
    EPOLLERR, EPOLLET, EPOLLEXCLUSIVE, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLPRI,
    EPOLLRDHUP, EPOLLWAKEUP, epoll_create1, epoll_ctl, epoll_event, epoll_wait, eventfd,
};
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Generic flag / native flag pairs.
const FLAG_MAP: [(Events, u32); 10] = [
    (Events::READABLE, EPOLLIN as u32),
    (Events::PRIORITY, EPOLLPRI as u32),
    (Events::WRITABLE, EPOLLOUT as u32),
    (Events::ERROR, EPOLLERR as u32),
    (Events::HANGUP, EPOLLHUP as u32),
    (Events::READ_HANGUP, EPOLLRDHUP as u32),
    (Events::EXCLUSIVE, EPOLLEXCLUSIVE as u32),
    (Events::WAKEUP, EPOLLWAKEUP as u32),
    (Events::ONESHOT, EPOLLONESHOT as u32),
    (Events::EDGE, EPOLLET as u32),
];

/// Generic flags to the kernel bitmask. Unnamed bits pass through.
pub(crate) fn to_native(events: Events) -> u32 {
    let mut native = events.difference(Events::all()).bits();
    for (generic, bits) in FLAG_MAP {
        if events.contains(generic) {
            native |= bits;
        }
    }
    native
}

/// Kernel bitmask to generic flags. Unnamed bits pass through.
pub(crate) fn from_native(native: u32) -> Events {
    let mut known = 0;
    let mut events = Events::empty();
    for (generic, bits) in FLAG_MAP {
        known |= bits;
        if native & bits != 0 {
            events |= generic;
        }
    }
    events | Events::from_raw(native & !known)
}

/// Rounds up so a sub-millisecond remainder still sleeps instead of spinning.
fn timeout_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(d) => d.as_nanos().div_ceil(1_000_000).min(i32::MAX as u128) as i32,
    }
}

/// Wake source: an `eventfd` watched for readability.
#[derive(Debug)]
pub struct EventWaker(RawFd);

/// The Linux `epoll` facility.
#[derive(Clone, Copy, Debug, Default)]
pub struct Epoll;

impl Epoll {
    fn ctl(&self, queue: RawFd, op: i32, fd: RawFd, events: u32, tag: u64) -> io::Result<()> {
        let mut event = epoll_event { events, u64: tag };
        cvt(unsafe { epoll_ctl(queue, op, fd, &mut event) }).map(|_| ())
    }
}

impl Backend for Epoll {
    type Record = epoll_event;
    type Waker = EventWaker;

    const EMPTY: epoll_event = epoll_event { events: 0, u64: 0 };

    const CREATE: &'static str = "epoll_create1";
    const CTL: &'static str = "epoll_ctl";
    const WAIT: &'static str = "epoll_wait";

    fn create(&self, cloexec: bool) -> io::Result<RawFd> {
        let flags = if cloexec { EPOLL_CLOEXEC } else { 0 };
        cvt(unsafe { epoll_create1(flags) })
    }

    fn add(&self, queue: RawFd, fd: RawFd, events: Events, tag: u64) -> io::Result<()> {
        self.ctl(queue, EPOLL_CTL_ADD, fd, to_native(events), tag)
    }

    fn modify(
        &self,
        queue: RawFd,
        fd: RawFd,
        _previous: Events,
        events: Events,
        tag: u64,
    ) -> io::Result<()> {
        self.ctl(queue, EPOLL_CTL_MOD, fd, to_native(events), tag)
    }

    fn delete(&self, queue: RawFd, fd: RawFd, _previous: Events) -> io::Result<()> {
        self.ctl(queue, EPOLL_CTL_DEL, fd, 0, 0)
    }

    fn wait(
        &self,
        queue: RawFd,
        records: &mut [epoll_event],
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let max = records.len().min(i32::MAX as usize) as i32;
        let n = unsafe { epoll_wait(queue, records.as_mut_ptr(), max, timeout_ms(timeout)) };
        cvt(n).map(|n| n as usize)
    }

    fn decode(&self, record: &epoll_event) -> (u64, Events) {
        // Copy out of the packed struct before use.
        let tag = record.u64;
        let native = record.events;
        (tag, from_native(native))
    }

    fn waker(&self, queue: RawFd, tag: u64) -> io::Result<EventWaker> {
        let fd = cvt(unsafe { eventfd(0, EFD_NONBLOCK | EFD_CLOEXEC) })?;

        if let Err(e) = self.ctl(queue, EPOLL_CTL_ADD, fd, EPOLLIN as u32, tag) {
            let _ = sys_close(fd);
            return Err(e);
        }

        Ok(EventWaker(fd))
    }

    fn wake(&self, _queue: RawFd, waker: &EventWaker) -> io::Result<()> {
        sys_write_u64(waker.0, 1)
    }

    fn drop_waker(&self, _queue: RawFd, waker: EventWaker) {
        // Closing the eventfd drops its registration from every kernel set.
        let _ = sys_close(waker.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalization_is_lossless_for_named_flags() {
        for (generic, native) in FLAG_MAP {
            assert_eq!(to_native(generic), native);
            assert_eq!(from_native(native), generic);
        }

        let all = Events::READABLE | Events::WRITABLE | Events::EDGE | Events::ONESHOT;
        assert_eq!(from_native(to_native(all)), all);
    }

    #[test]
    fn unknown_kernel_bits_pass_through() {
        let unknown = 1 << 20;
        let events = from_native(EPOLLIN as u32 | unknown);
        assert!(events.is_readable());
        assert_eq!(events.bits() & unknown, unknown);
        assert_eq!(to_native(events), EPOLLIN as u32 | unknown);
    }

    #[test]
    fn timeout_rounds_up() {
        assert_eq!(timeout_ms(None), -1);
        assert_eq!(timeout_ms(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_ms(Some(Duration::from_micros(1))), 1);
        assert_eq!(timeout_ms(Some(Duration::from_millis(1500))), 1500);
        assert_eq!(timeout_ms(Some(Duration::from_secs(u64::MAX))), i32::MAX);
    }

    #[test]
    fn waker_makes_wait_return() {
        let epoll = Epoll;
        let queue = epoll.create(true).unwrap();
        let waker = epoll.waker(queue, 7).unwrap();

        let mut records = [Epoll::EMPTY; 4];
        assert_eq!(
            epoll
                .wait(queue, &mut records, Some(Duration::ZERO))
                .unwrap(),
            0
        );

        epoll.wake(queue, &waker).unwrap();
        let n = epoll.wait(queue, &mut records, None).unwrap();
        assert_eq!(n, 1);

        let (tag, events) = epoll.decode(&records[0]);
        assert_eq!(tag, 7);
        assert!(events.is_readable());

        epoll.drop_waker(queue, waker);
        sys_close(queue).unwrap();
    }
}
