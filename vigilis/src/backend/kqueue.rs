//! BSD / macOS `kqueue` backend.
//!
//! kqueue watches typed filters rather than a bitmask: readability and
//! writability of one descriptor are two separate registrations, each
//! carrying the same opaque tag in `udata`. Changes are submitted right away
//! with one `kevent(2)` call per filter, so the change list never has to be
//! carried over to the next wait.
//!
//! # Event Types
//!
//! - Read events (`EVFILT_READ`): data is available, or EOF was reached
//! - Write events (`EVFILT_WRITE`): the descriptor accepts writes
//! - User events (`EVFILT_USER`): the per-queue wake source
//!
//! An interest mask needs at least one of readable or writable; kqueue has
//! no registration that only reports errors. Record flags without a generic
//! name are delivered shifted left by 14 bits, in the range
//! [`Events`] leaves unnamed.

use super::Backend;
use super::unix::{cvt, sys_set_cloexec};
use crate::events::Events;

use libc::{
    EV_ADD, EV_CLEAR, EV_DELETE, EV_DISABLE, EV_ENABLE, EV_EOF, EV_ERROR, EV_ONESHOT, EVFILT_READ,
    EVFILT_USER, EVFILT_WRITE, NOTE_TRIGGER, kevent, kqueue, timespec,
};
use std::os::fd::RawFd;
use std::time::Duration;
use std::{io, mem, ptr};

/// A raw `struct kevent`.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct Kevent(kevent);

// `udata` only ever carries an integer tag, never a live pointer.
unsafe impl Send for Kevent {}

impl Kevent {
    fn new(ident: usize, filter: i16, flags: u16, fflags: u32, tag: u64) -> Self {
        let mut raw: kevent = unsafe { mem::zeroed() };
        raw.ident = ident as _;
        raw.filter = filter as _;
        raw.flags = flags as _;
        raw.fflags = fflags as _;
        raw.udata = tag as usize as _;
        Self(raw)
    }

    fn filter(&self) -> i16 {
        self.0.filter as i16
    }

    fn flags(&self) -> u16 {
        self.0.flags as u16
    }

    fn tag(&self) -> u64 {
        self.0.udata as usize as u64
    }

    /// Submits this single change.
    fn apply(&self, queue: RawFd) -> io::Result<()> {
        let rc = unsafe { kevent(queue, &self.0, 1, ptr::null_mut(), 0, ptr::null()) };
        cvt(rc).map(|_| ())
    }
}

/// Input-only action bits, never meaningful in a delivered record.
const ACTIONS: u16 = (EV_ADD | EV_DELETE | EV_ENABLE | EV_DISABLE) as u16;

/// Record flags with a generic counterpart.
const NAMED: u16 = (EV_EOF | EV_ERROR | EV_ONESHOT | EV_CLEAR) as u16;

/// Where unnamed record flags land in [`Events`]: bits 14 to 27.
const FOREIGN_SHIFT: u32 = 14;

fn registration_flags(events: Events) -> u16 {
    let mut flags = (EV_ADD | EV_ENABLE) as u16;
    if events.contains(Events::ONESHOT) {
        flags |= EV_ONESHOT as u16;
    }
    if events.contains(Events::EDGE) {
        flags |= EV_CLEAR as u16;
    }
    flags
}

/// The filters an interest mask maps to.
fn filters(events: Events) -> impl Iterator<Item = i16> {
    let read = events.intersects(Events::READABLE | Events::PRIORITY | Events::READ_HANGUP);
    let write = events.contains(Events::WRITABLE);
    [(read, EVFILT_READ as i16), (write, EVFILT_WRITE as i16)]
        .into_iter()
        .filter_map(|(wanted, filter)| wanted.then_some(filter))
}

fn is_enoent(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENOENT)
}

/// Filters for `events`, failing with `EINVAL` when there are none.
fn wanted_filters(events: Events) -> io::Result<Vec<i16>> {
    let wanted: Vec<i16> = filters(events).collect();
    if wanted.is_empty() {
        return Err(io::Error::from_raw_os_error(libc::EINVAL));
    }
    Ok(wanted)
}

/// The BSD `kqueue` facility.
#[derive(Clone, Copy, Debug, Default)]
pub struct Kqueue;

impl Kqueue {
    fn delete_filter(&self, queue: RawFd, fd: RawFd, filter: i16) -> io::Result<()> {
        Kevent::new(fd as usize, filter, EV_DELETE as u16, 0, 0).apply(queue)
    }

    /// Adds `wanted` one filter at a time. When one fails, the filters this
    /// call added are deleted again; those listed in `existing` are kept.
    fn add_filters(
        &self,
        queue: RawFd,
        fd: RawFd,
        wanted: &[i16],
        existing: &[i16],
        flags: u16,
        tag: u64,
    ) -> io::Result<()> {
        for (applied, &filter) in wanted.iter().enumerate() {
            if let Err(e) = Kevent::new(fd as usize, filter, flags, 0, tag).apply(queue) {
                for &added in wanted[..applied].iter().filter(|f| !existing.contains(f)) {
                    let _ = self.delete_filter(queue, fd, added);
                }
                return Err(e);
            }
        }
        Ok(())
    }
}

impl Backend for Kqueue {
    type Record = Kevent;
    type Waker = usize;

    const EMPTY: Kevent = Kevent(unsafe { mem::zeroed() });

    const CREATE: &'static str = "kqueue";
    const CTL: &'static str = "kevent";
    const WAIT: &'static str = "kevent";

    const SURVIVES_FORK: bool = false;

    fn create(&self, cloexec: bool) -> io::Result<RawFd> {
        let fd = cvt(unsafe { kqueue() })?;
        if cloexec {
            if let Err(e) = sys_set_cloexec(fd) {
                let _ = self.close(fd);
                return Err(e);
            }
        }
        Ok(fd)
    }

    fn add(&self, queue: RawFd, fd: RawFd, events: Events, tag: u64) -> io::Result<()> {
        let wanted = wanted_filters(events)?;
        self.add_filters(queue, fd, &wanted, &[], registration_flags(events), tag)
    }

    fn modify(
        &self,
        queue: RawFd,
        fd: RawFd,
        previous: Events,
        events: Events,
        tag: u64,
    ) -> io::Result<()> {
        let wanted = wanted_filters(events)?;
        let existing: Vec<i16> = filters(previous).collect();
        self.add_filters(queue, fd, &wanted, &existing, registration_flags(events), tag)?;

        for &filter in existing.iter().filter(|f| !wanted.contains(f)) {
            match self.delete_filter(queue, fd, filter) {
                Err(e) if !is_enoent(&e) => return Err(e),
                _ => {}
            }
        }
        Ok(())
    }

    fn delete(&self, queue: RawFd, fd: RawFd, _previous: Events) -> io::Result<()> {
        // A oneshot filter may already be gone, so both are always tried.
        let mut removed = false;
        for filter in [EVFILT_READ as i16, EVFILT_WRITE as i16] {
            match self.delete_filter(queue, fd, filter) {
                Ok(()) => removed = true,
                Err(e) if is_enoent(&e) => {}
                Err(e) => return Err(e),
            }
        }

        if removed {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(libc::ENOENT))
        }
    }

    fn wait(
        &self,
        queue: RawFd,
        records: &mut [Kevent],
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let ts = timeout.map(|d| timespec {
            tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: d.subsec_nanos() as _,
        });
        let ts_ptr = ts.as_ref().map_or(ptr::null(), |t| t as *const timespec);
        let max = records.len().min(i32::MAX as usize) as i32;

        let n = unsafe {
            kevent(
                queue,
                ptr::null(),
                0,
                records.as_mut_ptr() as *mut kevent,
                max as _,
                ts_ptr,
            )
        };
        cvt(n).map(|n| n as usize)
    }

    fn decode(&self, record: &Kevent) -> (u64, Events) {
        let mut events = Events::empty();
        let filter = record.filter();

        if filter == EVFILT_READ as i16 || filter == EVFILT_USER as i16 {
            events |= Events::READABLE;
        } else if filter == EVFILT_WRITE as i16 {
            events |= Events::WRITABLE;
        }

        let flags = record.flags();
        if flags & EV_EOF as u16 != 0 {
            events |= Events::HANGUP;
            if filter == EVFILT_READ as i16 {
                events |= Events::READ_HANGUP;
            }
        }
        if flags & EV_ERROR as u16 != 0 {
            events |= Events::ERROR;
        }
        if flags & EV_ONESHOT as u16 != 0 {
            events |= Events::ONESHOT;
        }
        if flags & EV_CLEAR as u16 != 0 {
            events |= Events::EDGE;
        }

        let foreign = flags & !(ACTIONS | NAMED);
        events |= Events::from_raw(u32::from(foreign) << FOREIGN_SHIFT);

        (record.tag(), events)
    }

    fn waker(&self, queue: RawFd, tag: u64) -> io::Result<usize> {
        let ident = tag as usize;
        Kevent::new(ident, EVFILT_USER as i16, (EV_ADD | EV_ENABLE) as u16, 0, tag)
            .apply(queue)?;
        Ok(ident)
    }

    fn wake(&self, queue: RawFd, waker: &usize) -> io::Result<()> {
        Kevent::new(*waker, EVFILT_USER as i16, 0, NOTE_TRIGGER as u32, *waker as u64)
            .apply(queue)
    }

    fn drop_waker(&self, queue: RawFd, waker: usize) {
        let _ = Kevent::new(waker, EVFILT_USER as i16, EV_DELETE as u16, 0, 0).apply(queue);
    }
}
