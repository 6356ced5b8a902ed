#![allow(dead_code)]

use std::io::{self, Write};
use std::os::fd::RawFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use vigilis::{Backend, DefaultBackend, Events, Host};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// A connected socket pair: write to `.0`, watch `.1`.
pub fn pair() -> (UnixStream, UnixStream) {
    UnixStream::pair().expect("socketpair")
}

pub fn poke(stream: &mut UnixStream) {
    stream.write_all(b"x").expect("write to socket pair");
}

/// Host that counts every callback.
#[derive(Clone, Default)]
pub struct Tally {
    pub pinned: Arc<AtomicUsize>,
    pub released: Arc<AtomicUsize>,
    pub collected: Arc<AtomicUsize>,
}

impl Tally {
    pub fn pinned(&self) -> usize {
        self.pinned.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn collected(&self) -> usize {
        self.collected.load(Ordering::SeqCst)
    }
}

impl<T> Host<T> for Tally {
    fn pin(&self, _object: &T) {
        self.pinned.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self, _object: &T) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    fn collect(&self) {
        self.collected.fetch_add(1, Ordering::SeqCst);
    }
}

/// The default backend, counting syscalls and optionally failing the next
/// waits with `EINTR` after a nap, or the next creates and adds with `errno`.
#[derive(Clone, Default)]
pub struct Scripted {
    inner: DefaultBackend,
    ctl: Arc<AtomicUsize>,
    waits: Arc<AtomicUsize>,
    interrupts: Arc<AtomicUsize>,
    nap: Duration,
    failed_creates: Arc<AtomicUsize>,
    failed_adds: Arc<AtomicUsize>,
    errno: i32,
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl Scripted {
    /// Makes the next `count` waits sleep for `nap` and report `EINTR`.
    pub fn interrupting(count: usize, nap: Duration) -> Self {
        Self {
            interrupts: Arc::new(AtomicUsize::new(count)),
            nap,
            ..Self::default()
        }
    }

    /// Makes the next `count` creates fail with `errno`.
    pub fn failing_creates(count: usize, errno: i32) -> Self {
        Self {
            failed_creates: Arc::new(AtomicUsize::new(count)),
            errno,
            ..Self::default()
        }
    }

    /// Makes the next `count` adds fail with `errno`.
    pub fn failing_adds(count: usize, errno: i32) -> Self {
        Self {
            failed_adds: Arc::new(AtomicUsize::new(count)),
            errno,
            ..Self::default()
        }
    }

    pub fn wait_calls(&self) -> usize {
        self.waits.load(Ordering::SeqCst)
    }

    pub fn ctl_calls(&self) -> usize {
        self.ctl.load(Ordering::SeqCst)
    }

    pub fn pending_interrupts(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }
}

impl Backend for Scripted {
    type Record = <DefaultBackend as Backend>::Record;
    type Waker = <DefaultBackend as Backend>::Waker;

    const EMPTY: Self::Record = <DefaultBackend as Backend>::EMPTY;

    const CREATE: &'static str = <DefaultBackend as Backend>::CREATE;
    const CTL: &'static str = <DefaultBackend as Backend>::CTL;
    const WAIT: &'static str = <DefaultBackend as Backend>::WAIT;

    const SURVIVES_FORK: bool = <DefaultBackend as Backend>::SURVIVES_FORK;

    fn create(&self, cloexec: bool) -> io::Result<RawFd> {
        if take_one(&self.failed_creates) {
            return Err(io::Error::from_raw_os_error(self.errno));
        }
        self.inner.create(cloexec)
    }

    fn add(&self, queue: RawFd, fd: RawFd, events: Events, tag: u64) -> io::Result<()> {
        self.ctl.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.failed_adds) {
            return Err(io::Error::from_raw_os_error(self.errno));
        }
        self.inner.add(queue, fd, events, tag)
    }

    fn modify(
        &self,
        queue: RawFd,
        fd: RawFd,
        previous: Events,
        events: Events,
        tag: u64,
    ) -> io::Result<()> {
        self.ctl.fetch_add(1, Ordering::SeqCst);
        self.inner.modify(queue, fd, previous, events, tag)
    }

    fn delete(&self, queue: RawFd, fd: RawFd, previous: Events) -> io::Result<()> {
        self.ctl.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(queue, fd, previous)
    }

    fn wait(
        &self,
        queue: RawFd,
        records: &mut [Self::Record],
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        self.waits.fetch_add(1, Ordering::SeqCst);

        if take_one(&self.interrupts) {
            thread::sleep(self.nap);
            return Err(io::Error::from_raw_os_error(libc::EINTR));
        }

        self.inner.wait(queue, records, timeout)
    }

    fn decode(&self, record: &Self::Record) -> (u64, Events) {
        self.inner.decode(record)
    }

    fn waker(&self, queue: RawFd, tag: u64) -> io::Result<Self::Waker> {
        self.inner.waker(queue, tag)
    }

    fn wake(&self, queue: RawFd, waker: &Self::Waker) -> io::Result<()> {
        self.inner.wake(queue, waker)
    }

    fn drop_waker(&self, queue: RawFd, waker: Self::Waker) {
        self.inner.drop_waker(queue, waker)
    }
}
