#![cfg(any(target_os = "linux", target_os = "android"))]

mod common;

use common::init_tracing;
use std::time::Duration;
use vigilis::notify::{
    ClockId, EventFd, EventFdFlags, Inotify, InotifyFlags, SigSet, SignalFd, SignalFdFlags,
    TimerFd, TimerFdFlags, TimerSetFlags, WatchMask,
};
use vigilis::{Events, Queue, Timeout};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Source {
    Counter,
    Timer,
    Watch,
    Signal,
}

#[test]
fn counter_and_timer_wake_a_queue() {
    init_tracing();
    let queue: Queue<Source> = Queue::open(true).unwrap();

    let efd = EventFd::new(0, EventFdFlags::CLOEXEC | EventFdFlags::NONBLOCK).unwrap();
    let tfd = TimerFd::new(ClockId::Monotonic, TimerFdFlags::CLOEXEC | TimerFdFlags::NONBLOCK)
        .unwrap();

    queue.register(&efd, Source::Counter, Events::READABLE).unwrap();
    queue.register(&tfd, Source::Timer, Events::READABLE).unwrap();
    assert_eq!(queue.wait_events(8, Timeout::Immediate).unwrap().len(), 0);

    efd.incr(5).unwrap();
    let ready = queue.wait_events(8, Duration::from_millis(200)).unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].1, Source::Counter);
    assert_eq!(efd.try_value().unwrap(), Some(5));

    tfd.settime(TimerSetFlags::empty(), Duration::ZERO, Duration::from_millis(10))
        .unwrap();
    let ready = queue.wait_events(8, Duration::from_secs(2)).unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].1, Source::Timer);
    assert_eq!(tfd.try_expirations().unwrap(), Some(1));

    assert_eq!(queue.wait_events(8, Timeout::Immediate).unwrap().len(), 0);
}

#[test]
fn periodic_timer_accumulates() {
    let tfd = TimerFd::new(ClockId::Monotonic, TimerFdFlags::CLOEXEC).unwrap();
    let period = Duration::from_millis(5);
    tfd.settime(TimerSetFlags::empty(), period, period).unwrap();

    std::thread::sleep(Duration::from_millis(50));
    assert!(tfd.expirations().unwrap() >= 2);

    let setting = tfd.gettime().unwrap();
    assert_eq!(setting.interval, period);
}

#[test]
fn watch_and_signal_wake_a_queue() {
    init_tracing();
    let queue: Queue<Source> = Queue::open(true).unwrap();
    let dir = tempfile::tempdir().expect("temp dir");

    let inotify = Inotify::new(InotifyFlags::CLOEXEC | InotifyFlags::NONBLOCK).unwrap();
    inotify.add_watch(dir.path(), WatchMask::CREATE).unwrap();

    // The mask and the raised signal belong to this test's thread.
    let usr1 = SigSet::from_signals(&[libc::SIGUSR1]).unwrap();
    usr1.block().unwrap();
    let sfd = SignalFd::new(&usr1, SignalFdFlags::CLOEXEC | SignalFdFlags::NONBLOCK).unwrap();

    queue.register(&inotify, Source::Watch, Events::READABLE).unwrap();
    queue.register(&sfd, Source::Signal, Events::READABLE).unwrap();
    assert_eq!(queue.wait_events(8, Timeout::Immediate).unwrap().len(), 0);

    std::fs::write(dir.path().join("created"), b"").unwrap();
    let ready = queue.wait_events(8, Duration::from_secs(2)).unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].1, Source::Watch);

    let mut buf = [0u8; 1024];
    assert!(inotify.try_read(&mut buf).unwrap().is_some());

    assert_eq!(unsafe { libc::raise(libc::SIGUSR1) }, 0);
    let ready = queue.wait_events(8, Duration::from_secs(2)).unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].1, Source::Signal);
    assert_eq!(sfd.try_take().unwrap().unwrap().signo(), libc::SIGUSR1 as u32);

    assert_eq!(queue.wait_events(8, Timeout::Immediate).unwrap().len(), 0);
    usr1.unblock().unwrap();
}
