//! Fork recovery. Every test here is serial: `after_fork` reaches every live
//! queue in the process.

mod common;

use common::{Tally, init_tracing, pair, poke};
use pretty_assertions::assert_eq;
use serial_test::serial;
use std::time::Duration;
use vigilis::{Error, Events, Queue, QueueBuilder, Timeout};

const SHORT: Duration = Duration::from_millis(200);

#[cfg(any(target_os = "linux", target_os = "android"))]
fn fd_is_open(fd: i32) -> bool {
    unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
}

#[test]
#[serial]
fn queue_is_recreated_on_next_use() {
    init_tracing();
    let tally = Tally::default();
    let queue: Queue<&str> = QueueBuilder::new().host(tally.clone()).open().unwrap();
    let (mut tx, rx) = pair();

    queue.register(&rx, "rx", Events::READABLE).unwrap();
    assert_eq!(tally.pinned(), 1);

    vigilis::after_fork();

    // Bookkeeping survives, the pin does not.
    assert!(queue.contains(&rx));
    assert_eq!(queue.events_for(&rx), Some(Events::READABLE));
    assert_eq!(tally.released(), 1);
    assert!(!queue.is_closed());

    // The fresh kernel set knows nothing about `rx` yet.
    poke(&mut tx);
    assert_eq!(queue.wait_events(8, Timeout::Immediate).unwrap(), vec![]);

    // Re-registering the same interest must not be skipped as redundant.
    queue.update(&rx, "rx", Events::READABLE).unwrap();
    assert_eq!(tally.pinned(), 2);

    let ready = queue.wait_events(8, SHORT).unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].1, "rx");

    queue.close().unwrap();
}

#[test]
#[serial]
fn duplicates_come_back_as_one_kernel_set() {
    init_tracing();
    let queue: Queue<&str> = Queue::open(true).unwrap();
    let dup = queue.duplicate().unwrap();
    let (mut tx, rx) = pair();

    vigilis::after_fork();

    queue.register(&rx, "rx", Events::READABLE).unwrap();
    poke(&mut tx);

    let ready = dup.wait_events(8, SHORT).unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].1, "rx");

    assert_ne!(queue.export_fd().unwrap(), dup.export_fd().unwrap());
}

#[test]
#[serial]
fn pending_queue_closes_without_a_syscall() {
    let queue: Queue<u32> = Queue::open(true).unwrap();

    vigilis::after_fork();

    queue.close().expect("close pending queue");
    assert!(queue.is_closed());
    assert!(matches!(queue.close(), Err(Error::Closed)));
}

#[test]
#[serial]
fn closed_queue_stays_closed() {
    let queue: Queue<u32> = Queue::open(true).unwrap();
    queue.close().unwrap();

    vigilis::after_fork();

    assert!(queue.is_closed());
    assert!(matches!(
        queue.wait_events(1, Timeout::Immediate),
        Err(Error::Closed)
    ));
}

#[cfg(any(target_os = "linux", target_os = "android"))]
#[test]
#[serial]
fn exported_descriptor_is_left_to_its_holder() {
    let queue: Queue<u32> = Queue::open(true).unwrap();
    let exported = queue.export_fd().unwrap();

    vigilis::after_fork();
    assert!(fd_is_open(exported));

    let fresh = queue.export_fd().unwrap();
    assert_ne!(fresh, exported);

    unsafe { libc::close(exported) };
    queue.close().unwrap();
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn open_fds() -> usize {
    std::fs::read_dir("/proc/self/fd")
        .expect("list /proc/self/fd")
        .count()
}

#[cfg(any(target_os = "linux", target_os = "android"))]
#[test]
#[serial]
fn inherited_descriptors_are_closed() {
    let queue: Queue<u32> = Queue::open(true).unwrap();
    let before = open_fds();

    vigilis::after_fork();

    // The epoll descriptor and its wake eventfd.
    assert_eq!(open_fds(), before - 2);

    queue.export_fd().unwrap();
    assert_eq!(open_fds(), before);
    queue.close().unwrap();
}

#[test]
#[serial]
fn real_fork_child_gets_a_working_queue() {
    init_tracing();
    let queue: Queue<&str> = Queue::open(true).unwrap();
    let (mut tx, rx) = pair();
    queue.register(&rx, "rx", Events::READABLE).unwrap();

    match unsafe { libc::fork() } {
        -1 => panic!("fork failed: {}", std::io::Error::last_os_error()),
        0 => {
            vigilis::after_fork();

            let ok = queue.register(&rx, "rx", Events::READABLE).is_ok()
                && {
                    poke(&mut tx);
                    matches!(queue.wait_events(8, SHORT), Ok(ready) if ready.len() == 1)
                };

            unsafe { libc::_exit(if ok { 0 } else { 1 }) };
        }
        child => {
            let mut status = 0;
            let rc = unsafe { libc::waitpid(child, &mut status, 0) };
            assert_eq!(rc, child);
            assert!(libc::WIFEXITED(status));
            assert_eq!(libc::WEXITSTATUS(status), 0, "child saw a broken queue");

            // The child's byte is still there, and the parent's set is intact.
            let ready = queue.wait_events(8, SHORT).unwrap();
            assert_eq!(ready.len(), 1);
            assert_eq!(ready[0].1, "rx");
        }
    }
}
