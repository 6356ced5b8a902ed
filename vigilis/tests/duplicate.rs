mod common;

use common::{Tally, pair, poke};
use pretty_assertions::assert_eq;
use std::thread;
use std::time::Duration;
use vigilis::{Events, Queue, QueueBuilder, Timeout};

const SHORT: Duration = Duration::from_millis(200);

#[test]
fn duplicates_share_the_interest_table() {
    let queue: Queue<&str> = Queue::open(true).unwrap();
    let dup = queue.duplicate().expect("duplicate");
    let (_tx, rx) = pair();

    assert_ne!(queue.export_fd().unwrap(), dup.export_fd().unwrap());

    dup.register(&rx, "rx", Events::READABLE).unwrap();
    assert!(queue.contains(&rx));
    assert_eq!(queue.object_for(&rx), Some("rx"));

    queue.unregister(&rx).unwrap();
    assert!(!dup.contains(&rx));
}

#[test]
fn registration_on_one_is_delivered_on_the_other() {
    let queue: Queue<&str> = Queue::open(true).unwrap();
    let dup = queue.duplicate().unwrap();
    let (mut tx, rx) = pair();

    dup.register(&rx, "rx", Events::READABLE).unwrap();
    poke(&mut tx);

    let ready = queue.wait_events(8, SHORT).unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].1, "rx");

    // Level-triggered: the shared set reports it to both.
    let ready = dup.wait_events(8, SHORT).unwrap();
    assert_eq!(ready.len(), 1);
}

#[test]
fn duplicates_wait_in_parallel() {
    let queue: Queue<usize> = Queue::open(true).unwrap();
    let mut streams = Vec::new();

    for id in 0..4 {
        let (tx, rx) = pair();
        queue.register(&rx, id, Events::READABLE | Events::EDGE).unwrap();
        streams.push((tx, rx));
    }

    let waiters: Vec<_> = (0..2)
        .map(|_| {
            let dup = queue.duplicate().unwrap();
            thread::spawn(move || {
                let mut seen = Vec::new();
                while seen.len() < 4 {
                    let ready = dup.wait_events(8, SHORT).expect("wait on duplicate");
                    if ready.is_empty() {
                        break;
                    }
                    seen.extend(ready.into_iter().map(|(_, id)| id));
                }
                seen
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(20));
    for (tx, _) in &mut streams {
        poke(tx);
    }

    let mut seen: Vec<usize> = waiters
        .into_iter()
        .flat_map(|waiter| waiter.join().expect("waiter panicked"))
        .collect();
    seen.sort();
    seen.dedup();

    assert_eq!(seen, vec![0, 1, 2, 3]);
}

#[test]
fn table_lives_until_the_last_duplicate_closes() {
    let tally = Tally::default();
    let queue: Queue<u32> = QueueBuilder::new().host(tally.clone()).open().unwrap();
    let dup = queue.duplicate().unwrap();
    let (_tx, rx) = pair();

    queue.register(&rx, 1, Events::READABLE).unwrap();

    queue.close().unwrap();
    assert!(dup.contains(&rx));
    assert_eq!(tally.released(), 0);
    assert!(!dup.is_closed());

    dup.close().unwrap();
    assert_eq!(tally.released(), 1);
}

#[test]
fn dropping_a_duplicate_keeps_the_source_usable() {
    let queue: Queue<u32> = Queue::open(true).unwrap();
    let (mut tx, rx) = pair();
    queue.register(&rx, 9, Events::READABLE).unwrap();

    drop(queue.duplicate().unwrap());

    poke(&mut tx);
    let ready = queue.wait_events(8, SHORT).unwrap();
    assert_eq!(ready, vec![(ready[0].0, 9)]);
    assert_eq!(
        queue.wait_events(8, Timeout::Immediate).unwrap().len(),
        1,
        "level-triggered event stays pending"
    );
}
