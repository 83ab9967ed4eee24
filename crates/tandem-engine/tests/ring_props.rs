use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;

use proptest::prelude::*;
use tandem_engine::{Overflow, SharedRing};

#[derive(Debug, Clone)]
enum Op {
    Publish,
    Consume(usize),
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![3 => Just(Op::Publish), 2 => (0usize..4).prop_map(Op::Consume)],
        1..200,
    )
}

proptest! {
    #[test]
    fn reject_ring_matches_a_fifo_model(capacity in 4usize..12, ops in ops()) {
        let ring = SharedRing::<u64>::create(capacity, Overflow::Reject).expect("ring");
        let mut model = VecDeque::new();
        let mut retain = 0usize;
        let mut next = 0u64;
        let mut last = None;

        for op in ops {
            match op {
                Op::Publish => {
                    let limit = capacity - retain.min(capacity - 1);
                    let accepted = ring.publish(&next);
                    prop_assert_eq!(accepted, model.len() < limit);
                    if accepted {
                        model.push_back(next);
                    }
                    next += 1;
                }
                Op::Consume(keep) => {
                    retain = keep;
                    let (_, tail_before) = ring.positions();
                    let value = ring.consume_latest_with_cushion(keep);
                    let (_, tail_after) = ring.positions();
                    prop_assert!(tail_after - tail_before <= 1);
                    prop_assert_eq!(value, model.pop_front());
                    if value.is_some() {
                        last = value;
                    }
                    prop_assert_eq!(ring.last_consumed(), last);
                }
            }
            prop_assert!(ring.occupancy() <= capacity);
            prop_assert_eq!(ring.occupancy(), model.len());
        }
        prop_assert_eq!(ring.dropped(), 0);
    }

    #[test]
    fn drop_oldest_keeps_the_newest_in_order(capacity in 4usize..12, ops in ops()) {
        let ring = SharedRing::<u64>::create(capacity, Overflow::DropOldest).expect("ring");
        let mut next = 0u64;
        let mut last_read: Option<u64> = None;

        for op in ops {
            match op {
                Op::Publish => {
                    prop_assert!(ring.publish(&next));
                    next += 1;
                }
                Op::Consume(keep) => {
                    if let Some(value) = ring.consume_latest_with_cushion(keep) {
                        if let Some(previous) = last_read {
                            prop_assert!(value > previous);
                        }
                        last_read = Some(value);
                    }
                }
            }
            prop_assert!(ring.occupancy() <= capacity);
            let (head, tail) = ring.positions();
            prop_assert_eq!(head, next);
            prop_assert!(tail <= head);
        }
    }
}

#[test]
fn attached_mapping_sees_the_same_ring() {
    let owner = SharedRing::<u64>::create(8, Overflow::Reject).expect("ring");
    let other = SharedRing::<u64>::attach(&owner.descriptor()).expect("attach");
    assert!(owner.publish(&7));
    assert!(owner.publish(&8));
    assert_eq!(other.occupancy(), 2);
    assert_eq!(other.consume_latest_with_cushion(2), Some(7));
    assert_eq!(owner.occupancy(), 1);
    assert_eq!(owner.last_consumed(), Some(7));
    assert!(SharedRing::<u32>::attach(&owner.descriptor()).is_err());
}

#[test]
fn concurrent_producer_and_consumer_stay_ordered() {
    let producer = Arc::new(SharedRing::<[u64; 4]>::create(8, Overflow::DropOldest).expect("ring"));
    let consumer = SharedRing::<[u64; 4]>::attach(&producer.descriptor()).expect("attach");
    const TOTAL: u64 = 50_000;

    let writer = {
        let ring = Arc::clone(&producer);
        thread::spawn(move || {
            for value in 0..TOTAL {
                ring.publish(&[value; 4]);
            }
        })
    };

    let mut last = None;
    let mut seen = 0u64;
    loop {
        match consumer.consume_latest_with_cushion(2) {
            Some(block) => {
                assert!(block.iter().all(|v| *v == block[0]), "torn slot {block:?}");
                if let Some(previous) = last {
                    assert!(block[0] > previous);
                }
                last = Some(block[0]);
                seen += 1;
            }
            None if writer.is_finished() && consumer.occupancy() == 0 => break,
            None => thread::yield_now(),
        }
    }
    writer.join().expect("writer");
    assert!(seen > 0);
    assert_eq!(seen + producer.dropped(), TOTAL);
}
