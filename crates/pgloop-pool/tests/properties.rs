//! Property tests for pool accounting.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::HashSet;

use pgloop_pool::{AcquireTimeout, Pool, PooledConnection};
use pgloop_testing::MockDriver;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Borrow,
    Return(usize),
    BreakAll,
    Detach(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => Just(Op::Borrow),
        3 => any::<usize>().prop_map(Op::Return),
        1 => Just(Op::BreakAll),
        1 => any::<usize>().prop_map(Op::Detach),
    ]
}

proptest! {
    #[test]
    fn prop_no_slot_is_held_twice(size in 1usize..6, ops in prop::collection::vec(op(), 1..60)) {
        let driver = MockDriver::new();
        let pool = Pool::builder()
            .driver(driver.clone())
            .size(size)
            .acquire_timeout(AcquireTimeout::NoWait)
            .build()
            .unwrap();

        let mut held: Vec<PooledConnection> = Vec::new();

        for op in ops {
            match op {
                Op::Borrow => match pool.try_get().unwrap() {
                    Some(conn) => {
                        prop_assert!(conn.is_ok());
                        held.push(conn);
                    }
                    None => prop_assert_eq!(held.len(), size),
                },
                Op::Return(i) if !held.is_empty() => {
                    let idx = i % held.len();
                    drop(held.swap_remove(idx));
                }
                Op::BreakAll => driver.break_all(),
                Op::Detach(i) if !held.is_empty() => {
                    let idx = i % held.len();
                    drop(held.swap_remove(idx).detach());
                }
                _ => {}
            }

            let slots: HashSet<usize> = held.iter().map(PooledConnection::slot).collect();
            prop_assert_eq!(slots.len(), held.len());

            let status = pool.status();
            prop_assert_eq!(status.in_use, held.len());
            prop_assert!(status.total <= size);
            prop_assert!(status.available + status.in_use == status.total);
            prop_assert!(driver.live_connections() >= held.len());
            prop_assert!(driver.live_connections() <= size);
        }

        drop(held);
        prop_assert_eq!(pool.status().in_use, 0);
    }

    #[test]
    fn prop_checkouts_balance(size in 1usize..5, borrows in 0usize..12) {
        let pool = Pool::builder()
            .driver(MockDriver::new())
            .size(size)
            .acquire_timeout(AcquireTimeout::NoWait)
            .build()
            .unwrap();

        let mut got = Vec::new();
        for _ in 0..borrows {
            if let Some(conn) = pool.try_get().unwrap() {
                got.push(conn);
            }
        }

        prop_assert_eq!(got.len(), borrows.min(size));
        prop_assert_eq!(pool.metrics().checkouts_successful, got.len() as u64);
    }
}
