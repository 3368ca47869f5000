//! Parallel fan-out against the in-memory driver.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use pgloop::{AcquireTimeout, Arena, Error, Outcome, ParallelContext, Pool};
use pgloop_testing::{MockDriver, MockResponse};

fn pool(size: usize) -> (Pool, MockDriver) {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let driver = MockDriver::new();
    let pool = Pool::builder()
        .driver(driver.clone())
        .size(size)
        .acquire_timeout(AcquireTimeout::Infinite)
        .poll_interval(Duration::from_millis(1))
        .build()
        .unwrap();
    (pool, driver)
}

#[tokio::test]
async fn test_streams_run_on_separate_connections() {
    let (pool, driver) = pool(3);
    driver.set_busy_polls(3);

    let mut ctx = ParallelContext::new(&pool, 3).unwrap();
    ctx.stream(0)
        .unwrap()
        .queue("SELECT count(*) FROM users")
        .unwrap()
        .queue("SELECT max(id) FROM users")
        .unwrap();
    // Stream 1 is created but left empty.
    ctx.stream(1).unwrap();
    ctx.stream(2)
        .unwrap()
        .queue("SELECT count(*) FROM posts")
        .unwrap();
    assert_eq!(ctx.active(), 2);

    let fired = Arc::new(AtomicUsize::new(0));
    let f = Arc::clone(&fired);
    ctx.on_complete(move |outcome| {
        assert!(outcome.is_success());
        f.fetch_add(1, Ordering::SeqCst);
    });

    let outcome = ctx.exec().unwrap().outcome().await;

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(
        outcome.streams,
        vec![Some(Outcome::Completed), None, Some(Outcome::Completed)]
    );

    let sent = driver.sent();
    assert_eq!(sent.len(), 3);
    let users: Vec<usize> = sent
        .iter()
        .filter(|q| q.sql.contains("users"))
        .map(|q| q.conn)
        .collect();
    let posts = sent.iter().find(|q| q.sql.contains("posts")).unwrap();
    assert_eq!(users[0], users[1]);
    assert_ne!(users[0], posts.conn);
    assert_eq!(pool.status().available, 3);
}

#[tokio::test]
async fn test_completion_waits_for_every_stream() {
    let (pool, driver) = pool(2);
    driver.respond("fails", MockResponse::error("42601", "syntax error"));

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut ctx = ParallelContext::new(&pool, 2).unwrap();
    ctx.stream(0).unwrap().queue("SELECT fails").unwrap();
    let o = Arc::clone(&order);
    ctx.stream(1)
        .unwrap()
        .on_complete(move |_| o.lock().push("stream 1"))
        .queue("SELECT 1")
        .unwrap()
        .queue("SELECT 2")
        .unwrap();
    let o = Arc::clone(&order);
    ctx.on_complete(move |_| o.lock().push("all"));

    let outcome = ctx.exec().unwrap().outcome().await;

    assert!(!outcome.is_success());
    let (index, failure) = outcome.first_failure().unwrap();
    assert_eq!(index, 0);
    assert!(matches!(failure, Outcome::Failed(Error::Statement { index: 0, .. })));
    assert_eq!(outcome.streams[1], Some(Outcome::Completed));
    assert_eq!(*order.lock(), vec!["stream 1", "all"]);
}

#[tokio::test]
async fn test_more_streams_than_connections() {
    let (pool, driver) = pool(2);

    let mut ctx = ParallelContext::new(&pool, 5).unwrap();
    for i in 0..5 {
        ctx.stream(i).unwrap().queue(&format!("SELECT {i}")).unwrap();
    }
    let outcome = ctx.exec().unwrap().outcome().await;

    assert!(outcome.is_success());
    assert_eq!(outcome.active(), 5);
    assert_eq!(driver.sent().len(), 5);
    assert_eq!(pool.status().available, 2);
}

#[tokio::test]
async fn test_shared_arena_released_after_completion() {
    let (pool, _driver) = pool(2);
    let arena = Arena::new();

    let mut ctx = ParallelContext::with_arena(&pool, 2, arena.clone()).unwrap();
    ctx.stream(0).unwrap().queue("SELECT 1").unwrap();
    ctx.stream(1)
        .unwrap()
        .queue_params("SELECT $1", &[Some("x")], |_| {})
        .unwrap();
    assert_eq!(arena.allocations(), 3);

    let outcome = ctx.exec().unwrap().outcome().await;
    assert!(outcome.is_success());

    // Only the caller's handle remains.
    assert_eq!(arena.allocations(), 3);
    assert_eq!(arena.used_bytes(), "SELECT 1SELECT $1x".len());
}

#[tokio::test]
async fn test_shutdown_aborts_streams() {
    let (pool, driver) = pool(2);
    driver.pause();

    let mut ctx = ParallelContext::new(&pool, 2).unwrap();
    ctx.stream(0).unwrap().queue("SELECT 1").unwrap();
    ctx.stream(1).unwrap().queue("SELECT 2").unwrap();
    let handle = ctx.exec().unwrap();

    while driver.sent().len() < 2 {
        tokio::task::yield_now().await;
    }
    pool.shutdown();

    let outcome = handle.outcome().await;
    assert_eq!(
        outcome.streams,
        vec![Some(Outcome::Aborted), Some(Outcome::Aborted)]
    );
    assert_eq!(driver.cancels(), 2);
}
