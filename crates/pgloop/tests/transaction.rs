//! Transactional pipelines against the in-memory driver.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use pgloop::{AcquireTimeout, Error, IsolationLevel, Outcome, Pipeline, Pool};
use pgloop_testing::{MockDriver, MockResponse};

fn pool() -> (Pool, MockDriver) {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let driver = MockDriver::new();
    let pool = Pool::builder()
        .driver(driver.clone())
        .size(1)
        .acquire_timeout(AcquireTimeout::NoWait)
        .poll_interval(Duration::from_millis(1))
        .build()
        .unwrap();
    (pool, driver)
}

#[tokio::test]
async fn test_statements_wrapped_in_begin_commit() {
    let (pool, driver) = pool();

    let mut pipeline = Pipeline::new(&pool);
    pipeline
        .queue_params("INSERT INTO posts (title) VALUES ($1)", &[Some("a")], |_| {})
        .unwrap()
        .queue_params("INSERT INTO posts (title) VALUES ($1)", &[Some("b")], |_| {})
        .unwrap();

    let outcome = pipeline.execute_transactional().unwrap().outcome().await;

    assert_eq!(outcome, Outcome::Completed);
    assert_eq!(
        driver.sent_sql(),
        vec![
            "BEGIN",
            "INSERT INTO posts (title) VALUES ($1)",
            "INSERT INTO posts (title) VALUES ($1)",
            "COMMIT"
        ]
    );
}

#[tokio::test]
async fn test_isolation_level_in_begin() {
    let (pool, driver) = pool();

    let mut pipeline = Pipeline::new(&pool);
    pipeline.queue("SELECT 1").unwrap();
    let outcome = pipeline
        .execute_transactional_with(IsolationLevel::Serializable)
        .unwrap()
        .outcome()
        .await;

    assert!(outcome.is_success());
    assert_eq!(
        driver.sent_sql(),
        vec!["BEGIN ISOLATION LEVEL SERIALIZABLE", "SELECT 1", "COMMIT"]
    );
}

#[tokio::test]
async fn test_failure_rolls_back_instead_of_commit() {
    let (pool, driver) = pool();
    driver.respond(
        "INSERT INTO accounts",
        MockResponse::error("23505", "duplicate key value violates unique constraint"),
    );

    let mut pipeline = Pipeline::new(&pool);
    pipeline
        .queue("UPDATE accounts SET balance = 0")
        .unwrap()
        .queue("INSERT INTO accounts VALUES (1)")
        .unwrap()
        .queue("SELECT 1")
        .unwrap();

    let outcome = pipeline.execute_transactional().unwrap().outcome().await;

    // BEGIN is statement 0, so the failing insert is statement 2.
    assert!(matches!(
        &outcome,
        Outcome::Failed(Error::Statement { index: 2, sqlstate: Some(code), .. }) if code == "23505"
    ));
    assert_eq!(
        driver.sent_sql(),
        vec![
            "BEGIN",
            "UPDATE accounts SET balance = 0",
            "INSERT INTO accounts VALUES (1)",
            "ROLLBACK"
        ]
    );

    // The rolled-back connection is reused.
    assert_eq!(pool.status().available, 1);
    assert_eq!(driver.live_connections(), 1);
}

#[tokio::test]
async fn test_failed_rollback_discards_connection() {
    let (pool, driver) = pool();
    driver
        .respond("boom", MockResponse::error("XX000", "boom"))
        .respond("ROLLBACK", MockResponse::error("08006", "connection failure"));

    let mut pipeline = Pipeline::new(&pool);
    pipeline.queue("SELECT boom").unwrap();
    let outcome = pipeline.execute_transactional().unwrap().outcome().await;

    assert!(matches!(outcome, Outcome::Failed(Error::Statement { index: 1, .. })));
    assert_eq!(driver.sent_sql(), vec!["BEGIN", "SELECT boom", "ROLLBACK"]);
    assert_eq!(driver.live_connections(), 0);
    assert_eq!(pool.status().total, 0);
}

#[tokio::test]
async fn test_empty_transaction_sends_nothing() {
    let (pool, driver) = pool();

    let fired = Arc::new(AtomicUsize::new(0));
    let f = Arc::clone(&fired);
    let mut pipeline = Pipeline::new(&pool);
    pipeline.on_complete(move |outcome| {
        assert!(outcome.is_success());
        f.fetch_add(1, Ordering::SeqCst);
    });

    let outcome = pipeline.execute_transactional().unwrap().outcome().await;

    assert_eq!(outcome, Outcome::Completed);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(driver.sent().is_empty());
}

#[tokio::test]
async fn test_callbacks_see_user_statements_only() {
    let (pool, _driver) = pool();

    let calls = Arc::new(AtomicUsize::new(0));
    let mut pipeline = Pipeline::new(&pool);
    for _ in 0..2 {
        let calls = Arc::clone(&calls);
        pipeline
            .queue_with("SELECT 1", move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }
    pipeline.transactional(Some(IsolationLevel::RepeatableRead));

    assert!(pipeline.execute().unwrap().outcome().await.is_success());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
