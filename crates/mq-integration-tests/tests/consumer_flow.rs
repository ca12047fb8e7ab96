//! Integration tests for the consumer receive loop over an in-memory queue
//!
//! These tests verify:
//! - With one slot, messages from a single publisher are handled in order
//! - With N slots, at most N handlers run at the same time
//! - Cancelling the consumer waits for in-flight handlers to finish

mod common;

use common::{event, unique_name, RecordingHandler, TestContext};
use mq_runtime::{new_queue, Consumer, InMemoryConfig, QueueConfig};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const WAIT_LIMIT: Duration = Duration::from_secs(5);

/// Verify a single-slot consumer handles messages in publish order
#[tokio::test]
async fn test_sequential_consumer_preserves_order() {
    // Arrange
    let mut ctx = TestContext::new();
    let queue = new_queue(QueueConfig::InMemory(InMemoryConfig::new(unique_name(
        "sequential",
    ))));
    ctx.defer(queue.init().await.unwrap());
    for id in ["a", "b", "c", "d"] {
        queue.publish(&event(id)).await.unwrap();
    }
    let handler = RecordingHandler::new(Duration::ZERO);
    let consumer = Consumer::new(queue.subscribe().await.unwrap(), handler.clone())
        .with_name("sequential");
    let cancel = CancellationToken::new();

    // Act
    let run = tokio::spawn(consumer.run(cancel.clone()));
    assert!(handler.wait_for(4, WAIT_LIMIT).await);
    cancel.cancel();
    let outcome = run.await.unwrap();

    // Assert
    assert!(outcome.is_ok());
    assert_eq!(handler.seen(), vec!["a", "b", "c", "d"]);
    assert_eq!(handler.max_active(), 1);

    ctx.teardown().await;
}

/// Verify the number of concurrently running handlers never exceeds the
/// configured concurrency
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_is_bounded() {
    let mut ctx = TestContext::new();
    let queue = new_queue(QueueConfig::InMemory(InMemoryConfig::new(unique_name(
        "bounded",
    ))));
    ctx.defer(queue.init().await.unwrap());
    for i in 0..9 {
        queue.publish(&event(format!("m{}", i))).await.unwrap();
    }
    let handler = RecordingHandler::new(Duration::from_millis(50));
    let consumer = Consumer::new(queue.subscribe().await.unwrap(), handler.clone())
        .with_name("bounded")
        .with_concurrency(3);
    let cancel = CancellationToken::new();

    let run = tokio::spawn(consumer.run(cancel.clone()));
    assert!(handler.wait_for(9, WAIT_LIMIT).await);
    cancel.cancel();
    run.await.unwrap().unwrap();

    let mut seen = handler.seen();
    seen.sort();
    assert_eq!(seen.len(), 9);
    seen.dedup();
    assert_eq!(seen.len(), 9);
    assert!(handler.max_active() <= 3);
    assert!(handler.max_active() > 1);

    ctx.teardown().await;
}

/// Verify cancellation does not abandon a handler that is still running
#[tokio::test]
async fn test_cancel_drains_in_flight_handlers() {
    let mut ctx = TestContext::new();
    let queue = new_queue(QueueConfig::InMemory(InMemoryConfig::new(unique_name(
        "drain",
    ))));
    ctx.defer(queue.init().await.unwrap());
    queue.publish(&event("slow")).await.unwrap();
    let handler = RecordingHandler::new(Duration::from_millis(300));
    let consumer = Consumer::new(queue.subscribe().await.unwrap(), handler.clone());
    let cancel = CancellationToken::new();

    let run = tokio::spawn(consumer.run(cancel.clone()));
    tokio::time::timeout(WAIT_LIMIT, async {
        while handler.active.lock().unwrap().0 == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    cancel.cancel();
    run.await.unwrap().unwrap();

    assert_eq!(handler.seen(), vec!["slow"]);

    ctx.teardown().await;
}
