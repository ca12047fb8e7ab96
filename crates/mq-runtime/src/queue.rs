//! Queue capability traits and backend selection.
//!
//! Producers and consumers depend only on [`Queue`] and [`Subscription`].
//! [`new_queue`] is the single place that decides which backend adapter
//! serves a given [`QueueConfig`].

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::message::{IncomingMessage, Message};
use crate::providers::{AwsSqsQueue, AzureServiceBusQueue, InMemoryQueue, RabbitMqQueue};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

// ============================================================================
// Capability Traits
// ============================================================================

/// Publish/subscribe access to one configured queue or topic
#[async_trait]
pub trait Queue: Send + Sync {
    /// Establish the backend client. Runs at most once per instance; every
    /// caller observes the outcome of that single attempt.
    async fn init(&self) -> Result<Cleanup, QueueError>;

    /// Serialize and publish a message. Requires a successful `init`.
    async fn publish(&self, message: &dyn IncomingMessage) -> Result<(), QueueError>;

    /// Open a subscription, initializing the adapter first if needed
    async fn subscribe(&self) -> Result<Box<dyn Subscription>, QueueError>;
}

/// A live, backend-bound receive handle owned by one consumer
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Wait for the next message.
    ///
    /// Cancel-safe: dropping the future before it resolves does not lose a
    /// message.
    async fn receive(&self) -> Result<Message, QueueError>;

    /// Release backend resources held by the subscription
    async fn shutdown(&self) -> Result<(), QueueError>;
}

// ============================================================================
// Cleanup
// ============================================================================

/// Release action returned by [`Queue::init`]
pub struct Cleanup {
    action: Option<BoxFuture<'static, ()>>,
}

impl Cleanup {
    /// Cleanup for adapters that hold nothing beyond their HTTP client
    pub fn noop() -> Self {
        Self { action: None }
    }

    pub fn new<F>(action: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            action: Some(Box::pin(action)),
        }
    }

    /// Run the release action
    pub async fn run(self) {
        if let Some(action) = self.action {
            action.await;
        }
    }
}

impl fmt::Debug for Cleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cleanup")
            .field("noop", &self.action.is_none())
            .finish()
    }
}

// ============================================================================
// Backend Selection
// ============================================================================

/// Build the adapter for the configured backend
///
/// ```
/// # tokio_test::block_on(async {
/// use mq_runtime::{new_queue, InMemoryConfig, Json, Queue, QueueConfig, Subscription};
///
/// let queue = new_queue(QueueConfig::InMemory(InMemoryConfig::new("doc-orders")));
/// let cleanup = queue.init().await.unwrap();
/// let subscription = queue.subscribe().await.unwrap();
///
/// queue.publish(&Json(serde_json::json!({ "ID": "abc" }))).await.unwrap();
/// let message = subscription.receive().await.unwrap();
/// message.ack().await.unwrap();
///
/// subscription.shutdown().await.unwrap();
/// cleanup.run().await;
/// # });
/// ```
pub fn new_queue(config: QueueConfig) -> Arc<dyn Queue> {
    match config {
        QueueConfig::AwsSqs(c) => Arc::new(AwsSqsQueue::new(c)),
        QueueConfig::AzureServiceBus(c) => Arc::new(AzureServiceBusQueue::new(c)),
        QueueConfig::RabbitMq(c) => Arc::new(RabbitMqQueue::new(c)),
        QueueConfig::GcpPubSub(_) => Arc::new(UnimplementedQueue::new("GcpPubSub")),
        QueueConfig::InMemory(c) => Arc::new(InMemoryQueue::new(c)),
    }
}

/// Adapter for a recognized backend that has no runtime implementation
#[derive(Debug, Clone)]
pub struct UnimplementedQueue {
    provider: &'static str,
}

impl UnimplementedQueue {
    pub fn new(provider: &'static str) -> Self {
        Self { provider }
    }

    fn error(&self) -> QueueError {
        QueueError::Unimplemented {
            provider: self.provider.to_string(),
        }
    }
}

#[async_trait]
impl Queue for UnimplementedQueue {
    async fn init(&self) -> Result<Cleanup, QueueError> {
        Err(self.error())
    }

    async fn publish(&self, _message: &dyn IncomingMessage) -> Result<(), QueueError> {
        Err(self.error())
    }

    async fn subscribe(&self) -> Result<Box<dyn Subscription>, QueueError> {
        Err(self.error())
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
