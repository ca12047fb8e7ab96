//! # Consumer
//!
//! Drives one [`Subscription`] with a bounded number of concurrent handler
//! invocations.
//!
//! A single receive loop pulls messages and hands each one to the
//! [`MessageHandler`] on its own task. Concurrency is bounded by a pool of
//! `N` slots; a handler holds one slot for its whole invocation. When the run
//! stops, either because the cancellation token fired or because `receive`
//! failed, the consumer waits for every in-flight handler to return before
//! shutting the subscription down.
//!
//! Acknowledgement is the handler's job. A handler error is logged and has no
//! other effect; the message stays unsettled unless the handler settled it.

use crate::error::QueueError;
use crate::message::Message;
use crate::queue::Subscription;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[cfg(test)]
#[path = "consumer_tests.rs"]
mod tests;

/// Default number of concurrent handler invocations
pub const DEFAULT_CONCURRENCY: usize = 1;

/// Application callback invoked once per received message
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process `message`, settling it with `ack` or `nack`.
    ///
    /// `cancel` fires when the consumer is asked to stop; long-running
    /// handlers should observe it and return early.
    async fn handle(&self, message: Message, cancel: CancellationToken) -> anyhow::Result<()>;
}

/// Receive loop bound to one subscription and one handler
pub struct Consumer {
    name: String,
    subscription: Box<dyn Subscription>,
    handler: Arc<dyn MessageHandler>,
    concurrency: usize,
}

impl Consumer {
    pub fn new(subscription: Box<dyn Subscription>, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            name: "consumer".to_string(),
            subscription,
            handler,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Name recorded on log lines and spans
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Maximum concurrent handler invocations; values below 1 become 1
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run until `cancel` fires or the subscription fails.
    ///
    /// Returns `Ok(())` after a cancellation and the receive error otherwise.
    /// In both cases every dispatched handler has completed and the
    /// subscription has been shut down by the time this returns.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), QueueError> {
        let slots = Arc::new(Semaphore::new(self.concurrency));
        info!(consumer = %self.name, concurrency = self.concurrency, "Consumer started");

        let outcome = loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                received = self.subscription.receive() => match received {
                    Ok(message) => message,
                    Err(e) => {
                        error!(consumer = %self.name, error = %e, "Receive failed, stopping consumer");
                        break Err(e);
                    }
                },
            };

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // Unsettled, so the backend redelivers it
                    debug!(
                        consumer = %self.name,
                        message_id = %message.loggable_id(),
                        "Cancelled while waiting for a slot, releasing message"
                    );
                    break Ok(());
                }
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Ok(()),
                },
            };

            let span = info_span!(
                "consumer.handle",
                consumer = %self.name,
                message_id = %message.loggable_id(),
            );
            let handler = Arc::clone(&self.handler);
            let handler_cancel = cancel.clone();
            tokio::spawn(
                async move {
                    let _permit = permit;
                    if let Err(e) = handler.handle(message, handler_cancel).await {
                        error!(error = %e, "Message handler failed");
                    }
                }
                .instrument(span),
            );
        };

        debug!(consumer = %self.name, "Draining in-flight handlers");
        let total = u32::try_from(self.concurrency).unwrap_or(u32::MAX);
        if let Ok(drained) = slots.acquire_many(total).await {
            drop(drained);
        }

        if let Err(e) = self.subscription.shutdown().await {
            warn!(consumer = %self.name, error = %e, "Subscription shutdown failed");
        }

        info!(consumer = %self.name, failed = outcome.is_err(), "Consumer stopped");
        outcome
    }
}
