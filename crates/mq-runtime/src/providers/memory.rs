//! In-process broker for tests and local development.
//!
//! Topics live in an [`InMemoryBroker`] and behave like a single competing-
//! consumer queue: every message goes to exactly one receiver, unsettled
//! messages become visible again after the topic's visibility timeout, and a
//! declared redelivery policy moves exhausted messages to a dead-letter topic.
//! Delivery is FIFO for a single publisher.

use crate::config::InMemoryConfig;
use crate::error::QueueError;
use crate::init::OnceInit;
use crate::message::{Acknowledger, IncomingMessage, Message};
use crate::queue::{Cleanup, Queue, Subscription};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// Visibility timeout for topics created without an explicit declaration
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Broker
// ============================================================================

/// Delivery settings for one in-memory topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicOptions {
    pub visibility_timeout: Duration,
    /// Total deliveries allowed before the message is dead-lettered;
    /// `None` redelivers forever
    pub max_deliveries: Option<u32>,
    pub dead_letter_topic: Option<String>,
}

impl Default for TopicOptions {
    fn default() -> Self {
        Self {
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            max_deliveries: None,
            dead_letter_topic: None,
        }
    }
}

/// Registry of named in-memory topics
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    topics: Arc<Mutex<HashMap<String, Arc<Topic>>>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide broker used by [`InMemoryQueue::new`]
    pub fn shared() -> Self {
        static SHARED: OnceLock<InMemoryBroker> = OnceLock::new();
        SHARED.get_or_init(InMemoryBroker::new).clone()
    }

    fn topics(&self) -> MutexGuard<'_, HashMap<String, Arc<Topic>>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a topic, creating it with default options when absent
    pub(crate) fn topic(&self, name: &str) -> Arc<Topic> {
        self.topics()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Topic::new(name, TopicOptions::default(), None)))
            .clone()
    }

    /// Create a topic or update an existing topic's options.
    ///
    /// Returns `true` when the topic was created. The dead-letter topic, when
    /// named, is created as well.
    pub fn declare_topic(&self, name: &str, options: TopicOptions) -> bool {
        let dead_letter = options
            .dead_letter_topic
            .as_deref()
            .map(|dlq| self.topic(dlq));

        let mut topics = self.topics();
        if let Some(existing) = topics.get(name).cloned() {
            existing.reconfigure(options, dead_letter);
            return false;
        }
        topics.insert(
            name.to_string(),
            Arc::new(Topic::new(name, options, dead_letter)),
        );
        true
    }

    /// Remove a topic. Returns `false` when no such topic existed.
    pub fn delete_topic(&self, name: &str) -> bool {
        self.topics().remove(name).is_some()
    }

    pub fn contains_topic(&self, name: &str) -> bool {
        self.topics().contains_key(name)
    }

    /// Current options of a topic
    pub fn topic_options(&self, name: &str) -> Option<TopicOptions> {
        self.topics().get(name).map(|t| t.lock().options.clone())
    }

    /// Number of messages waiting to be received on a topic
    pub fn ready_count(&self, name: &str) -> usize {
        self.topics()
            .get(name)
            .map(|t| t.lock().ready.len())
            .unwrap_or(0)
    }

    /// Number of received-but-unsettled messages on a topic
    pub fn in_flight_count(&self, name: &str) -> usize {
        self.topics()
            .get(name)
            .map(|t| t.lock().in_flight.len())
            .unwrap_or(0)
    }
}

// ============================================================================
// Topic
// ============================================================================

struct StoredMessage {
    id: u64,
    body: Bytes,
    deliveries: u32,
}

struct InFlightMessage {
    message: StoredMessage,
    visible_at: Instant,
}

struct TopicState {
    options: TopicOptions,
    dead_letter: Option<Arc<Topic>>,
    ready: VecDeque<StoredMessage>,
    in_flight: HashMap<u64, InFlightMessage>,
    next_id: u64,
}

pub(crate) struct Topic {
    name: String,
    state: Mutex<TopicState>,
    notify: Notify,
}

enum Take {
    Message(Message),
    Wait(Option<Instant>),
}

impl Topic {
    fn new(name: &str, options: TopicOptions, dead_letter: Option<Arc<Topic>>) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(TopicState {
                options,
                dead_letter,
                ready: VecDeque::new(),
                in_flight: HashMap::new(),
                next_id: 1,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TopicState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reconfigure(&self, options: TopicOptions, dead_letter: Option<Arc<Topic>>) {
        let mut state = self.lock();
        state.options = options;
        state.dead_letter = dead_letter;
    }

    fn publish(&self, body: Bytes) {
        {
            let mut state = self.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.ready.push_back(StoredMessage {
                id,
                body,
                deliveries: 0,
            });
        }
        self.notify.notify_waiters();
    }

    /// Move expired leases back to ready (or to the dead-letter topic) and
    /// hand out the next ready message if there is one.
    fn take_next(self: &Arc<Self>) -> Take {
        let now = Instant::now();
        let mut exhausted = Vec::new();

        let taken = {
            let mut state = self.lock();

            let expired: Vec<u64> = state
                .in_flight
                .iter()
                .filter(|(_, m)| m.visible_at <= now)
                .map(|(id, _)| *id)
                .collect();
            for id in expired {
                if let Some(lease) = state.in_flight.remove(&id) {
                    Self::return_or_exhaust(&mut state, lease.message, &mut exhausted);
                }
            }

            match state.ready.pop_front() {
                Some(mut message) => {
                    message.deliveries += 1;
                    let id = message.id;
                    let deliveries = message.deliveries;
                    let body = message.body.clone();
                    let visible_at = now + state.options.visibility_timeout;
                    state
                        .in_flight
                        .insert(id, InFlightMessage { message, visible_at });

                    let acknowledger = InMemoryAcknowledger {
                        topic: Arc::clone(self),
                        id,
                        deliveries,
                    };
                    Take::Message(
                        Message::received(body, id.to_string(), Box::new(acknowledger))
                            .with_delivery_count(deliveries),
                    )
                }
                None => Take::Wait(state.in_flight.values().map(|m| m.visible_at).min()),
            }
        };

        self.dead_letter(exhausted);
        taken
    }

    fn return_or_exhaust(
        state: &mut TopicState,
        message: StoredMessage,
        exhausted: &mut Vec<StoredMessage>,
    ) {
        match state.options.max_deliveries {
            Some(max) if message.deliveries >= max => exhausted.push(message),
            _ => state.ready.push_back(message),
        }
    }

    fn dead_letter(&self, exhausted: Vec<StoredMessage>) {
        if exhausted.is_empty() {
            return;
        }

        let target = self.lock().dead_letter.clone();
        match target {
            Some(dlq) => {
                for message in exhausted {
                    debug!(
                        topic = %self.name,
                        dead_letter_topic = %dlq.name,
                        message_id = message.id,
                        deliveries = message.deliveries,
                        "Moving message to dead-letter topic"
                    );
                    dlq.publish(message.body);
                }
            }
            None => warn!(
                topic = %self.name,
                dropped = exhausted.len(),
                "Delivery limit reached without a dead-letter topic; dropping messages"
            ),
        }
    }

    fn settle(&self, id: u64, deliveries: u32, requeue: bool) {
        let mut exhausted = Vec::new();
        {
            let mut state = self.lock();
            let current = state
                .in_flight
                .get(&id)
                .is_some_and(|m| m.message.deliveries == deliveries);
            if !current {
                // Lease already expired and the message was handed out again
                return;
            }
            if let Some(lease) = state.in_flight.remove(&id) {
                if requeue {
                    Self::return_or_exhaust(&mut state, lease.message, &mut exhausted);
                }
            }
        }
        self.dead_letter(exhausted);
        if requeue {
            self.notify.notify_waiters();
        }
    }
}

struct InMemoryAcknowledger {
    topic: Arc<Topic>,
    id: u64,
    deliveries: u32,
}

#[async_trait]
impl Acknowledger for InMemoryAcknowledger {
    async fn ack(&self) -> Result<(), QueueError> {
        self.topic.settle(self.id, self.deliveries, false);
        Ok(())
    }

    async fn nack(&self) -> Result<(), QueueError> {
        self.topic.settle(self.id, self.deliveries, true);
        Ok(())
    }
}

// ============================================================================
// Queue Adapter
// ============================================================================

/// [`Queue`] over a named in-memory topic.
///
/// The topic is looked up by name on every publish and subscribe, so an
/// adapter keeps working when its topic is deleted and declared again.
pub struct InMemoryQueue {
    config: InMemoryConfig,
    broker: InMemoryBroker,
    opened: OnceInit<()>,
}

impl InMemoryQueue {
    /// Adapter on the process-wide shared broker
    pub fn new(config: InMemoryConfig) -> Self {
        Self::with_broker(config, InMemoryBroker::shared())
    }

    pub fn with_broker(config: InMemoryConfig, broker: InMemoryBroker) -> Self {
        Self {
            config,
            broker,
            opened: OnceInit::new(),
        }
    }

    async fn open_topic(&self) -> Result<Arc<Topic>, QueueError> {
        self.opened
            .get_or_init(|| async {
                debug!(topic = %self.config.topic_url(), "Opening in-memory topic");
                Ok(())
            })
            .await?;
        Ok(self.broker.topic(&self.config.name))
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    async fn init(&self) -> Result<Cleanup, QueueError> {
        self.open_topic().await?;
        Ok(Cleanup::noop())
    }

    async fn publish(&self, message: &dyn IncomingMessage) -> Result<(), QueueError> {
        if self.opened.get().is_none() {
            return Err(QueueError::NotInitialized {
                queue_name: self.config.name.clone(),
            });
        }
        let message = message.to_message()?;
        self.broker.topic(&self.config.name).publish(message.body);
        Ok(())
    }

    async fn subscribe(&self) -> Result<Box<dyn Subscription>, QueueError> {
        let topic = self.open_topic().await?;
        Ok(Box::new(InMemorySubscription {
            topic,
            closed: CancellationToken::new(),
        }))
    }
}

/// Receive handle on an in-memory topic.
///
/// Bound to the topic that existed when it was opened; after the topic is
/// deleted and declared again, subscribe anew to see its messages.
pub struct InMemorySubscription {
    topic: Arc<Topic>,
    closed: CancellationToken,
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn receive(&self) -> Result<Message, QueueError> {
        loop {
            if self.closed.is_cancelled() {
                return Err(QueueError::SubscriptionClosed);
            }

            let notified = self.topic.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_visible = match self.topic.take_next() {
                Take::Message(message) => return Ok(message),
                Take::Wait(next_visible) => next_visible,
            };

            match next_visible {
                Some(deadline) => tokio::select! {
                    _ = &mut notified => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = self.closed.cancelled() => return Err(QueueError::SubscriptionClosed),
                },
                None => tokio::select! {
                    _ = &mut notified => {}
                    _ = self.closed.cancelled() => return Err(QueueError::SubscriptionClosed),
                },
            }
        }
    }

    async fn shutdown(&self) -> Result<(), QueueError> {
        self.closed.cancel();
        Ok(())
    }
}
