//! RabbitMQ adapter over AMQP 0-9-1 (lapin).
//!
//! Messages are published persistently to the configured exchange with the
//! queue name as routing key, and publisher confirms are awaited so that a
//! successful `publish` means the broker has taken the message. Subscriptions
//! open their own channel and consume with manual acknowledgement.

use crate::config::RabbitMqConfig;
use crate::error::QueueError;
use crate::init::OnceInit;
use crate::message::{Acknowledger, IncomingMessage, Message};
use crate::queue::{Cleanup, Queue, Subscription};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "rabbitmq_tests.rs"]
mod tests;

/// Header quorum queues set to the number of previous delivery attempts
pub const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

const PERSISTENT_DELIVERY_MODE: u8 = 2;

const PROVIDER: &str = "RabbitMq";

/// Map a lapin error onto the runtime error taxonomy
pub fn amqp_error(err: lapin::Error) -> QueueError {
    match err {
        lapin::Error::IOError(e) => QueueError::ConnectionFailed {
            message: e.to_string(),
        },
        lapin::Error::InvalidConnectionState(state) => QueueError::ConnectionFailed {
            message: format!("connection is {:?}", state),
        },
        lapin::Error::ProtocolError(e) => {
            let code = match e.kind() {
                AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => {
                    return QueueError::QueueNotFound {
                        queue_name: e.get_message().as_str().to_string(),
                    }
                }
                AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED) => {
                    return QueueError::AuthenticationFailed {
                        message: e.get_message().as_str().to_string(),
                    }
                }
                kind => format!("{:?}", kind),
            };
            QueueError::ProviderError {
                provider: PROVIDER.to_string(),
                code,
                message: e.get_message().as_str().to_string(),
            }
        }
        other => QueueError::ProviderError {
            provider: PROVIDER.to_string(),
            code: "amqp".to_string(),
            message: other.to_string(),
        },
    }
}

/// Delivery count for a received message.
///
/// Quorum queues report prior attempts in `x-delivery-count`; without the
/// header a first delivery counts as one and a classic-queue redelivery is
/// unknown.
pub fn delivery_count(headers: Option<&FieldTable>, redelivered: bool) -> Option<u32> {
    let previous = headers.and_then(|table| {
        table
            .inner()
            .get(&ShortString::from(DELIVERY_COUNT_HEADER))
            .and_then(amqp_u32)
    });

    match previous {
        Some(previous) => Some(previous.saturating_add(1)),
        None if !redelivered => Some(1),
        None => None,
    }
}

fn amqp_u32(value: &AMQPValue) -> Option<u32> {
    match value {
        AMQPValue::ShortShortUInt(v) => Some(u32::from(*v)),
        AMQPValue::ShortUInt(v) => Some(u32::from(*v)),
        AMQPValue::LongUInt(v) => Some(*v),
        AMQPValue::ShortShortInt(v) => u32::try_from(*v).ok(),
        AMQPValue::ShortInt(v) => u32::try_from(*v).ok(),
        AMQPValue::LongInt(v) => u32::try_from(*v).ok(),
        AMQPValue::LongLongInt(v) => u32::try_from(*v).ok(),
        _ => None,
    }
}

struct AmqpHandle {
    connection: Arc<Connection>,
    channel: Channel,
}

/// [`Queue`] over a RabbitMQ exchange and queue
pub struct RabbitMqQueue {
    config: RabbitMqConfig,
    handle: OnceInit<AmqpHandle>,
}

impl RabbitMqQueue {
    pub fn new(config: RabbitMqConfig) -> Self {
        Self {
            config,
            handle: OnceInit::new(),
        }
    }

    async fn open(&self) -> Result<&AmqpHandle, QueueError> {
        self.handle
            .get_or_init(|| async {
                let connection =
                    Connection::connect(&self.config.server_url, ConnectionProperties::default())
                        .await
                        .map_err(amqp_error)?;
                let channel = connection.create_channel().await.map_err(amqp_error)?;
                channel
                    .confirm_select(ConfirmSelectOptions::default())
                    .await
                    .map_err(amqp_error)?;

                info!(
                    exchange = %self.config.exchange,
                    queue = %self.config.queue,
                    "Connected to RabbitMQ"
                );
                Ok(AmqpHandle {
                    connection: Arc::new(connection),
                    channel,
                })
            })
            .await
    }
}

#[async_trait]
impl Queue for RabbitMqQueue {
    async fn init(&self) -> Result<Cleanup, QueueError> {
        let handle = self.open().await?;
        let connection = Arc::clone(&handle.connection);
        Ok(Cleanup::new(async move {
            if let Err(e) = connection.close(200, "OK").await {
                debug!(error = %e, "RabbitMQ connection already closed");
            }
        }))
    }

    async fn publish(&self, message: &dyn IncomingMessage) -> Result<(), QueueError> {
        let handle = self.handle.get().ok_or_else(|| QueueError::NotInitialized {
            queue_name: self.config.queue.clone(),
        })?;
        let message = message.to_message()?;

        let confirmation = handle
            .channel
            .basic_publish(
                &self.config.exchange,
                &self.config.queue,
                BasicPublishOptions::default(),
                &message.body,
                BasicProperties::default().with_delivery_mode(PERSISTENT_DELIVERY_MODE),
            )
            .await
            .map_err(amqp_error)?
            .await
            .map_err(amqp_error)?;

        if let Confirmation::Nack(_) = confirmation {
            return Err(QueueError::ProviderError {
                provider: PROVIDER.to_string(),
                code: "nack".to_string(),
                message: format!("broker rejected message for queue '{}'", self.config.queue),
            });
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<Box<dyn Subscription>, QueueError> {
        let handle = self.open().await?;
        let channel = handle.connection.create_channel().await.map_err(amqp_error)?;

        if let Some(prefetch) = self.config.prefetch_count {
            channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await
                .map_err(amqp_error)?;
        }

        let consumer_tag = format!("mq-runtime-{}", uuid::Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                &self.config.queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(amqp_error)?;

        debug!(queue = %self.config.queue, consumer_tag = %consumer_tag, "Started consuming");
        Ok(Box::new(RabbitMqSubscription {
            channel,
            consumer: Mutex::new(consumer),
            closed: CancellationToken::new(),
        }))
    }
}

/// Consumer on its own channel
pub struct RabbitMqSubscription {
    channel: Channel,
    consumer: Mutex<lapin::Consumer>,
    closed: CancellationToken,
}

fn to_message(delivery: Delivery) -> Message {
    let id = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_string())
        .unwrap_or_else(|| delivery.delivery_tag.to_string());
    let count = delivery_count(delivery.properties.headers().as_ref(), delivery.redelivered);

    let message = Message::received(
        delivery.data,
        id,
        Box::new(AmqpAcknowledger {
            acker: delivery.acker,
        }),
    );
    match count {
        Some(count) => message.with_delivery_count(count),
        None => message,
    }
}

#[async_trait]
impl Subscription for RabbitMqSubscription {
    async fn receive(&self) -> Result<Message, QueueError> {
        let mut consumer = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(QueueError::SubscriptionClosed),
            consumer = self.consumer.lock() => consumer,
        };

        let next = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(QueueError::SubscriptionClosed),
            next = consumer.next() => next,
        };

        match next {
            Some(Ok(delivery)) => Ok(to_message(delivery)),
            Some(Err(e)) => Err(amqp_error(e)),
            None => Err(QueueError::SubscriptionClosed),
        }
    }

    async fn shutdown(&self) -> Result<(), QueueError> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();
        if let Err(e) = self.channel.close(200, "OK").await {
            warn!(error = %e, "Failed to close RabbitMQ consumer channel");
        }
        Ok(())
    }
}

struct AmqpAcknowledger {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcknowledger {
    async fn ack(&self) -> Result<(), QueueError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(amqp_error)
    }

    async fn nack(&self) -> Result<(), QueueError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue: true,
            })
            .await
            .map_err(amqp_error)
    }
}
