//! RabbitMQ provisioning: a durable topic exchange, a quorum queue whose
//! delivery limit dead-letters to `<queue>.dlq`, and the dead-letter queue.
//!
//! An empty exchange name means the default exchange. It cannot be declared,
//! bound or deleted, so those steps are skipped and dead-lettering routes
//! through it by queue name.

use crate::config::Policy;
use crate::error::InfraError;
use crate::infra::MqInfra;
use crate::policy::{NativeRetryPolicy, QuorumQueuePolicy};
use async_trait::async_trait;
use lapin::options::{
    ExchangeDeclareOptions, ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions,
    QueueDeleteOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString};
use lapin::{Connection, ConnectionProperties, ExchangeKind};
use mq_runtime::config::RabbitMqConfig;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
#[path = "rabbitmq_tests.rs"]
mod tests;

const QUORUM_QUEUE_TYPE: &str = "quorum";

pub struct RabbitMqInfra {
    config: RabbitMqConfig,
    policy: Policy,
}

impl RabbitMqInfra {
    pub fn new(config: RabbitMqConfig, policy: Policy) -> Self {
        Self { config, policy }
    }

    pub fn dead_letter_queue(&self) -> String {
        format!("{}.dlq", self.config.queue)
    }

    fn uses_default_exchange(&self) -> bool {
        self.config.exchange.is_empty()
    }

    async fn connect(&self) -> Result<Connection, InfraError> {
        let connection =
            Connection::connect(&self.config.server_url, ConnectionProperties::default()).await?;
        debug!(queue = %self.config.queue, "Connected to RabbitMQ for provisioning");
        Ok(connection)
    }

    async fn declare_on(&self, connection: &Connection) -> Result<(), InfraError> {
        let channel = connection.create_channel().await?;
        let dead_letter = self.dead_letter_queue();
        let durable = QueueDeclareOptions {
            durable: true,
            ..QueueDeclareOptions::default()
        };

        if !self.uses_default_exchange() {
            channel
                .exchange_declare(
                    &self.config.exchange,
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..ExchangeDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await?;
        }

        let native = QuorumQueuePolicy::from_policy(&self.policy);
        channel
            .queue_declare(
                &self.config.queue,
                durable,
                queue_arguments(&native, &self.config.exchange, &dead_letter),
            )
            .await?;
        channel
            .queue_declare(&dead_letter, durable, dead_letter_arguments())
            .await?;

        if !self.uses_default_exchange() {
            for queue in [self.config.queue.as_str(), dead_letter.as_str()] {
                channel
                    .queue_bind(
                        queue,
                        &self.config.exchange,
                        queue,
                        QueueBindOptions::default(),
                        FieldTable::default(),
                    )
                    .await?;
            }
        }

        info!(
            exchange = %self.config.exchange,
            queue = %self.config.queue,
            dead_letter = %dead_letter,
            delivery_limit = native.delivery_limit,
            "Declared RabbitMQ queues"
        );
        channel.close(200, "OK").await?;
        Ok(())
    }

    async fn tear_down_on(&self, connection: &Connection) -> Result<(), InfraError> {
        for queue in [self.config.queue.clone(), self.dead_letter_queue()] {
            // A failed delete closes its channel, so each runs on its own
            let channel = connection.create_channel().await?;
            match channel
                .queue_delete(&queue, QueueDeleteOptions::default())
                .await
            {
                Ok(_) => info!(queue = %queue, "Deleted RabbitMQ queue"),
                Err(e) => {
                    let e = InfraError::from(e);
                    if !e.is_not_found() {
                        return Err(e);
                    }
                    warn!(queue = %queue, "Queue not found during teardown");
                }
            }
        }

        if self.uses_default_exchange() {
            return Ok(());
        }

        let channel = connection.create_channel().await?;
        match channel
            .exchange_delete(&self.config.exchange, ExchangeDeleteOptions::default())
            .await
        {
            Ok(()) => {
                info!(exchange = %self.config.exchange, "Deleted RabbitMQ exchange");
                Ok(())
            }
            Err(e) => {
                let e = InfraError::from(e);
                if e.is_not_found() {
                    warn!(exchange = %self.config.exchange, "Exchange not found during teardown");
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Passive declare on a fresh channel; a missing queue closes the channel
    async fn queue_exists(&self, connection: &Connection, queue: &str) -> Result<bool, InfraError> {
        let channel = connection.create_channel().await?;
        let options = QueueDeclareOptions {
            passive: true,
            ..QueueDeclareOptions::default()
        };
        match channel
            .queue_declare(queue, options, FieldTable::default())
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let e = InfraError::from(e);
                if e.is_not_found() {
                    Ok(false)
                } else {
                    Err(e)
                }
            }
        }
    }
}

/// Arguments for the main queue: quorum type, delivery limit and
/// dead-letter routing to `dead_letter_queue` through `exchange`
pub fn queue_arguments(
    policy: &QuorumQueuePolicy,
    exchange: &str,
    dead_letter_queue: &str,
) -> FieldTable {
    let mut arguments = dead_letter_arguments();
    arguments.insert(
        "x-delivery-limit".into(),
        AMQPValue::LongInt(i32::try_from(policy.delivery_limit).unwrap_or(i32::MAX)),
    );
    arguments.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(LongString::from(exchange)),
    );
    arguments.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(LongString::from(dead_letter_queue)),
    );
    arguments
}

fn dead_letter_arguments() -> FieldTable {
    let mut arguments = FieldTable::default();
    arguments.insert(
        "x-queue-type".into(),
        AMQPValue::LongString(LongString::from(QUORUM_QUEUE_TYPE)),
    );
    arguments
}

async fn close(connection: &Connection) {
    if let Err(e) = connection.close(200, "OK").await {
        debug!(error = %e, "RabbitMQ connection already closed");
    }
}

#[async_trait]
impl MqInfra for RabbitMqInfra {
    #[instrument(skip(self))]
    async fn declare(&self) -> Result<(), InfraError> {
        let connection = self.connect().await?;
        let result = self.declare_on(&connection).await;
        close(&connection).await;
        result
    }

    #[instrument(skip(self))]
    async fn tear_down(&self) -> Result<(), InfraError> {
        let connection = self.connect().await?;
        let result = self.tear_down_on(&connection).await;
        close(&connection).await;
        result
    }

    async fn exists(&self) -> Result<bool, InfraError> {
        let connection = self.connect().await?;
        let result = match self.queue_exists(&connection, &self.config.queue).await {
            Ok(true) => {
                self.queue_exists(&connection, &self.dead_letter_queue())
                    .await
            }
            other => other,
        };
        close(&connection).await;
        result
    }
}
