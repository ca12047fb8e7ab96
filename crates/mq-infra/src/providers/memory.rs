//! In-memory provisioning: a topic with a redelivery limit and its
//! `<name>-dlq` dead-letter topic on an [`InMemoryBroker`].

use crate::config::Policy;
use crate::error::InfraError;
use crate::infra::MqInfra;
use crate::policy::{InMemoryRedeliveryPolicy, NativeRetryPolicy};
use async_trait::async_trait;
use mq_runtime::config::InMemoryConfig;
use mq_runtime::providers::{InMemoryBroker, TopicOptions, DEFAULT_VISIBILITY_TIMEOUT};
use tracing::{debug, info};

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

pub struct InMemoryInfra {
    config: InMemoryConfig,
    policy: Policy,
    broker: InMemoryBroker,
}

impl InMemoryInfra {
    pub fn new(config: InMemoryConfig, policy: Policy, broker: InMemoryBroker) -> Self {
        Self {
            config,
            policy,
            broker,
        }
    }

    pub fn dead_letter_topic(&self) -> String {
        format!("{}-dlq", self.config.name)
    }
}

#[async_trait]
impl MqInfra for InMemoryInfra {
    async fn declare(&self) -> Result<(), InfraError> {
        let native = InMemoryRedeliveryPolicy::from_policy(&self.policy);
        let dead_letter = self.dead_letter_topic();

        let created = self.broker.declare_topic(
            &self.config.name,
            TopicOptions {
                visibility_timeout: native.visibility_timeout.unwrap_or(DEFAULT_VISIBILITY_TIMEOUT),
                max_deliveries: Some(native.max_deliveries),
                dead_letter_topic: Some(dead_letter.clone()),
            },
        );
        self.broker.declare_topic(&dead_letter, TopicOptions::default());

        if created {
            info!(
                topic = %self.config.topic_url(),
                max_deliveries = native.max_deliveries,
                "Declared in-memory topic"
            );
        } else {
            debug!(topic = %self.config.topic_url(), "In-memory topic already declared");
        }
        Ok(())
    }

    async fn tear_down(&self) -> Result<(), InfraError> {
        self.broker.delete_topic(&self.config.name);
        self.broker.delete_topic(&self.dead_letter_topic());
        debug!(topic = %self.config.topic_url(), "Tore down in-memory topic");
        Ok(())
    }

    async fn exists(&self) -> Result<bool, InfraError> {
        Ok(self.broker.contains_topic(&self.config.name)
            && self.broker.contains_topic(&self.dead_letter_topic()))
    }
}
