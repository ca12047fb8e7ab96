//! Provisioner trait and backend selection.

use crate::config::{InfraBackend, MqInfraConfig};
use crate::error::InfraError;
use crate::providers::{
    AwsSqsInfra, AzureServiceBusInfra, GcpPubSubInfra, InMemoryInfra, RabbitMqInfra,
};
use async_trait::async_trait;
use mq_runtime::providers::InMemoryBroker;

#[cfg(test)]
#[path = "infra_tests.rs"]
mod tests;

/// Creates and removes the resources one queue needs, including its
/// dead-letter resource.
///
/// `declare` is idempotent: running it against infrastructure that is already
/// in place succeeds without creating duplicates. `tear_down` treats missing
/// resources as already removed.
#[async_trait]
pub trait MqInfra: Send + Sync {
    async fn declare(&self) -> Result<(), InfraError>;

    async fn tear_down(&self) -> Result<(), InfraError>;

    /// Whether the main resource and its dead-letter resource are present
    async fn exists(&self) -> Result<bool, InfraError>;
}

/// Build the provisioner for the configured backend.
///
/// In-memory topics are declared on [`InMemoryBroker::shared`], the broker
/// `mq_runtime` queues use by default.
pub fn new_infra(config: MqInfraConfig) -> Box<dyn MqInfra> {
    let policy = config.policy;
    match config.backend {
        Some(InfraBackend::AwsSqs(c)) => Box::new(AwsSqsInfra::new(c, policy)),
        Some(InfraBackend::AzureServiceBus(c)) => Box::new(AzureServiceBusInfra::new(c, policy)),
        Some(InfraBackend::GcpPubSub(c)) => Box::new(GcpPubSubInfra::new(c, policy)),
        Some(InfraBackend::RabbitMq(c)) => Box::new(RabbitMqInfra::new(c, policy)),
        Some(InfraBackend::InMemory(c)) => {
            Box::new(InMemoryInfra::new(c, policy, InMemoryBroker::shared()))
        }
        None => Box::new(InvalidInfra),
    }
}

/// Provisioner for a configuration that selects no backend
#[derive(Debug, Clone, Copy)]
pub struct InvalidInfra;

#[async_trait]
impl MqInfra for InvalidInfra {
    async fn declare(&self) -> Result<(), InfraError> {
        Err(InfraError::InvalidConfig)
    }

    async fn tear_down(&self) -> Result<(), InfraError> {
        Err(InfraError::InvalidConfig)
    }

    async fn exists(&self) -> Result<bool, InfraError> {
        Err(InfraError::InvalidConfig)
    }
}
