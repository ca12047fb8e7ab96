//! Provisioning configuration: one backend plus a retry [`Policy`].
//!
//! The queue-side backend configs from `mq-runtime` are reused where the
//! provisioning inputs are the same. Azure Service Bus needs Resource Manager
//! coordinates the data plane never sees, so it has its own config here.

use mq_runtime::config::{AwsSqsConfig, GcpPubSubConfig, InMemoryConfig, RabbitMqConfig};
use mq_runtime::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// Default Azure Resource Manager endpoint
pub const DEFAULT_MANAGEMENT_ENDPOINT: &str = "https://management.azure.com";

/// Backend-neutral retry and visibility settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Policy {
    /// How long a received message stays hidden before redelivery; zero
    /// keeps the backend default
    pub visibility_timeout: Duration,
    /// Redeliveries after the first attempt before dead-lettering
    pub retry_limit: u32,
}

impl Policy {
    pub fn new(visibility_timeout: Duration, retry_limit: u32) -> Self {
        Self {
            visibility_timeout,
            retry_limit,
        }
    }

    /// Visibility timeout in whole seconds, `None` when unset
    pub fn visibility_timeout_secs(&self) -> Option<u64> {
        match self.visibility_timeout.as_secs() {
            0 => None,
            secs => Some(secs),
        }
    }
}

/// Azure Service Bus provisioning through Azure Resource Manager
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AzureServiceBusInfraConfig {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    /// Azure subscription id owning the namespace
    pub subscription_id: String,
    pub resource_group: String,
    pub namespace: String,
    pub topic: String,
    /// Service Bus subscription on `topic`
    pub subscription: String,
    pub management_endpoint: Option<String>,
    pub authority_host: Option<String>,
}

impl AzureServiceBusInfraConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        for (value, key) in [
            (&self.tenant_id, "azure_service_bus.tenant_id"),
            (&self.client_id, "azure_service_bus.client_id"),
            (&self.client_secret, "azure_service_bus.client_secret"),
            (&self.subscription_id, "azure_service_bus.subscription_id"),
            (&self.resource_group, "azure_service_bus.resource_group"),
            (&self.namespace, "azure_service_bus.namespace"),
            (&self.topic, "azure_service_bus.topic"),
            (&self.subscription, "azure_service_bus.subscription"),
        ] {
            require(value, key)?;
        }
        Ok(())
    }

    pub fn management_endpoint(&self) -> &str {
        self.management_endpoint
            .as_deref()
            .filter(|e| !e.is_empty())
            .unwrap_or(DEFAULT_MANAGEMENT_ENDPOINT)
            .trim_end_matches('/')
    }
}

impl fmt::Debug for AzureServiceBusInfraConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureServiceBusInfraConfig")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("subscription_id", &self.subscription_id)
            .field("resource_group", &self.resource_group)
            .field("namespace", &self.namespace)
            .field("topic", &self.topic)
            .field("subscription", &self.subscription)
            .field("management_endpoint", &self.management_endpoint)
            .finish()
    }
}

/// The backend whose resources are provisioned
#[derive(Debug, Clone, PartialEq)]
pub enum InfraBackend {
    AwsSqs(AwsSqsConfig),
    AzureServiceBus(AzureServiceBusInfraConfig),
    GcpPubSub(GcpPubSubConfig),
    RabbitMq(RabbitMqConfig),
    InMemory(InMemoryConfig),
}

impl InfraBackend {
    pub fn provider_name(&self) -> &'static str {
        match self {
            Self::AwsSqs(_) => "AwsSqs",
            Self::AzureServiceBus(_) => "AzureServiceBus",
            Self::GcpPubSub(_) => "GcpPubSub",
            Self::RabbitMq(_) => "RabbitMq",
            Self::InMemory(_) => "InMemory",
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        match self {
            Self::AwsSqs(c) => c.validate(),
            Self::AzureServiceBus(c) => c.validate(),
            Self::GcpPubSub(c) => c.validate(),
            Self::RabbitMq(c) => c.validate(),
            Self::InMemory(_) => Ok(()),
        }
    }
}

/// Provisioning input: a backend (if any was selected) and its policy
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MqInfraConfig {
    pub backend: Option<InfraBackend>,
    pub policy: Policy,
}

impl MqInfraConfig {
    pub fn new(backend: InfraBackend, policy: Policy) -> Self {
        Self {
            backend: Some(backend),
            policy,
        }
    }
}

/// Raw provisioning settings as read from files and environment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqInfraSettings {
    pub aws_sqs: Option<AwsSqsConfig>,
    pub azure_service_bus: Option<AzureServiceBusInfraConfig>,
    pub gcp_pubsub: Option<GcpPubSubConfig>,
    pub rabbitmq: Option<RabbitMqConfig>,
    pub in_memory: Option<InMemoryConfig>,
    pub visibility_timeout_seconds: u64,
    pub retry_limit: u32,
}

impl MqInfraSettings {
    /// Load settings from an optional file plus `PREFIX__SECTION__FIELD`
    /// environment variables
    pub fn load(prefix: &str, file: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(config::Environment::with_prefix(prefix).separator("__"))
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    pub fn configured_sections(&self) -> Vec<&'static str> {
        [
            ("aws_sqs", self.aws_sqs.is_some()),
            ("azure_service_bus", self.azure_service_bus.is_some()),
            ("gcp_pubsub", self.gcp_pubsub.is_some()),
            ("rabbitmq", self.rabbitmq.is_some()),
            ("in_memory", self.in_memory.is_some()),
        ]
        .into_iter()
        .filter_map(|(name, present)| present.then_some(name))
        .collect()
    }
}

impl TryFrom<MqInfraSettings> for MqInfraConfig {
    type Error = ConfigurationError;

    fn try_from(settings: MqInfraSettings) -> Result<Self, Self::Error> {
        let sections = settings.configured_sections();
        if sections.len() > 1 {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "exactly one infrastructure backend may be configured, found: {}",
                    sections.join(", ")
                ),
            });
        }

        let backend = if let Some(c) = settings.aws_sqs {
            Some(InfraBackend::AwsSqs(c))
        } else if let Some(c) = settings.azure_service_bus {
            Some(InfraBackend::AzureServiceBus(c))
        } else if let Some(c) = settings.gcp_pubsub {
            Some(InfraBackend::GcpPubSub(c))
        } else if let Some(c) = settings.rabbitmq {
            Some(InfraBackend::RabbitMq(c))
        } else {
            settings.in_memory.map(InfraBackend::InMemory)
        };

        if let Some(backend) = &backend {
            backend.validate()?;
        }

        Ok(Self {
            backend,
            policy: Policy::new(
                Duration::from_secs(settings.visibility_timeout_seconds),
                settings.retry_limit,
            ),
        })
    }
}

fn require(value: &str, key: &str) -> Result<(), ConfigurationError> {
    if value.trim().is_empty() {
        return Err(ConfigurationError::Missing {
            key: key.to_string(),
        });
    }
    Ok(())
}
