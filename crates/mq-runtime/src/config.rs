//! Backend selection and per-backend configuration.
//!
//! Configuration arrives as [`QueueSettings`]: one optional section per
//! backend, as produced by the `config` crate from files and environment
//! variables. Converting settings into a [`QueueConfig`] validates that at most
//! one backend is selected and that the selected one is complete. No network
//! calls happen during validation.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

// ============================================================================
// Backend Selection
// ============================================================================

/// Validated selection of exactly one queue backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueueConfig {
    AwsSqs(AwsSqsConfig),
    AzureServiceBus(AzureServiceBusConfig),
    GcpPubSub(GcpPubSubConfig),
    RabbitMq(RabbitMqConfig),
    InMemory(InMemoryConfig),
}

impl QueueConfig {
    /// Provider name used in logs and error messages
    pub fn provider_name(&self) -> &'static str {
        match self {
            Self::AwsSqs(_) => "AwsSqs",
            Self::AzureServiceBus(_) => "AzureServiceBus",
            Self::GcpPubSub(_) => "GcpPubSub",
            Self::RabbitMq(_) => "RabbitMq",
            Self::InMemory(_) => "InMemory",
        }
    }

    /// Name of the queue or topic this configuration addresses
    pub fn queue_name(&self) -> &str {
        match self {
            Self::AwsSqs(c) => &c.queue,
            Self::AzureServiceBus(c) => &c.topic,
            Self::GcpPubSub(c) => &c.topic,
            Self::RabbitMq(c) => &c.queue,
            Self::InMemory(c) => &c.name,
        }
    }

    /// Check the selected backend's required fields
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

impl Default for QueueConfig {
    fn default() -> Self {
        Self::InMemory(InMemoryConfig::default())
    }
}

/// Raw per-backend settings, at most one of which may be present
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub aws_sqs: Option<AwsSqsConfig>,
    pub azure_service_bus: Option<AzureServiceBusConfig>,
    pub gcp_pubsub: Option<GcpPubSubConfig>,
    pub rabbitmq: Option<RabbitMqConfig>,
    pub in_memory: Option<InMemoryConfig>,
}

impl QueueSettings {
    /// Load settings from an optional file plus `PREFIX__SECTION__FIELD`
    /// environment variables. Environment values override the file.
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

    /// Names of the backend sections that are present
    pub fn configured_sections(&self) -> Vec<&'static str> {
        let mut sections = Vec::new();
        if self.aws_sqs.is_some() {
            sections.push("aws_sqs");
        }
        if self.azure_service_bus.is_some() {
            sections.push("azure_service_bus");
        }
        if self.gcp_pubsub.is_some() {
            sections.push("gcp_pubsub");
        }
        if self.rabbitmq.is_some() {
            sections.push("rabbitmq");
        }
        if self.in_memory.is_some() {
            sections.push("in_memory");
        }
        sections
    }
}

impl TryFrom<QueueSettings> for QueueConfig {
    type Error = ConfigurationError;

    fn try_from(settings: QueueSettings) -> Result<Self, Self::Error> {
        let sections = settings.configured_sections();
        if sections.len() > 1 {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "exactly one queue backend may be configured, found: {}",
                    sections.join(", ")
                ),
            });
        }

        let config = if let Some(c) = settings.aws_sqs {
            Self::AwsSqs(c)
        } else if let Some(c) = settings.azure_service_bus {
            Self::AzureServiceBus(c)
        } else if let Some(c) = settings.gcp_pubsub {
            Self::GcpPubSub(c)
        } else if let Some(c) = settings.rabbitmq {
            Self::RabbitMq(c)
        } else {
            Self::InMemory(settings.in_memory.unwrap_or_default())
        };

        config.validate()?;
        Ok(config)
    }
}

pub(crate) fn require(value: &str, key: &str) -> Result<(), ConfigurationError> {
    if value.trim().is_empty() {
        return Err(ConfigurationError::Missing {
            key: key.to_string(),
        });
    }
    Ok(())
}

/// Debug stand-in for an optional secret that still shows whether it is set
fn redacted(secret: &Option<String>) -> Option<&'static str> {
    secret.as_ref().map(|_| "<redacted>")
}

// ============================================================================
// AWS SQS
// ============================================================================

/// AWS SQS configuration
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsSqsConfig {
    /// Endpoint override, e.g. a local emulator
    pub endpoint: Option<String>,
    pub region: String,
    /// `access_key_id:secret_access_key:session_token`; the token may be empty
    pub credentials: String,
    pub queue: String,
}

impl AwsSqsConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        require(&self.region, "aws_sqs.region")?;
        require(&self.queue, "aws_sqs.queue")?;
        self.parsed_credentials()?;
        Ok(())
    }

    /// Split the colon-delimited credential triple
    pub fn parsed_credentials(&self) -> Result<AwsCredentials, ConfigurationError> {
        AwsCredentials::parse(&self.credentials)
    }

    /// Service endpoint, defaulting to the regional SQS endpoint
    pub fn endpoint_url(&self) -> String {
        match &self.endpoint {
            Some(endpoint) if !endpoint.is_empty() => endpoint.trim_end_matches('/').to_string(),
            _ => format!("https://sqs.{}.amazonaws.com", self.region),
        }
    }
}

impl fmt::Debug for AwsSqsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsSqsConfig")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("credentials", &"<redacted>")
            .field("queue", &self.queue)
            .finish()
    }
}

/// Static AWS credentials
#[derive(Clone, PartialEq)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
}

impl AwsCredentials {
    /// Parse `access_key_id:secret_access_key:session_token`
    pub fn parse(raw: &str) -> Result<Self, ConfigurationError> {
        let parts: Vec<&str> = raw.split(':').collect();
        if parts.len() != 3 {
            return Err(ConfigurationError::InvalidCredentials);
        }
        Ok(Self {
            access_key_id: parts[0].to_string(),
            secret_access_key: parts[1].to_string(),
            session_token: parts[2].to_string(),
        })
    }
}

impl fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .finish()
    }
}

// ============================================================================
// Azure Service Bus
// ============================================================================

/// Azure Service Bus topic/subscription configuration.
///
/// Authenticates either with a SAS connection string or with a service
/// principal (`tenant_id`, `client_id`, `client_secret`) against `namespace`.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AzureServiceBusConfig {
    pub connection_string: Option<String>,
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub namespace: Option<String>,
    pub topic: String,
    pub subscription: String,
    /// Receive from the subscription's dead-letter sub-queue
    pub dead_letter: bool,
    /// Data-plane endpoint override
    pub endpoint: Option<String>,
    /// Azure AD authority override
    pub authority_host: Option<String>,
}

impl AzureServiceBusConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        require(&self.topic, "azure_service_bus.topic")?;
        require(&self.subscription, "azure_service_bus.subscription")?;

        if self.connection_string.as_deref().is_some_and(|c| !c.is_empty()) {
            return Ok(());
        }

        for (value, key) in [
            (&self.tenant_id, "azure_service_bus.tenant_id"),
            (&self.client_id, "azure_service_bus.client_id"),
            (&self.client_secret, "azure_service_bus.client_secret"),
            (&self.namespace, "azure_service_bus.namespace"),
        ] {
            require(value.as_deref().unwrap_or_default(), key)?;
        }
        Ok(())
    }
}

impl fmt::Debug for AzureServiceBusConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureServiceBusConfig")
            .field("connection_string", &redacted(&self.connection_string))
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &redacted(&self.client_secret))
            .field("namespace", &self.namespace)
            .field("topic", &self.topic)
            .field("subscription", &self.subscription)
            .field("dead_letter", &self.dead_letter)
            .field("endpoint", &self.endpoint)
            .field("authority_host", &self.authority_host)
            .finish()
    }
}

// ============================================================================
// GCP Pub/Sub
// ============================================================================

/// GCP Pub/Sub configuration
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcpPubSubConfig {
    pub project_id: String,
    pub topic: String,
    pub subscription: String,
    /// Service account key JSON; absent when targeting an emulator
    pub service_account_credentials: Option<String>,
    /// Endpoint override, e.g. `http://localhost:8085` for the emulator
    pub endpoint: Option<String>,
}

impl GcpPubSubConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        require(&self.project_id, "gcp_pubsub.project_id")?;
        require(&self.topic, "gcp_pubsub.topic")?;
        require(&self.subscription, "gcp_pubsub.subscription")?;
        Ok(())
    }
}

impl fmt::Debug for GcpPubSubConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcpPubSubConfig")
            .field("project_id", &self.project_id)
            .field("topic", &self.topic)
            .field("subscription", &self.subscription)
            .field(
                "service_account_credentials",
                &redacted(&self.service_account_credentials),
            )
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

// ============================================================================
// RabbitMQ
// ============================================================================

/// RabbitMQ exchange/queue configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RabbitMqConfig {
    pub server_url: String,
    /// Exchange published to; empty means the default exchange
    pub exchange: String,
    pub queue: String,
    pub prefetch_count: Option<u16>,
}

impl RabbitMqConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        require(&self.server_url, "rabbitmq.server_url")?;
        require(&self.queue, "rabbitmq.queue")?;
        Ok(())
    }
}

// ============================================================================
// In-Memory
// ============================================================================

/// In-process broker configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InMemoryConfig {
    pub name: String,
}

impl InMemoryConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Topic URL used in logs
    pub fn topic_url(&self) -> String {
        format!("mem://queue/{}", self.name)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
