//! Error types for provisioning operations.

use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use mq_runtime::error::ConfigurationError;
use mq_runtime::providers::{AwsError, AzureError};
use thiserror::Error;

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;

/// Errors returned by [`MqInfra`](crate::MqInfra) operations
#[derive(Debug, Error)]
pub enum InfraError {
    #[error("invalid config")]
    InvalidConfig,

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("AWS SQS error: {0}")]
    Aws(#[from] AwsError),

    #[error("Azure Resource Manager error ({status}): {code}: {message}")]
    Azure {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Azure credential error: {0}")]
    AzureCredential(#[from] AzureError),

    #[error("GCP Pub/Sub error ({status}): {message}")]
    PubSub { status: u16, message: String },

    #[error("RabbitMQ error: {0}")]
    RabbitMq(#[from] lapin::Error),

    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to create HTTP client: {0}")]
    HttpClient(String),

    #[error("Unexpected response body: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl InfraError {
    /// The resource being created is already present
    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::Aws(AwsError::ServiceError { code, .. }) => {
                code == "QueueAlreadyExists" || code == "AWS.SimpleQueueService.QueueAlreadyExists"
            }
            Self::Azure { status, code, .. } => *status == 409 || code.contains("AlreadyExists"),
            Self::PubSub { status, .. } => *status == 409,
            _ => false,
        }
    }

    /// The resource being read or deleted is absent
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Aws(e) => e.is_queue_not_found(),
            Self::Azure { status, code, .. } => *status == 404 || code.contains("NotFound"),
            Self::PubSub { status, .. } => *status == 404,
            Self::RabbitMq(lapin::Error::ProtocolError(e)) => {
                matches!(e.kind(), AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND))
            }
            _ => false,
        }
    }
}
