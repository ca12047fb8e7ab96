//! Error types for queue operations.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Comprehensive error type for all queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Message not found or lock expired: {receipt}")]
    MessageNotFound { receipt: String },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Provider error ({provider}): {code} - {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },

    #[error("{provider} queue is unimplemented")]
    Unimplemented { provider: String },

    #[error("Queue '{queue_name}' used before initialization")]
    NotInitialized { queue_name: String },

    #[error("Queue initialization failed: {0}")]
    InitializationFailed(#[source] Arc<QueueError>),

    #[error("Subscription is closed")]
    SubscriptionClosed,

    #[error("Serialization failed: {0}")]
    SerializationError(#[from] SerializationError),

    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] ConfigurationError),
}

impl QueueError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::QueueNotFound { .. } => false,
            Self::MessageNotFound { .. } => false,
            Self::ConnectionFailed { .. } => true,
            Self::AuthenticationFailed { .. } => false,
            Self::ProviderError { .. } => true, // Provider-specific errors are usually transient
            Self::Unimplemented { .. } => false,
            Self::NotInitialized { .. } => false,
            Self::InitializationFailed(inner) => inner.is_transient(),
            Self::SubscriptionClosed => false,
            Self::SerializationError(_) => false,
            Self::ConfigurationError(_) => false,
        }
    }

    /// Get suggested retry delay
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::ConnectionFailed { .. } => Some(Duration::from_secs(5)),
            Self::ProviderError { .. } => Some(Duration::from_secs(1)),
            Self::InitializationFailed(inner) => inner.retry_after(),
            _ => None,
        }
    }
}

/// Errors during message serialization/deserialization
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Message body could not be decoded: {message}")]
    InvalidEncoding { message: String },

    #[error("Message exceeds size limit: {size} bytes (max: {max_size})")]
    MessageTooLarge { size: usize, max_size: usize },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },

    #[error("invalid credentials")]
    InvalidCredentials,
}

impl From<config::ConfigError> for ConfigurationError {
    fn from(err: config::ConfigError) -> Self {
        Self::Parsing {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
