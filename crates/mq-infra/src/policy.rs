//! # Retry Policy Translation
//!
//! One [`Policy`] expressed in each backend's native retry vocabulary.
//!
//! Backends disagree on what they count. SQS, Service Bus and Pub/Sub count
//! every delivery including the first, so a retry limit of `R` becomes `R + 1`
//! there. RabbitMQ quorum queues count returned deliveries, so `R` is passed
//! through unchanged and still yields `R + 1` deliveries in total. The
//! adjustments live in the named constants below.

use crate::config::Policy;
use std::time::Duration;

#[cfg(test)]
#[path = "policy_tests.rs"]
mod tests;

// ============================================================================
// Constants
// ============================================================================

/// SQS `maxReceiveCount` includes the initial receive
pub const SQS_INITIAL_DELIVERY: u32 = 1;

/// Service Bus `MaxDeliveryCount` includes the initial delivery
pub const SERVICE_BUS_INITIAL_DELIVERY: u32 = 1;

/// Smallest `MaxDeliveryCount` Service Bus accepts
pub const SERVICE_BUS_MIN_DELIVERY_COUNT: u32 = 1;

/// Lock duration when the policy leaves visibility unset
pub const SERVICE_BUS_DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(60);

/// Quorum queue `x-delivery-limit` counts redeliveries only
pub const RABBITMQ_DELIVERY_LIMIT_OFFSET: u32 = 0;

/// Pub/Sub `maxDeliveryAttempts` includes the initial delivery
pub const PUBSUB_INITIAL_DELIVERY: u32 = 1;

/// Pub/Sub rejects dead-letter policies below five attempts
pub const PUBSUB_MIN_DELIVERY_ATTEMPTS: u32 = 5;

/// Pub/Sub rejects dead-letter policies above one hundred attempts
pub const PUBSUB_MAX_DELIVERY_ATTEMPTS: u32 = 100;

/// Ack deadline in seconds when the policy leaves visibility unset
pub const PUBSUB_DEFAULT_ACK_DEADLINE: u64 = 10;

/// In-memory `max_deliveries` includes the initial delivery
pub const IN_MEMORY_INITIAL_DELIVERY: u32 = 1;

// ============================================================================
// Translation
// ============================================================================

/// Backend-native provisioning parameters derived from a [`Policy`]
pub trait NativeRetryPolicy: Sized {
    fn from_policy(policy: &Policy) -> Self;
}

/// SQS redrive and visibility attributes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqsRedrivePolicy {
    pub max_receive_count: u32,
    pub visibility_timeout_secs: Option<u64>,
}

impl SqsRedrivePolicy {
    /// `RedrivePolicy` attribute value targeting `dead_letter_arn`
    pub fn redrive_json(&self, dead_letter_arn: &str) -> String {
        serde_json::json!({
            "deadLetterTargetArn": dead_letter_arn,
            "maxReceiveCount": self.max_receive_count.to_string(),
        })
        .to_string()
    }
}

impl NativeRetryPolicy for SqsRedrivePolicy {
    fn from_policy(policy: &Policy) -> Self {
        Self {
            max_receive_count: policy.retry_limit.saturating_add(SQS_INITIAL_DELIVERY),
            visibility_timeout_secs: policy.visibility_timeout_secs(),
        }
    }
}

/// Service Bus subscription delivery settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceBusDeliveryPolicy {
    pub max_delivery_count: u32,
    pub lock_duration: Duration,
}

impl ServiceBusDeliveryPolicy {
    /// Lock duration as an ISO 8601 duration, e.g. `PT1M` or `PT45S`
    pub fn lock_duration_iso8601(&self) -> String {
        let secs = self.lock_duration.as_secs();
        if secs % 60 == 0 && secs > 0 {
            format!("PT{}M", secs / 60)
        } else {
            format!("PT{}S", secs)
        }
    }
}

impl NativeRetryPolicy for ServiceBusDeliveryPolicy {
    fn from_policy(policy: &Policy) -> Self {
        let lock_duration = match policy.visibility_timeout_secs() {
            Some(secs) => Duration::from_secs(secs),
            None => SERVICE_BUS_DEFAULT_LOCK_DURATION,
        };
        Self {
            max_delivery_count: policy
                .retry_limit
                .saturating_add(SERVICE_BUS_INITIAL_DELIVERY)
                .max(SERVICE_BUS_MIN_DELIVERY_COUNT),
            lock_duration,
        }
    }
}

/// RabbitMQ quorum queue arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuorumQueuePolicy {
    pub delivery_limit: u32,
}

impl NativeRetryPolicy for QuorumQueuePolicy {
    fn from_policy(policy: &Policy) -> Self {
        Self {
            delivery_limit: policy
                .retry_limit
                .saturating_add(RABBITMQ_DELIVERY_LIMIT_OFFSET),
        }
    }
}

/// Pub/Sub subscription dead-letter settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubDeadLetterPolicy {
    pub max_delivery_attempts: u32,
    pub ack_deadline_secs: u64,
}

impl NativeRetryPolicy for PubSubDeadLetterPolicy {
    fn from_policy(policy: &Policy) -> Self {
        Self {
            max_delivery_attempts: policy
                .retry_limit
                .saturating_add(PUBSUB_INITIAL_DELIVERY)
                .clamp(PUBSUB_MIN_DELIVERY_ATTEMPTS, PUBSUB_MAX_DELIVERY_ATTEMPTS),
            ack_deadline_secs: policy
                .visibility_timeout_secs()
                .unwrap_or(PUBSUB_DEFAULT_ACK_DEADLINE),
        }
    }
}

/// In-memory broker redelivery settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InMemoryRedeliveryPolicy {
    pub max_deliveries: u32,
    pub visibility_timeout: Option<Duration>,
}

impl NativeRetryPolicy for InMemoryRedeliveryPolicy {
    fn from_policy(policy: &Policy) -> Self {
        Self {
            max_deliveries: policy.retry_limit.saturating_add(IN_MEMORY_INITIAL_DELIVERY),
            visibility_timeout: (!policy.visibility_timeout.is_zero())
                .then_some(policy.visibility_timeout),
        }
    }
}
