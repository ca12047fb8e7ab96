//! # MQ Infra
//!
//! Idempotent provisioning of the broker resources an `mq-runtime` queue
//! needs: the queue or topic and subscription, a dead-letter resource, and
//! the backend's native redelivery limit derived from a shared [`Policy`].
//!
//! ## Module Organization
//!
//! - [`config`] - Backend selection, retry policy and settings loading
//! - [`error`] - Provisioning errors and their idempotency classifiers
//! - [`infra`] - The [`MqInfra`] trait and [`new_infra`]
//! - [`policy`] - Translation of [`Policy`] into each backend's settings
//! - [`providers`] - SQS, Service Bus, Pub/Sub, RabbitMQ and in-memory provisioners

pub mod config;
pub mod error;
pub mod infra;
pub mod policy;
pub mod providers;

pub use config::{
    AzureServiceBusInfraConfig, InfraBackend, MqInfraConfig, MqInfraSettings, Policy,
};
pub use error::InfraError;
pub use infra::{new_infra, InvalidInfra, MqInfra};
pub use policy::NativeRetryPolicy;
