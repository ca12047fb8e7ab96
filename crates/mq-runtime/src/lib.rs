//! # MQ Runtime
//!
//! Backend-agnostic publish/subscribe over AWS SQS, Azure Service Bus,
//! RabbitMQ and an in-process broker.
//!
//! This library provides:
//! - A message model with explicit, consuming acknowledgement
//! - One adapter per backend behind the [`Queue`] and [`Subscription`] traits
//! - Backend selection from a validated [`QueueConfig`]
//! - A [`Consumer`] that drives a subscription with bounded concurrency
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all queue operations
//! - [`message`] - Messages, acknowledgers and payload encoding
//! - [`config`] - Backend configuration and loading
//! - [`queue`] - Capability traits and backend selection
//! - [`init`] - Once-only adapter initialization
//! - [`providers`] - Backend adapters
//! - [`consumer`] - Receive loop with bounded concurrency

pub mod config;
pub mod consumer;
pub mod error;
pub mod init;
pub mod message;
pub mod providers;
pub mod queue;

pub use config::{
    AwsCredentials, AwsSqsConfig, AzureServiceBusConfig, GcpPubSubConfig, InMemoryConfig,
    QueueConfig, QueueSettings, RabbitMqConfig,
};
pub use consumer::{Consumer, MessageHandler};
pub use error::{ConfigurationError, QueueError, SerializationError};
pub use init::{InitState, OnceInit};
pub use message::{Acknowledger, IncomingMessage, Json, Message};
pub use queue::{new_queue, Cleanup, Queue, Subscription, UnimplementedQueue};
