//! Backend adapters.
//!
//! Each adapter implements [`Queue`](crate::queue::Queue) for one broker.
//! GCP Pub/Sub has no runtime adapter; see
//! [`UnimplementedQueue`](crate::queue::UnimplementedQueue).

pub mod aws;
pub mod azure;
pub mod memory;
pub mod rabbitmq;

pub use aws::{AwsError, AwsSqsQueue, SqsClient, SqsMessage};
pub use azure::{AadCredential, AzureError, AzureServiceBusQueue};
pub use memory::{InMemoryBroker, InMemoryQueue, TopicOptions, DEFAULT_VISIBILITY_TIMEOUT};
pub use rabbitmq::RabbitMqQueue;
