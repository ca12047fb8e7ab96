//! Per-backend provisioners.

use crate::error::InfraError;
use reqwest::Client as HttpClient;
use std::time::Duration;

pub mod aws;
pub mod azure;
pub mod gcp;
pub mod memory;
pub mod rabbitmq;

pub use aws::AwsSqsInfra;
pub use azure::AzureServiceBusInfra;
pub use gcp::GcpPubSubInfra;
pub use memory::InMemoryInfra;
pub use rabbitmq::RabbitMqInfra;

/// Timeout for management API requests
const MANAGEMENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Build the client used for management API requests. Construction cannot
/// fail, so a build error is kept and returned by [`http_client`].
fn management_client() -> Result<HttpClient, String> {
    HttpClient::builder()
        .timeout(MANAGEMENT_TIMEOUT)
        .build()
        .map_err(|e| e.to_string())
}

fn http_client(client: &Result<HttpClient, String>) -> Result<&HttpClient, InfraError> {
    client
        .as_ref()
        .map_err(|message| InfraError::HttpClient(message.clone()))
}
