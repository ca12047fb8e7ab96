//! Service Bus provisioning through Azure Resource Manager.
//!
//! Declares a topic and one subscription on it. Dead-lettering uses the
//! subscription's built-in `$deadletterqueue`, so no separate dead-letter
//! entity is created. Both resources are checked before being created and a
//! lost creation race (409) counts as success.

use crate::config::{AzureServiceBusInfraConfig, Policy};
use crate::error::InfraError;
use crate::infra::MqInfra;
use crate::policy::{NativeRetryPolicy, ServiceBusDeliveryPolicy};
use super::{http_client, management_client};
use async_trait::async_trait;
use mq_runtime::providers::AadCredential;
use reqwest::{Client as HttpClient, Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
#[path = "azure_tests.rs"]
mod tests;

/// Resource Manager API version for Microsoft.ServiceBus
pub const ARM_API_VERSION: &str = "2021-11-01";

/// Time-to-live applied to topics and subscriptions
const DEFAULT_MESSAGE_TTL: &str = "P14D";

const TOPIC_MAX_SIZE_MB: u32 = 1024;

#[derive(Debug, Deserialize)]
struct ArmErrorBody {
    error: Option<ArmErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ArmErrorDetail {
    code: Option<String>,
    message: Option<String>,
}

pub struct AzureServiceBusInfra {
    config: AzureServiceBusInfraConfig,
    policy: Policy,
    http_client: Result<HttpClient, String>,
    credential: Result<AadCredential, String>,
}

impl AzureServiceBusInfra {
    pub fn new(config: AzureServiceBusInfraConfig, policy: Policy) -> Self {
        let credential = AadCredential::new(
            config.tenant_id.clone(),
            config.client_id.clone(),
            config.client_secret.clone(),
            config.authority_host.as_deref(),
        )
        .map_err(|e| e.to_string());

        Self {
            config,
            policy,
            http_client: management_client(),
            credential,
        }
    }

    fn namespace_url(&self) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.ServiceBus/namespaces/{}",
            self.config.management_endpoint(),
            self.config.subscription_id,
            self.config.resource_group,
            self.config.namespace
        )
    }

    fn topic_url(&self) -> String {
        format!("{}/topics/{}", self.namespace_url(), self.config.topic)
    }

    fn subscription_url(&self) -> String {
        format!(
            "{}/subscriptions/{}",
            self.topic_url(),
            self.config.subscription
        )
    }

    fn management_scope(&self) -> String {
        format!("{}/.default", self.config.management_endpoint())
    }

    async fn send(&self, method: Method, url: &str, body: Option<Value>) -> Result<(), InfraError> {
        let credential = self
            .credential
            .as_ref()
            .map_err(|message| InfraError::Authentication {
                message: message.clone(),
            })?;
        let token = credential.token(&self.management_scope()).await?;

        let mut request = http_client(&self.http_client)?
            .request(method, url)
            .query(&[("api-version", ARM_API_VERSION)])
            .bearer_auth(token);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        Err(arm_error(status, &text))
    }

    /// `Ok(true)` when the resource at `url` exists
    async fn resource_exists(&self, url: &str) -> Result<bool, InfraError> {
        match self.send(Method::GET, url, None).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn ensure(&self, kind: &str, url: &str, properties: Value) -> Result<(), InfraError> {
        if self.resource_exists(url).await? {
            debug!(kind, url, "Service Bus entity already exists");
            return Ok(());
        }

        match self
            .send(Method::PUT, url, Some(json!({ "properties": properties })))
            .await
        {
            Ok(()) => {
                info!(kind, url, "Created Service Bus entity");
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                warn!(kind, url, "Service Bus entity created concurrently");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, kind: &str, url: &str) -> Result<(), InfraError> {
        match self.send(Method::DELETE, url, None).await {
            Ok(()) => {
                info!(kind, url, "Deleted Service Bus entity");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                warn!(kind, url, "Service Bus entity not found during teardown");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn arm_error(status: StatusCode, body: &str) -> InfraError {
    let detail = serde_json::from_str::<ArmErrorBody>(body)
        .ok()
        .and_then(|b| b.error);
    let (code, message) = match detail {
        Some(detail) => (
            detail.code.unwrap_or_default(),
            detail.message.unwrap_or_default(),
        ),
        None => (String::new(), body.to_string()),
    };

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return InfraError::Authentication {
            message: format!("{} {}: {}", status.as_u16(), code, message),
        };
    }

    InfraError::Azure {
        status: status.as_u16(),
        code,
        message,
    }
}

#[async_trait]
impl MqInfra for AzureServiceBusInfra {
    #[instrument(skip(self))]
    async fn declare(&self) -> Result<(), InfraError> {
        self.ensure(
            "topic",
            &self.topic_url(),
            json!({
                "maxSizeInMegabytes": TOPIC_MAX_SIZE_MB,
                "defaultMessageTimeToLive": DEFAULT_MESSAGE_TTL,
                "enablePartitioning": false,
                "requiresDuplicateDetection": false,
                "supportOrdering": true,
            }),
        )
        .await?;

        let native = ServiceBusDeliveryPolicy::from_policy(&self.policy);
        self.ensure(
            "subscription",
            &self.subscription_url(),
            json!({
                "lockDuration": native.lock_duration_iso8601(),
                "defaultMessageTimeToLive": DEFAULT_MESSAGE_TTL,
                "deadLetteringOnMessageExpiration": true,
                "maxDeliveryCount": native.max_delivery_count,
                "enableBatchedOperations": true,
                "requiresSession": false,
            }),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn tear_down(&self) -> Result<(), InfraError> {
        self.delete("subscription", &self.subscription_url()).await?;
        self.delete("topic", &self.topic_url()).await
    }

    async fn exists(&self) -> Result<bool, InfraError> {
        Ok(self.resource_exists(&self.topic_url()).await?
            && self.resource_exists(&self.subscription_url()).await?)
    }
}
