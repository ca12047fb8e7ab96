//! SQS provisioning: a `<queue>-dlq` dead-letter queue and a main queue whose
//! redrive policy points at it.

use crate::config::Policy;
use crate::error::InfraError;
use crate::infra::MqInfra;
use crate::policy::{NativeRetryPolicy, SqsRedrivePolicy};
use async_trait::async_trait;
use mq_runtime::config::AwsSqsConfig;
use mq_runtime::providers::{AwsError, SqsClient};
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
#[path = "aws_tests.rs"]
mod tests;

pub struct AwsSqsInfra {
    config: AwsSqsConfig,
    policy: Policy,
}

impl AwsSqsInfra {
    pub fn new(config: AwsSqsConfig, policy: Policy) -> Self {
        Self { config, policy }
    }

    pub fn dead_letter_queue(&self) -> String {
        format!("{}-dlq", self.config.queue)
    }

    fn client(&self) -> Result<SqsClient, InfraError> {
        Ok(SqsClient::new(&self.config)?)
    }
}

/// Return the URL of `name`, creating the queue with `attributes` when absent
async fn ensure_queue(
    client: &SqsClient,
    name: &str,
    attributes: &BTreeMap<String, String>,
) -> Result<String, InfraError> {
    match client.get_queue_url(name).await {
        Ok(url) => {
            debug!(queue = %name, "Queue already exists");
            Ok(url)
        }
        Err(e) if e.is_queue_not_found() => {
            let url = client.create_queue(name, attributes).await?;
            info!(queue = %name, url = %url, "Created queue");
            Ok(url)
        }
        Err(e) => Err(e.into()),
    }
}

/// Delete `name`, treating a missing queue as deleted
async fn delete_if_present(client: &SqsClient, name: &str) -> Result<(), InfraError> {
    let url = match client.get_queue_url(name).await {
        Ok(url) => url,
        Err(e) if e.is_queue_not_found() => {
            warn!(queue = %name, "Queue not found during teardown");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    match client.delete_queue(&url).await {
        Ok(()) => {
            info!(queue = %name, "Deleted queue");
            Ok(())
        }
        Err(e) if e.is_queue_not_found() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn queue_exists(client: &SqsClient, name: &str) -> Result<bool, InfraError> {
    match client.get_queue_url(name).await {
        Ok(_) => Ok(true),
        Err(e) if e.is_queue_not_found() => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl MqInfra for AwsSqsInfra {
    #[instrument(skip(self))]
    async fn declare(&self) -> Result<(), InfraError> {
        let client = self.client()?;
        let native = SqsRedrivePolicy::from_policy(&self.policy);

        let mut attributes = BTreeMap::new();
        if let Some(secs) = native.visibility_timeout_secs {
            attributes.insert("VisibilityTimeout".to_string(), secs.to_string());
        }

        let dead_letter = self.dead_letter_queue();
        let dead_letter_url = ensure_queue(&client, &dead_letter, &attributes).await?;
        let dead_letter_arn = client
            .get_queue_attributes(&dead_letter_url, &["QueueArn"])
            .await?
            .remove("QueueArn")
            .ok_or_else(|| {
                AwsError::SerializationError(format!("QueueArn missing for {}", dead_letter))
            })?;

        attributes.insert(
            "RedrivePolicy".to_string(),
            native.redrive_json(&dead_letter_arn),
        );
        let url = ensure_queue(&client, &self.config.queue, &attributes).await?;

        // CreateQueue leaves an existing queue's attributes untouched
        client.set_queue_attributes(&url, &attributes).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn tear_down(&self) -> Result<(), InfraError> {
        let client = self.client()?;
        delete_if_present(&client, &self.config.queue).await?;
        delete_if_present(&client, &self.dead_letter_queue()).await
    }

    async fn exists(&self) -> Result<bool, InfraError> {
        let client = self.client()?;
        Ok(queue_exists(&client, &self.config.queue).await?
            && queue_exists(&client, &self.dead_letter_queue()).await?)
    }
}
