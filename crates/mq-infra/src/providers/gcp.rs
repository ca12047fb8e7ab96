//! Pub/Sub provisioning through the REST v1 API.
//!
//! A declare creates four resources: the topic, a `<topic>-dlq` dead-letter
//! topic, a `<topic>-dlq-sub` subscription that retains dead-lettered
//! messages, and the main subscription whose dead-letter policy forwards to
//! the dead-letter topic. Creation is a PUT that tolerates `ALREADY_EXISTS`.
//!
//! Requests are authenticated with a token obtained by exchanging an RS256
//! service-account JWT. Without service-account credentials requests are sent
//! unauthenticated, which is what the Pub/Sub emulator expects.

use crate::config::Policy;
use crate::error::InfraError;
use crate::infra::MqInfra;
use crate::policy::{NativeRetryPolicy, PubSubDeadLetterPolicy};
use super::{http_client, management_client};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use mq_runtime::config::GcpPubSubConfig;
use reqwest::{Client as HttpClient, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
#[path = "gcp_tests.rs"]
mod tests;

pub const DEFAULT_PUBSUB_ENDPOINT: &str = "https://pubsub.googleapis.com";

pub const PUBSUB_SCOPE: &str = "https://www.googleapis.com/auth/pubsub";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Lifetime of the signed assertion; Google rejects anything above an hour
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// Tokens are exchanged again this long before they expire
const TOKEN_REFRESH_MARGIN_SECS: i64 = 300;

#[derive(Debug, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default)]
    token_uri: Option<String>,
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct GoogleErrorBody {
    error: Option<GoogleErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct GoogleErrorDetail {
    message: Option<String>,
    status: Option<String>,
}

pub struct GcpPubSubInfra {
    config: GcpPubSubConfig,
    policy: Policy,
    http_client: Result<HttpClient, String>,
    access_token: Mutex<Option<CachedToken>>,
}

impl GcpPubSubInfra {
    pub fn new(config: GcpPubSubConfig, policy: Policy) -> Self {
        if config.service_account_credentials.is_none() {
            debug!("No service account configured, sending unauthenticated requests");
        }

        Self {
            config,
            policy,
            http_client: management_client(),
            access_token: Mutex::new(None),
        }
    }

    pub fn dead_letter_topic(&self) -> String {
        format!("{}-dlq", self.config.topic)
    }

    pub fn dead_letter_subscription(&self) -> String {
        format!("{}-dlq-sub", self.config.topic)
    }

    fn endpoint(&self) -> &str {
        self.config
            .endpoint
            .as_deref()
            .unwrap_or(DEFAULT_PUBSUB_ENDPOINT)
            .trim_end_matches('/')
    }

    /// Resource name as Pub/Sub refers to it inside request bodies
    fn topic_name(&self, topic: &str) -> String {
        format!("projects/{}/topics/{}", self.config.project_id, topic)
    }

    fn topic_url(&self, topic: &str) -> String {
        format!("{}/v1/{}", self.endpoint(), self.topic_name(topic))
    }

    fn subscription_url(&self, subscription: &str) -> String {
        format!(
            "{}/v1/projects/{}/subscriptions/{}",
            self.endpoint(),
            self.config.project_id,
            subscription
        )
    }

    /// Bearer token for the next request, exchanged again shortly before the
    /// cached one expires. `None` when no service account is configured.
    async fn token(&self) -> Result<Option<String>, InfraError> {
        let Some(key) = self.config.service_account_credentials.as_deref() else {
            return Ok(None);
        };

        let mut cached = self.access_token.lock().await;
        if let Some(current) = cached.as_ref() {
            let refresh_at = current.expires_at - ChronoDuration::seconds(TOKEN_REFRESH_MARGIN_SECS);
            if refresh_at > Utc::now() {
                return Ok(Some(current.token.clone()));
            }
            debug!("Pub/Sub access token is about to expire, exchanging a new one");
        }

        let fresh = self.exchange_assertion(key).await?;
        let token = fresh.token.clone();
        *cached = Some(fresh);
        Ok(Some(token))
    }

    async fn exchange_assertion(&self, key_json: &str) -> Result<CachedToken, InfraError> {
        let key: ServiceAccountKey =
            serde_json::from_str(key_json).map_err(|e| InfraError::Authentication {
                message: format!("Invalid service account key: {}", e),
            })?;
        let token_uri = key.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI);
        let assertion = sign_assertion(&key, token_uri)?;

        let response = http_client(&self.http_client)?
            .post(token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InfraError::Authentication {
                message: format!("Token exchange failed ({}): {}", status.as_u16(), body),
            });
        }

        let token: TokenResponse = response.json().await?;
        let expires_in = token.expires_in.unwrap_or(ASSERTION_LIFETIME_SECS);
        info!(
            client_email = %key.client_email,
            expires_in,
            "Obtained Pub/Sub access token"
        );
        Ok(CachedToken {
            token: token.access_token,
            expires_at: Utc::now() + ChronoDuration::seconds(expires_in),
        })
    }

    async fn send(&self, method: Method, url: &str, body: Option<Value>) -> Result<(), InfraError> {
        let mut request = http_client(&self.http_client)?.request(method, url);
        if let Some(token) = self.token().await? {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        Err(pubsub_error(status, &text))
    }

    async fn create(&self, kind: &str, url: &str, body: Value) -> Result<(), InfraError> {
        match self.send(Method::PUT, url, Some(body)).await {
            Ok(()) => {
                info!(kind, url, "Created Pub/Sub resource");
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                warn!(kind, url, "Pub/Sub resource already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, kind: &str, url: &str) -> Result<(), InfraError> {
        match self.send(Method::DELETE, url, None).await {
            Ok(()) => {
                info!(kind, url, "Deleted Pub/Sub resource");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                warn!(kind, url, "Pub/Sub resource not found during teardown");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn resource_exists(&self, url: &str) -> Result<bool, InfraError> {
        match self.send(Method::GET, url, None).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn sign_assertion(key: &ServiceAccountKey, token_uri: &str) -> Result<String, InfraError> {
    let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes()).map_err(|e| {
        InfraError::Authentication {
            message: format!("Failed to create encoding key: {}", e),
        }
    })?;

    let now = Utc::now().timestamp();
    let claims = AssertionClaims {
        iss: &key.client_email,
        scope: PUBSUB_SCOPE,
        aud: token_uri,
        iat: now,
        exp: now + ASSERTION_LIFETIME_SECS,
    };

    encode(&Header::new(Algorithm::RS256), &claims, &encoding_key).map_err(|e| {
        InfraError::Authentication {
            message: format!("Failed to encode JWT: {}", e),
        }
    })
}

fn pubsub_error(status: StatusCode, body: &str) -> InfraError {
    let detail = serde_json::from_str::<GoogleErrorBody>(body)
        .ok()
        .and_then(|b| b.error);
    let message = match detail {
        Some(GoogleErrorDetail {
            message: Some(message),
            status: Some(code),
        }) => format!("{}: {}", code, message),
        Some(GoogleErrorDetail {
            message: Some(message),
            ..
        }) => message,
        _ => body.to_string(),
    };

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return InfraError::Authentication { message };
    }

    InfraError::PubSub {
        status: status.as_u16(),
        message,
    }
}

#[async_trait]
impl MqInfra for GcpPubSubInfra {
    #[instrument(skip(self))]
    async fn declare(&self) -> Result<(), InfraError> {
        let native = PubSubDeadLetterPolicy::from_policy(&self.policy);
        let dead_letter_topic = self.dead_letter_topic();

        self.create("topic", &self.topic_url(&self.config.topic), json!({}))
            .await?;
        self.create("topic", &self.topic_url(&dead_letter_topic), json!({}))
            .await?;
        self.create(
            "subscription",
            &self.subscription_url(&self.dead_letter_subscription()),
            json!({
                "topic": self.topic_name(&dead_letter_topic),
                "ackDeadlineSeconds": native.ack_deadline_secs,
            }),
        )
        .await?;
        self.create(
            "subscription",
            &self.subscription_url(&self.config.subscription),
            json!({
                "topic": self.topic_name(&self.config.topic),
                "ackDeadlineSeconds": native.ack_deadline_secs,
                "deadLetterPolicy": {
                    "deadLetterTopic": self.topic_name(&dead_letter_topic),
                    "maxDeliveryAttempts": native.max_delivery_attempts,
                },
            }),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn tear_down(&self) -> Result<(), InfraError> {
        self.delete(
            "subscription",
            &self.subscription_url(&self.config.subscription),
        )
        .await?;
        self.delete(
            "subscription",
            &self.subscription_url(&self.dead_letter_subscription()),
        )
        .await?;
        self.delete("topic", &self.topic_url(&self.config.topic))
            .await?;
        self.delete("topic", &self.topic_url(&self.dead_letter_topic()))
            .await
    }

    async fn exists(&self) -> Result<bool, InfraError> {
        Ok(self.resource_exists(&self.topic_url(&self.config.topic)).await?
            && self.resource_exists(&self.topic_url(&self.dead_letter_topic())).await?
            && self
                .resource_exists(&self.subscription_url(&self.dead_letter_subscription()))
                .await?
            && self
                .resource_exists(&self.subscription_url(&self.config.subscription))
                .await?)
    }
}
