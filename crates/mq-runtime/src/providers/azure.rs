//! Azure Service Bus adapter using the Service Bus REST data plane.
//!
//! Publishing targets a topic; receiving peek-locks messages from a named
//! subscription on that topic, or from the subscription's dead-letter
//! sub-queue when `dead_letter` is set.
//!
//! ## Authentication Methods
//!
//! - **Connection string**: a SAS token is derived per request from the
//!   shared access key
//! - **Service principal**: an Azure AD client-credentials token, cached
//!   until shortly before it expires
//!
//! [`AadCredential`] is also used for Azure Resource Manager calls during
//! provisioning.

use crate::config::AzureServiceBusConfig;
use crate::error::{ConfigurationError, QueueError, SerializationError};
use crate::init::OnceInit;
use crate::message::{Acknowledger, IncomingMessage, Message};
use crate::queue::{Cleanup, Queue, Subscription};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client as HttpClient, Method, StatusCode};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[cfg(test)]
#[path = "azure_tests.rs"]
mod tests;

/// Default Azure AD authority
pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

/// Scope for Service Bus data-plane tokens
pub const SERVICE_BUS_SCOPE: &str = "https://servicebus.azure.net/.default";

/// Server-side wait for a peek-lock receive, in seconds
const RECEIVE_TIMEOUT_SECONDS: u64 = 60;

/// SAS token lifetime
const SAS_TOKEN_TTL_SECONDS: i64 = 3600;

// ============================================================================
// Error Types
// ============================================================================

/// Azure Service Bus specific errors
#[derive(Debug, thiserror::Error)]
pub enum AzureError {
    #[error("Authentication failed: {0}")]
    AuthenticationError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Service Bus error ({status}): {message}")]
    ServiceBusError { status: u16, message: String },

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Message lock lost: {0}")]
    MessageLockLost(String),

    #[error("Invalid configuration: {0}")]
    ConfigurationError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl AzureError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::AuthenticationError(_) => false,
            Self::NetworkError(_) => true,
            Self::ServiceBusError { status, .. } => *status >= 500 || *status == 429,
            Self::NotFound(_) => false,
            Self::MessageLockLost(_) => false,
            Self::ConfigurationError(_) => false,
            Self::SerializationError(_) => false,
        }
    }

    /// Map Azure error to QueueError
    pub fn to_queue_error(self) -> QueueError {
        match self {
            Self::AuthenticationError(msg) => QueueError::AuthenticationFailed { message: msg },
            Self::NetworkError(msg) => QueueError::ConnectionFailed { message: msg },
            Self::ServiceBusError { status, message } => QueueError::ProviderError {
                provider: "AzureServiceBus".to_string(),
                code: status.to_string(),
                message,
            },
            Self::NotFound(entity) => QueueError::QueueNotFound { queue_name: entity },
            Self::MessageLockLost(msg) => QueueError::MessageNotFound { receipt: msg },
            Self::ConfigurationError(msg) => {
                QueueError::ConfigurationError(ConfigurationError::Invalid { message: msg })
            }
            Self::SerializationError(msg) => {
                QueueError::SerializationError(SerializationError::InvalidEncoding {
                    message: msg,
                })
            }
        }
    }

    fn from_request(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::NetworkError(format!("Request timeout: {}", e))
        } else if e.is_connect() {
            Self::NetworkError(format!("Connection failed: {}", e))
        } else {
            Self::NetworkError(format!("HTTP request failed: {}", e))
        }
    }
}

impl From<AzureError> for QueueError {
    fn from(err: AzureError) -> Self {
        err.to_queue_error()
    }
}

// ============================================================================
// Azure AD Client Credentials
// ============================================================================

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Service principal credential issuing Azure AD bearer tokens
pub struct AadCredential {
    http_client: HttpClient,
    authority_host: String,
    tenant_id: String,
    client_id: String,
    client_secret: String,
    cache: Mutex<HashMap<String, CachedToken>>,
}

impl AadCredential {
    pub fn new(
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        authority_host: Option<&str>,
    ) -> Result<Self, AzureError> {
        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AzureError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            authority_host: authority_host
                .unwrap_or(DEFAULT_AUTHORITY_HOST)
                .trim_end_matches('/')
                .to_string(),
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Bearer token for `scope`, refreshed five minutes before expiry
    pub async fn token(&self, scope: &str) -> Result<String, AzureError> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.get(scope) {
            if cached.expires_at - ChronoDuration::minutes(5) > Utc::now() {
                return Ok(cached.token.clone());
            }
        }

        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority_host, self.tenant_id
        );
        let response = self
            .http_client
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", scope),
            ])
            .send()
            .await
            .map_err(AzureError::from_request)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AzureError::AuthenticationError(format!(
                "token request returned {}: {}",
                status, body
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AzureError::AuthenticationError(format!("Invalid token response: {}", e)))?;

        debug!(scope, expires_in = token.expires_in, "Acquired Azure AD token");
        cache.insert(
            scope.to_string(),
            CachedToken {
                token: token.access_token.clone(),
                expires_at: Utc::now() + ChronoDuration::seconds(token.expires_in),
            },
        );
        Ok(token.access_token)
    }
}

impl fmt::Debug for AadCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AadCredential")
            .field("authority_host", &self.authority_host)
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

// ============================================================================
// Shared Access Signatures
// ============================================================================

/// Parts of a Service Bus connection string
#[derive(Clone, PartialEq)]
pub struct ConnectionString {
    /// `https://` form of the namespace endpoint
    pub endpoint: String,
    pub key_name: String,
    pub key: String,
}

impl ConnectionString {
    /// Parse `Endpoint=sb://...;SharedAccessKeyName=...;SharedAccessKey=...`
    pub fn parse(raw: &str) -> Result<Self, AzureError> {
        let mut endpoint = None;
        let mut key_name = None;
        let mut key = None;

        for part in raw.split(';').filter(|p| !p.trim().is_empty()) {
            let (name, value) = part.split_once('=').ok_or_else(|| {
                AzureError::ConfigurationError("Malformed connection string segment".to_string())
            })?;
            match name.trim() {
                "Endpoint" => endpoint = Some(value.trim().to_string()),
                "SharedAccessKeyName" => key_name = Some(value.trim().to_string()),
                "SharedAccessKey" => key = Some(value.trim().to_string()),
                _ => {}
            }
        }

        let endpoint = endpoint.ok_or_else(|| {
            AzureError::ConfigurationError("Connection string has no Endpoint".to_string())
        })?;
        let endpoint = match endpoint.strip_prefix("sb://") {
            Some(host) => format!("https://{}", host),
            None => endpoint,
        };

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            key_name: key_name.ok_or_else(|| {
                AzureError::ConfigurationError(
                    "Connection string has no SharedAccessKeyName".to_string(),
                )
            })?,
            key: key.ok_or_else(|| {
                AzureError::ConfigurationError("Connection string has no SharedAccessKey".to_string())
            })?,
        })
    }
}

impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionString")
            .field("endpoint", &self.endpoint)
            .field("key_name", &self.key_name)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Build a SAS token for `resource_uri` valid until `expiry` (unix seconds)
pub fn generate_sas_token(resource_uri: &str, key_name: &str, key: &str, expiry: i64) -> String {
    let encoded_uri = urlencoding::encode(resource_uri);
    let string_to_sign = format!("{}\n{}", encoded_uri, expiry);

    let signature = match Hmac::<Sha256>::new_from_slice(key.as_bytes()) {
        Ok(mut mac) => {
            mac.update(string_to_sign.as_bytes());
            STANDARD.encode(mac.finalize().into_bytes())
        }
        Err(_) => String::new(),
    };

    format!(
        "SharedAccessSignature sr={}&sig={}&se={}&skn={}",
        encoded_uri,
        urlencoding::encode(&signature),
        expiry,
        key_name
    )
}

enum ServiceBusAuth {
    Sas(ConnectionString),
    Aad(AadCredential),
}

// ============================================================================
// Service Bus REST Client
// ============================================================================

/// Broker metadata returned in the `BrokerProperties` header
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BrokerProperties {
    message_id: Option<String>,
    lock_token: Option<String>,
    delivery_count: Option<u32>,
}

/// A peek-locked message
#[derive(Debug, Clone)]
struct LockedMessage {
    message_id: String,
    lock_location: String,
    delivery_count: Option<u32>,
    body: Vec<u8>,
}

struct ServiceBusClient {
    http_client: HttpClient,
    endpoint: String,
    auth: ServiceBusAuth,
}

impl ServiceBusClient {
    fn new(config: &AzureServiceBusConfig) -> Result<Self, AzureError> {
        let (auth, default_endpoint) = match config.connection_string.as_deref() {
            Some(raw) if !raw.is_empty() => {
                let connection = ConnectionString::parse(raw)?;
                let endpoint = connection.endpoint.clone();
                (ServiceBusAuth::Sas(connection), endpoint)
            }
            _ => {
                let namespace = config.namespace.as_deref().unwrap_or_default();
                let credential = AadCredential::new(
                    config.tenant_id.clone().unwrap_or_default(),
                    config.client_id.clone().unwrap_or_default(),
                    config.client_secret.clone().unwrap_or_default(),
                    config.authority_host.as_deref(),
                )?;
                (
                    ServiceBusAuth::Aad(credential),
                    format!("https://{}.servicebus.windows.net", namespace),
                )
            }
        };

        let endpoint = config
            .endpoint
            .as_deref()
            .filter(|e| !e.is_empty())
            .map(|e| e.trim_end_matches('/').to_string())
            .unwrap_or(default_endpoint);

        // Peek-lock receives hold the request open for the server-side timeout
        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(RECEIVE_TIMEOUT_SECONDS + 30))
            .build()
            .map_err(|e| AzureError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            endpoint,
            auth,
        })
    }

    async fn authorization(&self) -> Result<String, AzureError> {
        match &self.auth {
            ServiceBusAuth::Sas(connection) => Ok(generate_sas_token(
                &self.endpoint,
                &connection.key_name,
                &connection.key,
                Utc::now().timestamp() + SAS_TOKEN_TTL_SECONDS,
            )),
            ServiceBusAuth::Aad(credential) => Ok(format!(
                "Bearer {}",
                credential.token(SERVICE_BUS_SCOPE).await?
            )),
        }
    }

    async fn request(&self, method: Method, url: &str) -> Result<reqwest::RequestBuilder, AzureError> {
        Ok(self
            .http_client
            .request(method, url)
            .header("Authorization", self.authorization().await?))
    }

    async fn send(&self, topic: &str, body: &[u8]) -> Result<(), AzureError> {
        let url = format!("{}/{}/messages", self.endpoint, topic);
        let response = self
            .request(Method::POST, &url)
            .await?
            .header("Content-Type", "application/json")
            .body(body.to_vec())
            .send()
            .await
            .map_err(AzureError::from_request)?;

        match response.status() {
            StatusCode::CREATED | StatusCode::OK => Ok(()),
            status => Err(error_from_status(status, response.text().await.unwrap_or_default(), topic)),
        }
    }

    /// Peek-lock the head message of an entity path, `None` when the
    /// server-side wait elapsed without a message
    async fn peek_lock(&self, entity_path: &str) -> Result<Option<LockedMessage>, AzureError> {
        let url = format!(
            "{}/{}/messages/head?timeout={}",
            self.endpoint, entity_path, RECEIVE_TIMEOUT_SECONDS
        );
        let response = self
            .request(Method::POST, &url)
            .await?
            .header("Content-Length", "0")
            .send()
            .await
            .map_err(AzureError::from_request)?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::CREATED | StatusCode::OK => {
                let properties: BrokerProperties = response
                    .headers()
                    .get("BrokerProperties")
                    .and_then(|v| v.to_str().ok())
                    .map(serde_json::from_str)
                    .transpose()
                    .map_err(|e| {
                        AzureError::SerializationError(format!("Invalid BrokerProperties: {}", e))
                    })?
                    .ok_or_else(|| {
                        AzureError::SerializationError("Missing BrokerProperties header".into())
                    })?;

                let message_id = properties.message_id.unwrap_or_default();
                let lock_location = match response
                    .headers()
                    .get("Location")
                    .and_then(|v| v.to_str().ok())
                {
                    Some(location) => location.to_string(),
                    None => format!(
                        "{}/{}/messages/{}/{}",
                        self.endpoint,
                        entity_path,
                        message_id,
                        properties.lock_token.unwrap_or_default()
                    ),
                };

                let body = response.bytes().await.map_err(AzureError::from_request)?;
                Ok(Some(LockedMessage {
                    message_id,
                    lock_location,
                    delivery_count: properties.delivery_count,
                    body: body.to_vec(),
                }))
            }
            status => Err(error_from_status(
                status,
                response.text().await.unwrap_or_default(),
                entity_path,
            )),
        }
    }

    /// Complete (`DELETE`) or abandon (`PUT`) a locked message
    async fn settle(&self, lock_location: &str, method: Method) -> Result<(), AzureError> {
        let response = self
            .request(method, lock_location)
            .await?
            .header("Content-Length", "0")
            .send()
            .await
            .map_err(AzureError::from_request)?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::GONE | StatusCode::NOT_FOUND => {
                Err(AzureError::MessageLockLost(lock_location.to_string()))
            }
            status => Err(error_from_status(
                status,
                response.text().await.unwrap_or_default(),
                lock_location,
            )),
        }
    }
}

fn error_from_status(status: StatusCode, body: String, entity: &str) -> AzureError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            AzureError::AuthenticationError(format!("{}: {}", status, body))
        }
        StatusCode::NOT_FOUND => AzureError::NotFound(entity.to_string()),
        _ => AzureError::ServiceBusError {
            status: status.as_u16(),
            message: body,
        },
    }
}

// ============================================================================
// Queue Adapter
// ============================================================================

/// [`Queue`] over a Service Bus topic and subscription
pub struct AzureServiceBusQueue {
    config: AzureServiceBusConfig,
    client: OnceInit<Arc<ServiceBusClient>>,
}

impl AzureServiceBusQueue {
    pub fn new(config: AzureServiceBusConfig) -> Self {
        Self {
            config,
            client: OnceInit::new(),
        }
    }

    async fn open(&self) -> Result<&Arc<ServiceBusClient>, QueueError> {
        self.client
            .get_or_init(|| async {
                let client = ServiceBusClient::new(&self.config)?;
                debug!(
                    endpoint = %client.endpoint,
                    topic = %self.config.topic,
                    "Opened Service Bus client"
                );
                Ok(Arc::new(client))
            })
            .await
    }

    /// Entity path the subscription receives from
    fn receive_path(&self) -> String {
        let base = format!(
            "{}/subscriptions/{}",
            self.config.topic, self.config.subscription
        );
        if self.config.dead_letter {
            format!("{}/$deadletterqueue", base)
        } else {
            base
        }
    }
}

#[async_trait]
impl Queue for AzureServiceBusQueue {
    async fn init(&self) -> Result<Cleanup, QueueError> {
        self.open().await?;
        Ok(Cleanup::noop())
    }

    async fn publish(&self, message: &dyn IncomingMessage) -> Result<(), QueueError> {
        let client = self.client.get().ok_or_else(|| QueueError::NotInitialized {
            queue_name: self.config.topic.clone(),
        })?;
        let message = message.to_message()?;
        client.send(&self.config.topic, &message.body).await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<Box<dyn Subscription>, QueueError> {
        let client = self.open().await?;
        Ok(Box::new(AzureServiceBusSubscription {
            client: Arc::clone(client),
            entity_path: self.receive_path(),
            closed: CancellationToken::new(),
        }))
    }
}

/// Peek-lock receive handle on a Service Bus subscription
pub struct AzureServiceBusSubscription {
    client: Arc<ServiceBusClient>,
    entity_path: String,
    closed: CancellationToken,
}

#[async_trait]
impl Subscription for AzureServiceBusSubscription {
    async fn receive(&self) -> Result<Message, QueueError> {
        loop {
            let locked = tokio::select! {
                biased;
                _ = self.closed.cancelled() => return Err(QueueError::SubscriptionClosed),
                locked = self.client.peek_lock(&self.entity_path) => locked?,
            };

            if let Some(locked) = locked {
                let acknowledger = ServiceBusAcknowledger {
                    client: Arc::clone(&self.client),
                    lock_location: locked.lock_location,
                };
                let mut message =
                    Message::received(locked.body, locked.message_id, Box::new(acknowledger));
                if let Some(count) = locked.delivery_count {
                    message = message.with_delivery_count(count);
                }
                return Ok(message);
            }
        }
    }

    async fn shutdown(&self) -> Result<(), QueueError> {
        self.closed.cancel();
        Ok(())
    }
}

struct ServiceBusAcknowledger {
    client: Arc<ServiceBusClient>,
    lock_location: String,
}

#[async_trait]
impl Acknowledger for ServiceBusAcknowledger {
    async fn ack(&self) -> Result<(), QueueError> {
        self.client.settle(&self.lock_location, Method::DELETE).await?;
        Ok(())
    }

    async fn nack(&self) -> Result<(), QueueError> {
        self.client.settle(&self.lock_location, Method::PUT).await?;
        Ok(())
    }
}
