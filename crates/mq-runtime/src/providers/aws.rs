//! AWS SQS adapter using the SQS Query API over HTTP.
//!
//! Requests are signed with AWS Signature V4 and responses are parsed from
//! XML. [`SqsClient`] covers both the data-plane calls used by the queue
//! adapter and the queue-management calls used by provisioning.
//!
//! ## Message encoding
//!
//! Bodies are base64 encoded on send and decoded on receive so arbitrary
//! bytes survive the XML transport.
//!
//! ## Settlement
//!
//! - ack: `DeleteMessage` with the receipt handle
//! - nack: `ChangeMessageVisibility` to 0, making the message immediately
//!   receivable again; SQS counts the receive toward the redrive policy

use crate::config::{AwsCredentials, AwsSqsConfig};
use crate::error::{ConfigurationError, QueueError, SerializationError};
use crate::init::OnceInit;
use crate::message::{Acknowledger, IncomingMessage, Message};
use crate::queue::{Cleanup, Queue, Subscription};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Client as HttpClient;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

#[cfg(test)]
#[path = "aws_tests.rs"]
mod tests;

const SQS_API_VERSION: &str = "2012-11-05";

/// Maximum long-poll wait supported by SQS
pub const MAX_WAIT_TIME_SECONDS: u32 = 20;

/// Maximum encoded message size accepted by SQS
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;

// ============================================================================
// Error Types
// ============================================================================

/// AWS SQS specific errors
#[derive(Debug, thiserror::Error)]
pub enum AwsError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("SQS service error: {code}: {message}")]
    ServiceError { code: String, message: String },

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Invalid receipt handle: {0}")]
    InvalidReceipt(String),

    #[error("Message too large: {size} bytes (max: {max_size})")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("Invalid configuration: {0}")]
    ConfigurationError(String),

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl AwsError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Authentication(_) => false,
            Self::NetworkError(_) => true,
            Self::ServiceError { .. } => true, // Most SQS errors are transient
            Self::QueueNotFound(_) => false,
            Self::InvalidReceipt(_) => false,
            Self::MessageTooLarge { .. } => false,
            Self::ConfigurationError(_) => false,
            Self::InvalidCredentials => false,
            Self::SerializationError(_) => false,
        }
    }

    pub fn is_queue_not_found(&self) -> bool {
        matches!(self, Self::QueueNotFound(_))
    }

    /// Map AWS error to QueueError
    pub fn to_queue_error(self) -> QueueError {
        match self {
            Self::Authentication(msg) => QueueError::AuthenticationFailed { message: msg },
            Self::NetworkError(msg) => QueueError::ConnectionFailed { message: msg },
            Self::ServiceError { code, message } => QueueError::ProviderError {
                provider: "AwsSqs".to_string(),
                code,
                message,
            },
            Self::QueueNotFound(queue) => QueueError::QueueNotFound { queue_name: queue },
            Self::InvalidReceipt(receipt) => QueueError::MessageNotFound { receipt },
            Self::MessageTooLarge { size, max_size } => {
                QueueError::SerializationError(SerializationError::MessageTooLarge {
                    size,
                    max_size,
                })
            }
            Self::ConfigurationError(msg) => {
                QueueError::ConfigurationError(ConfigurationError::Invalid { message: msg })
            }
            Self::InvalidCredentials => {
                QueueError::ConfigurationError(ConfigurationError::InvalidCredentials)
            }
            Self::SerializationError(msg) => {
                QueueError::SerializationError(SerializationError::InvalidEncoding {
                    message: msg,
                })
            }
        }
    }
}

impl From<AwsError> for QueueError {
    fn from(err: AwsError) -> Self {
        err.to_queue_error()
    }
}

// ============================================================================
// AWS Signature V4 Signing
// ============================================================================

type HmacSha256 = Hmac<Sha256>;

/// AWS Signature Version 4 signer for request authentication
///
/// 1. Create canonical request (method, URI, query, headers, payload)
/// 2. Create string to sign (algorithm, timestamp, scope, request hash)
/// 3. Derive signing key (4-level HMAC chain)
/// 4. Calculate signature and build Authorization header
#[derive(Clone)]
pub(crate) struct AwsV4Signer {
    credentials: AwsCredentials,
    region: String,
    service: String,
}

impl AwsV4Signer {
    pub(crate) fn new(credentials: AwsCredentials, region: String) -> Self {
        Self {
            credentials,
            region,
            service: "sqs".to_string(),
        }
    }

    /// Sign a request and return the headers to attach.
    ///
    /// Always includes `Authorization` and `x-amz-date`; adds
    /// `x-amz-security-token` when a session token is configured.
    pub(crate) fn sign_request(
        &self,
        method: &str,
        host: &str,
        path: &str,
        query_params: &BTreeMap<String, String>,
        body: &str,
        timestamp: &DateTime<Utc>,
    ) -> Vec<(String, String)> {
        let date_stamp = timestamp.format("%Y%m%d").to_string();
        let amz_date = timestamp.format("%Y%m%dT%H%M%SZ").to_string();

        // BTreeMap iteration is already sorted by key
        let canonical_query_string = encode_query(query_params);

        let token = &self.credentials.session_token;
        let (canonical_headers, signed_headers) = if token.is_empty() {
            (
                format!("host:{}\nx-amz-date:{}\n", host, amz_date),
                "host;x-amz-date",
            )
        } else {
            (
                format!(
                    "host:{}\nx-amz-date:{}\nx-amz-security-token:{}\n",
                    host, amz_date, token
                ),
                "host;x-amz-date;x-amz-security-token",
            )
        };

        let payload_hash = format!("{:x}", Sha256::digest(body.as_bytes()));

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, path, canonical_query_string, canonical_headers, signed_headers, payload_hash
        );

        let algorithm = "AWS4-HMAC-SHA256";
        let credential_scope = format!(
            "{}/{}/{}/aws4_request",
            date_stamp, self.region, self.service
        );
        let canonical_request_hash = format!("{:x}", Sha256::digest(canonical_request.as_bytes()));

        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            algorithm, amz_date, credential_scope, canonical_request_hash
        );

        let signature = self.calculate_signature(&string_to_sign, &date_stamp);

        let authorization_header = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            algorithm,
            self.credentials.access_key_id,
            credential_scope,
            signed_headers,
            signature
        );

        let mut headers = vec![
            ("Authorization".to_string(), authorization_header),
            ("x-amz-date".to_string(), amz_date),
        ];
        if !token.is_empty() {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers
    }

    /// kSigning = HMAC(HMAC(HMAC(HMAC("AWS4" + secret, date), region), service), "aws4_request")
    fn calculate_signature(&self, string_to_sign: &str, date_stamp: &str) -> String {
        let k_secret = format!("AWS4{}", self.credentials.secret_access_key);
        let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes());
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, self.service.as_bytes());
        let k_signing = hmac_sha256(&k_service, b"aws4_request");
        let signature = hmac_sha256(&k_signing, string_to_sign.as_bytes());

        hex::encode(signature)
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, so this cannot fail
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn encode_query(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

// ============================================================================
// SQS Client
// ============================================================================

/// A message returned by `ReceiveMessage`
#[derive(Debug, Clone, PartialEq)]
pub struct SqsMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: Vec<u8>,
    pub receive_count: Option<u32>,
}

/// Signed SQS Query API client
#[derive(Clone)]
pub struct SqsClient {
    http_client: HttpClient,
    signer: AwsV4Signer,
    endpoint: Url,
}

impl SqsClient {
    /// Create a client from validated SQS configuration
    pub fn new(config: &AwsSqsConfig) -> Result<Self, AwsError> {
        if config.region.is_empty() {
            return Err(AwsError::ConfigurationError(
                "Region cannot be empty".to_string(),
            ));
        }

        let credentials = config
            .parsed_credentials()
            .map_err(|_| AwsError::InvalidCredentials)?;

        let endpoint = Url::parse(&config.endpoint_url()).map_err(|e| {
            AwsError::ConfigurationError(format!("Invalid SQS endpoint: {}", e))
        })?;

        // Long polls hold the connection for up to 20 seconds
        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(30 + u64::from(MAX_WAIT_TIME_SECONDS)))
            .build()
            .map_err(|e| AwsError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            signer: AwsV4Signer::new(credentials, config.region.clone()),
            endpoint,
        })
    }

    fn host(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or_default();
        match self.endpoint.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    /// Send a signed Query API action and return the raw XML response
    async fn call(
        &self,
        action: &str,
        params: impl IntoIterator<Item = (String, String)>,
    ) -> Result<String, AwsError> {
        let mut query: BTreeMap<String, String> = params.into_iter().collect();
        query.insert("Action".to_string(), action.to_string());
        query.insert("Version".to_string(), SQS_API_VERSION.to_string());

        let path = self.endpoint.path().to_string();
        let headers = self.signer.sign_request(
            "POST",
            &self.host(),
            &path,
            &query,
            "",
            &Utc::now(),
        );

        let mut url = self.endpoint.clone();
        url.set_query(Some(&encode_query(&query)));

        let mut request = self.http_client.post(url);
        for (key, value) in headers {
            request = request.header(key, value);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AwsError::NetworkError(format!("Request timeout: {}", e))
            } else if e.is_connect() {
                AwsError::NetworkError(format!("Connection failed: {}", e))
            } else {
                AwsError::NetworkError(format!("HTTP request failed: {}", e))
            }
        })?;

        let status = response.status();
        let response_body = response
            .text()
            .await
            .map_err(|e| AwsError::NetworkError(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(parse_error_response(&response_body, status.as_u16()));
        }

        debug!(action, status = status.as_u16(), "SQS request completed");
        Ok(response_body)
    }

    /// Resolve a queue name to its URL
    pub async fn get_queue_url(&self, queue_name: &str) -> Result<String, AwsError> {
        let xml = self
            .call(
                "GetQueueUrl",
                [("QueueName".to_string(), queue_name.to_string())],
            )
            .await?;
        first_element_text(&xml, b"QueueUrl")?
            .ok_or_else(|| AwsError::SerializationError("QueueUrl not found in response".into()))
    }

    /// Create a queue (or confirm an identical one) and return its URL
    pub async fn create_queue(
        &self,
        queue_name: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<String, AwsError> {
        let mut params = vec![("QueueName".to_string(), queue_name.to_string())];
        for (idx, (name, value)) in attributes.iter().enumerate() {
            params.push((format!("Attribute.{}.Name", idx + 1), name.clone()));
            params.push((format!("Attribute.{}.Value", idx + 1), value.clone()));
        }

        let xml = self.call("CreateQueue", params).await?;
        first_element_text(&xml, b"QueueUrl")?
            .ok_or_else(|| AwsError::SerializationError("QueueUrl not found in response".into()))
    }

    /// Read selected queue attributes
    pub async fn get_queue_attributes(
        &self,
        queue_url: &str,
        names: &[&str],
    ) -> Result<HashMap<String, String>, AwsError> {
        let mut params = vec![("QueueUrl".to_string(), queue_url.to_string())];
        for (idx, name) in names.iter().enumerate() {
            params.push((format!("AttributeName.{}", idx + 1), (*name).to_string()));
        }

        let xml = self.call("GetQueueAttributes", params).await?;
        parse_attributes(&xml)
    }

    /// Overwrite queue attributes on an existing queue
    pub async fn set_queue_attributes(
        &self,
        queue_url: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<(), AwsError> {
        let mut params = vec![("QueueUrl".to_string(), queue_url.to_string())];
        for (idx, (name, value)) in attributes.iter().enumerate() {
            params.push((format!("Attribute.{}.Name", idx + 1), name.clone()));
            params.push((format!("Attribute.{}.Value", idx + 1), value.clone()));
        }

        self.call("SetQueueAttributes", params).await?;
        Ok(())
    }

    pub async fn delete_queue(&self, queue_url: &str) -> Result<(), AwsError> {
        self.call(
            "DeleteQueue",
            [("QueueUrl".to_string(), queue_url.to_string())],
        )
        .await?;
        Ok(())
    }

    /// Send one message and return its SQS message id
    pub async fn send_message(&self, queue_url: &str, body: &[u8]) -> Result<String, AwsError> {
        let encoded = STANDARD.encode(body);
        if encoded.len() > MAX_MESSAGE_SIZE {
            return Err(AwsError::MessageTooLarge {
                size: encoded.len(),
                max_size: MAX_MESSAGE_SIZE,
            });
        }

        let xml = self
            .call(
                "SendMessage",
                [
                    ("QueueUrl".to_string(), queue_url.to_string()),
                    ("MessageBody".to_string(), encoded),
                ],
            )
            .await?;
        first_element_text(&xml, b"MessageId")?
            .ok_or_else(|| AwsError::SerializationError("MessageId not found in response".into()))
    }

    /// Long-poll for up to `max_messages` messages
    pub async fn receive_messages(
        &self,
        queue_url: &str,
        max_messages: u32,
        wait_time_seconds: u32,
    ) -> Result<Vec<SqsMessage>, AwsError> {
        let xml = self
            .call(
                "ReceiveMessage",
                [
                    ("QueueUrl".to_string(), queue_url.to_string()),
                    (
                        "MaxNumberOfMessages".to_string(),
                        max_messages.clamp(1, 10).to_string(),
                    ),
                    (
                        "WaitTimeSeconds".to_string(),
                        wait_time_seconds.min(MAX_WAIT_TIME_SECONDS).to_string(),
                    ),
                    (
                        "AttributeName.1".to_string(),
                        "ApproximateReceiveCount".to_string(),
                    ),
                ],
            )
            .await?;
        parse_receive_message_response(&xml)
    }

    pub async fn delete_message(
        &self,
        queue_url: &str,
        receipt_handle: &str,
    ) -> Result<(), AwsError> {
        self.call(
            "DeleteMessage",
            [
                ("QueueUrl".to_string(), queue_url.to_string()),
                ("ReceiptHandle".to_string(), receipt_handle.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn change_message_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        visibility_timeout: u32,
    ) -> Result<(), AwsError> {
        self.call(
            "ChangeMessageVisibility",
            [
                ("QueueUrl".to_string(), queue_url.to_string()),
                ("ReceiptHandle".to_string(), receipt_handle.to_string()),
                (
                    "VisibilityTimeout".to_string(),
                    visibility_timeout.to_string(),
                ),
            ],
        )
        .await?;
        Ok(())
    }
}

impl fmt::Debug for SqsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqsClient")
            .field("endpoint", &self.endpoint.as_str())
            .field("region", &self.signer.region)
            .finish()
    }
}

// ============================================================================
// XML Parsing
// ============================================================================

/// Text of the first element with the given tag
fn first_element_text(xml: &str, tag: &[u8]) -> Result<Option<String>, AwsError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut inside = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) if e.name().as_ref() == tag => inside = true,
            Ok(Event::Text(e)) if inside => {
                return e.unescape().map(|s| Some(s.into_owned())).map_err(|e| {
                    AwsError::SerializationError(format!("Failed to parse XML: {}", e))
                });
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == tag => return Ok(None),
            Ok(Event::Eof) => return Ok(None),
            Err(e) => {
                return Err(AwsError::SerializationError(format!(
                    "XML parsing error: {}",
                    e
                )))
            }
            _ => {}
        }
        buf.clear();
    }
}

/// Parse `<Attribute><Name/><Value/></Attribute>` pairs
fn parse_attributes(xml: &str) -> Result<HashMap<String, String>, AwsError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut attributes = HashMap::new();
    let mut in_name = false;
    let mut in_value = false;
    let mut current_name: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"Name" => in_name = true,
                b"Value" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(e)) => {
                let text = e
                    .unescape()
                    .map_err(|e| AwsError::SerializationError(format!("Failed to parse XML: {}", e)))?
                    .into_owned();
                if in_name {
                    current_name = Some(text);
                    in_name = false;
                } else if in_value {
                    if let Some(name) = current_name.take() {
                        attributes.insert(name, text);
                    }
                    in_value = false;
                }
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == b"Attribute" => {
                current_name = None;
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(AwsError::SerializationError(format!(
                    "XML parsing error: {}",
                    e
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(attributes)
}

/// Message bodies written by this adapter are base64. Bodies sent by other
/// producers are passed through untouched when they do not decode.
fn decode_body(message_id: &str, raw_body: String) -> Vec<u8> {
    match STANDARD.decode(raw_body.as_bytes()) {
        Ok(body) => body,
        Err(e) => {
            debug!(
                message_id = %message_id,
                error = %e,
                "Message body is not base64, delivering raw bytes"
            );
            raw_body.into_bytes()
        }
    }
}

/// Parse ReceiveMessage XML response
fn parse_receive_message_response(xml: &str) -> Result<Vec<SqsMessage>, AwsError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut messages = Vec::new();
    let mut in_message = false;
    let mut current_message_id: Option<String> = None;
    let mut current_receipt_handle: Option<String> = None;
    let mut current_body: Option<String> = None;
    let mut current_receive_count: Option<u32> = None;

    let mut in_message_id = false;
    let mut in_receipt_handle = false;
    let mut in_body = false;
    let mut in_attribute_name = false;
    let mut in_attribute_value = false;
    let mut current_attribute_name: Option<String> = None;

    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"Message" => {
                    in_message = true;
                    current_message_id = None;
                    current_receipt_handle = None;
                    current_body = None;
                    current_receive_count = None;
                }
                b"MessageId" if in_message => in_message_id = true,
                b"ReceiptHandle" if in_message => in_receipt_handle = true,
                b"Body" if in_message => in_body = true,
                b"Name" if in_message => in_attribute_name = true,
                b"Value" if in_message => in_attribute_value = true,
                _ => {}
            },
            Ok(Event::Text(e)) => {
                let text = e.unescape().ok().map(|s| s.into_owned());
                if in_message_id {
                    current_message_id = text;
                    in_message_id = false;
                } else if in_receipt_handle {
                    current_receipt_handle = text;
                    in_receipt_handle = false;
                } else if in_body {
                    current_body = text;
                    in_body = false;
                } else if in_attribute_name {
                    current_attribute_name = text;
                    in_attribute_name = false;
                } else if in_attribute_value {
                    if current_attribute_name.as_deref() == Some("ApproximateReceiveCount") {
                        current_receive_count = text.and_then(|count| count.parse().ok());
                    }
                    in_attribute_value = false;
                    current_attribute_name = None;
                }
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == b"Message" => {
                in_message = false;

                if let (Some(raw_body), Some(receipt_handle)) =
                    (current_body.take(), current_receipt_handle.take())
                {
                    let message_id = current_message_id.take().unwrap_or_default();
                    let body = decode_body(&message_id, raw_body);

                    messages.push(SqsMessage {
                        message_id,
                        receipt_handle,
                        body,
                        receive_count: current_receive_count,
                    });
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(AwsError::SerializationError(format!(
                    "XML parsing error: {}",
                    e
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(messages)
}

/// Parse error response from XML
fn parse_error_response(xml: &str, status_code: u16) -> AwsError {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut error_code = None;
    let mut error_message = None;
    let mut in_error = false;
    let mut in_code = false;
    let mut in_message = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"Error" => in_error = true,
                b"Code" if in_error => in_code = true,
                b"Message" if in_error => in_message = true,
                _ => {}
            },
            Ok(Event::Text(e)) => {
                if in_code {
                    error_code = e.unescape().ok().map(|s| s.into_owned());
                    in_code = false;
                } else if in_message {
                    error_message = e.unescape().ok().map(|s| s.into_owned());
                    in_message = false;
                }
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == b"Error" => {
                in_error = false;
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    let code = error_code.unwrap_or_else(|| "Unknown".to_string());
    let message = error_message.unwrap_or_else(|| "Unknown error".to_string());

    match code.as_str() {
        "AWS.SimpleQueueService.NonExistentQueue" | "QueueDoesNotExist" => {
            AwsError::QueueNotFound(message)
        }
        "InvalidClientTokenId" | "UnrecognizedClientException" | "SignatureDoesNotMatch" => {
            AwsError::Authentication(format!("{}: {}", code, message))
        }
        "InvalidReceiptHandle" | "ReceiptHandleIsInvalid" => AwsError::InvalidReceipt(message),
        _ if status_code == 401 || status_code == 403 => {
            AwsError::Authentication(format!("{}: {}", code, message))
        }
        _ => AwsError::ServiceError { code, message },
    }
}

// ============================================================================
// Queue Adapter
// ============================================================================

struct SqsHandle {
    client: SqsClient,
    queue_url: String,
}

/// [`Queue`] over a single SQS queue
pub struct AwsSqsQueue {
    config: AwsSqsConfig,
    handle: OnceInit<Arc<SqsHandle>>,
}

impl AwsSqsQueue {
    pub fn new(config: AwsSqsConfig) -> Self {
        Self {
            config,
            handle: OnceInit::new(),
        }
    }

    async fn open(&self) -> Result<&Arc<SqsHandle>, QueueError> {
        self.handle
            .get_or_init(|| async {
                let client = SqsClient::new(&self.config)?;
                let queue_url = client.get_queue_url(&self.config.queue).await?;
                debug!(queue = %self.config.queue, queue_url = %queue_url, "Resolved SQS queue");
                Ok(Arc::new(SqsHandle { client, queue_url }))
            })
            .await
    }
}

#[async_trait]
impl Queue for AwsSqsQueue {
    async fn init(&self) -> Result<Cleanup, QueueError> {
        self.open().await?;
        Ok(Cleanup::noop())
    }

    async fn publish(&self, message: &dyn IncomingMessage) -> Result<(), QueueError> {
        let handle = self.handle.get().ok_or_else(|| QueueError::NotInitialized {
            queue_name: self.config.queue.clone(),
        })?;
        let message = message.to_message()?;
        let message_id = handle
            .client
            .send_message(&handle.queue_url, &message.body)
            .await?;
        debug!(queue = %self.config.queue, message_id = %message_id, "Published SQS message");
        Ok(())
    }

    async fn subscribe(&self) -> Result<Box<dyn Subscription>, QueueError> {
        let handle = self.open().await?;
        Ok(Box::new(AwsSqsSubscription {
            handle: Arc::clone(handle),
            closed: CancellationToken::new(),
        }))
    }
}

/// Long-polling receive handle on an SQS queue
pub struct AwsSqsSubscription {
    handle: Arc<SqsHandle>,
    closed: CancellationToken,
}

#[async_trait]
impl Subscription for AwsSqsSubscription {
    async fn receive(&self) -> Result<Message, QueueError> {
        loop {
            let batch = tokio::select! {
                biased;
                _ = self.closed.cancelled() => return Err(QueueError::SubscriptionClosed),
                batch = self.handle.client.receive_messages(
                    &self.handle.queue_url,
                    1,
                    MAX_WAIT_TIME_SECONDS,
                ) => batch?,
            };

            if let Some(received) = batch.into_iter().next() {
                let acknowledger = SqsAcknowledger {
                    handle: Arc::clone(&self.handle),
                    receipt_handle: received.receipt_handle,
                };
                let mut message =
                    Message::received(received.body, received.message_id, Box::new(acknowledger));
                if let Some(count) = received.receive_count {
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

struct SqsAcknowledger {
    handle: Arc<SqsHandle>,
    receipt_handle: String,
}

#[async_trait]
impl Acknowledger for SqsAcknowledger {
    async fn ack(&self) -> Result<(), QueueError> {
        self.handle
            .client
            .delete_message(&self.handle.queue_url, &self.receipt_handle)
            .await?;
        Ok(())
    }

    async fn nack(&self) -> Result<(), QueueError> {
        self.handle
            .client
            .change_message_visibility(&self.handle.queue_url, &self.receipt_handle, 0)
            .await?;
        Ok(())
    }
}
