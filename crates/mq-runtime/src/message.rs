//! Message envelope and the serialization contract for domain payloads.
//!
//! A [`Message`] is wire-neutral: an opaque body plus, for received messages,
//! the backend-specific capability to acknowledge or reject it. Domain types
//! cross the transport boundary only through [`IncomingMessage`].

use crate::error::{QueueError, SerializationError};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

// ============================================================================
// Acknowledgement
// ============================================================================

/// Backend-side settlement of a received message.
///
/// Each backend adapter provides an implementation bound to the delivery it
/// came from (receipt handle, lock token, delivery tag).
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Remove the message from the backend's in-flight set.
    async fn ack(&self) -> Result<(), QueueError>;

    /// Return the message for redelivery, or dead-lettering once the
    /// backend's delivery limit is exhausted.
    async fn nack(&self) -> Result<(), QueueError>;
}

// ============================================================================
// Message
// ============================================================================

/// A message body together with its settlement capability.
///
/// `ack` and `nack` take `self` by value so a received message is settled at
/// most once. A received message that is dropped without being settled stays
/// in flight until the backend's visibility timeout or lock expires, after
/// which it is redelivered.
pub struct Message {
    pub body: Bytes,
    id: Option<String>,
    delivery_count: Option<u32>,
    acknowledger: Option<Box<dyn Acknowledger>>,
}

impl Message {
    /// Create an outgoing message with the given body
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            id: None,
            delivery_count: None,
            acknowledger: None,
        }
    }

    /// Create a received message bound to a backend acknowledger
    pub fn received(
        body: impl Into<Bytes>,
        id: impl Into<String>,
        acknowledger: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            body: body.into(),
            id: Some(id.into()),
            delivery_count: None,
            acknowledger: Some(acknowledger),
        }
    }

    /// Attach the backend-reported delivery count
    pub fn with_delivery_count(mut self, count: u32) -> Self {
        self.delivery_count = Some(count);
        self
    }

    /// Backend-provided identifier suitable for log correlation
    pub fn loggable_id(&self) -> &str {
        self.id.as_deref().unwrap_or("<unsent>")
    }

    /// Number of times the backend has delivered this message, when known
    pub fn delivery_count(&self) -> Option<u32> {
        self.delivery_count
    }

    /// Whether this message came from a subscription
    pub fn is_received(&self) -> bool {
        self.acknowledger.is_some()
    }

    /// Acknowledge successful processing.
    ///
    /// Outgoing messages have nothing to settle and return `Ok`.
    pub async fn ack(self) -> Result<(), QueueError> {
        match self.acknowledger {
            Some(acknowledger) => acknowledger.ack().await,
            None => Ok(()),
        }
    }

    /// Signal failed processing so the backend redelivers the message.
    pub async fn nack(self) -> Result<(), QueueError> {
        match self.acknowledger {
            Some(acknowledger) => acknowledger.nack().await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("body_len", &self.body.len())
            .field("delivery_count", &self.delivery_count)
            .field("received", &self.is_received())
            .finish()
    }
}

// ============================================================================
// Domain Payload Contract
// ============================================================================

/// Conversion between a domain payload and a transport [`Message`].
///
/// Implementations must be symmetric: decoding the message produced by
/// `to_message` reproduces the payload's observable fields. Malformed bodies
/// surface as a [`SerializationError`].
pub trait IncomingMessage: Send + Sync {
    /// Serialize the payload into a message body
    fn to_message(&self) -> Result<Message, SerializationError>;

    /// Reconstruct the payload from a received message
    fn from_message(message: &Message) -> Result<Self, SerializationError>
    where
        Self: Sized;
}

/// JSON encoding for any serde payload
///
/// ```
/// use mq_runtime::{IncomingMessage, Json};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Event {
///     #[serde(rename = "ID")]
///     id: String,
/// }
///
/// let message = Json(Event { id: "abc".into() }).to_message().unwrap();
/// let Json(event) = Json::<Event>::from_message(&message).unwrap();
/// assert_eq!(event.id, "abc");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Json<T>(pub T);

impl<T> Json<T> {
    /// Unwrap the payload
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> IncomingMessage for Json<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn to_message(&self) -> Result<Message, SerializationError> {
        let body = serde_json::to_vec(&self.0)?;
        Ok(Message::new(body))
    }

    fn from_message(message: &Message) -> Result<Self, SerializationError> {
        let payload = serde_json::from_slice(&message.body)?;
        Ok(Self(payload))
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
