//! Tests for message types.

use super::*;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TestEvent {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Data")]
    data: HashMap<String, String>,
}

#[derive(Default)]
struct CountingAcknowledger {
    acks: Arc<AtomicUsize>,
    nacks: Arc<AtomicUsize>,
}

#[async_trait]
impl Acknowledger for CountingAcknowledger {
    async fn ack(&self) -> Result<(), QueueError> {
        self.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nack(&self) -> Result<(), QueueError> {
        self.nacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

mod json_tests {
    use super::*;

    /// Verify a JSON payload survives conversion to a message and back
    #[test]
    fn test_json_payload_round_trip() {
        let mut data = HashMap::new();
        data.insert("mykey".to_string(), "myvalue".to_string());
        let event = TestEvent {
            id: "abc".to_string(),
            data,
        };

        let message = Json(event.clone()).to_message().unwrap();
        let decoded = Json::<TestEvent>::from_message(&message).unwrap();

        assert_eq!(decoded.into_inner(), event);
    }

    /// Verify the wire body uses the payload's serde field names
    #[test]
    fn test_json_body_shape() {
        let event = TestEvent {
            id: "abc".to_string(),
            data: HashMap::new(),
        };

        let message = Json(event).to_message().unwrap();

        assert_eq!(&message.body[..], br#"{"ID":"abc","Data":{}}"#);
    }

    /// Verify malformed bodies surface as a typed decode error
    #[test]
    fn test_malformed_body_is_decode_error() {
        let message = Message::new("not json at all");

        let result = Json::<TestEvent>::from_message(&message);

        assert!(matches!(result, Err(SerializationError::JsonError(_))));
    }
}

mod settlement_tests {
    use super::*;

    /// Verify settling an outgoing message is a no-op
    #[tokio::test]
    async fn test_outgoing_message_settlement_is_noop() {
        let message = Message::new("body");
        assert!(!message.is_received());
        assert_eq!(message.loggable_id(), "<unsent>");

        assert!(message.ack().await.is_ok());
        assert!(Message::new("body").nack().await.is_ok());
    }

    /// Verify ack and nack reach the backend acknowledger
    #[tokio::test]
    async fn test_received_message_settlement() {
        // Arrange
        let acknowledger = CountingAcknowledger::default();
        let acks = acknowledger.acks.clone();
        let nacks = acknowledger.nacks.clone();
        let message = Message::received("body", "msg-1", Box::new(acknowledger));

        // Act
        assert_eq!(message.loggable_id(), "msg-1");
        message.ack().await.unwrap();

        // Assert
        assert_eq!(acks.load(Ordering::SeqCst), 1);
        assert_eq!(nacks.load(Ordering::SeqCst), 0);
    }

    /// Verify delivery count is carried and reported
    #[test]
    fn test_delivery_count() {
        let message = Message::received("body", "msg-2", Box::new(CountingAcknowledger::default()))
            .with_delivery_count(3);

        assert_eq!(message.delivery_count(), Some(3));
        assert!(format!("{:?}", message).contains("msg-2"));
    }
}
