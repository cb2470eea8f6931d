use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::{OrderId, ProductId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{MessageId, MessagingError, Result};

/// Content type of every envelope published by this crate.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// The closed set of event types carried on the events exchange.
///
/// The wire name doubles as the routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "order.created")]
    OrderCreated,
    #[serde(rename = "payment.succeeded")]
    PaymentSucceeded,
    #[serde(rename = "payment.failed")]
    PaymentFailed,
}

impl EventType {
    /// Returns the wire name of the event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::OrderCreated => "order.created",
            EventType::PaymentSucceeded => "payment.succeeded",
            EventType::PaymentFailed => "payment.failed",
        }
    }

    /// Returns the routing key events of this type are published under.
    pub fn routing_key(&self) -> &'static str {
        self.as_str()
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = MessagingError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "order.created" => Ok(EventType::OrderCreated),
            "payment.succeeded" => Ok(EventType::PaymentSucceeded),
            "payment.failed" => Ok(EventType::PaymentFailed),
            other => Err(MessagingError::MalformedMessage(format!(
                "unknown event type '{other}'"
            ))),
        }
    }
}

/// Business fields of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub order_id: OrderId,
    pub user_id: UserId,
    pub product_id: ProductId,
    pub quantity: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Additional fields outside the fixed schema.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl EventPayload {
    /// Creates a payload with no status, reason or extensions.
    pub fn new(
        event_type: EventType,
        order_id: OrderId,
        user_id: UserId,
        product_id: ProductId,
        quantity: i32,
    ) -> Self {
        Self {
            event_type,
            order_id,
            user_id,
            product_id,
            quantity,
            status: None,
            reason: None,
            extensions: Map::new(),
        }
    }

    /// Sets the status carried by the event.
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Sets the reason carried by the event.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Adds an extension field.
    pub fn with_extension(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extensions.insert(key.into(), value);
        self
    }
}

/// The self-describing JSON document published as a message body.
///
/// The message identifier travels both here and in the AMQP `message-id`
/// property, and is what consumers deduplicate on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub message_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<MessageId>,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl EventEnvelope {
    /// Creates a new envelope builder around a payload.
    pub fn builder(payload: EventPayload) -> EventEnvelopeBuilder {
        EventEnvelopeBuilder {
            payload,
            message_id: None,
            correlation_id: None,
            created_at: None,
        }
    }

    /// Returns the correlation identifier, defaulting to the message identifier.
    pub fn correlation_id(&self) -> &MessageId {
        self.correlation_id.as_ref().unwrap_or(&self.message_id)
    }

    /// Returns the event type.
    pub fn event_type(&self) -> EventType {
        self.payload.event_type
    }

    /// Returns the routing key for this envelope.
    pub fn routing_key(&self) -> &'static str {
        self.payload.event_type.routing_key()
    }

    /// Checks that every field a consumer relies on is present and sane.
    pub fn validate(&self) -> Result<()> {
        if self.message_id.is_empty() {
            return Err(MessagingError::MalformedMessage(
                "messageId is required".into(),
            ));
        }
        if !self.payload.order_id.is_valid() {
            return Err(MessagingError::MalformedMessage(format!(
                "invalid orderId {}",
                self.payload.order_id
            )));
        }
        if !self.payload.user_id.is_valid() {
            return Err(MessagingError::MalformedMessage(format!(
                "invalid userId {}",
                self.payload.user_id
            )));
        }
        if !self.payload.product_id.is_valid() {
            return Err(MessagingError::MalformedMessage(format!(
                "invalid productId {}",
                self.payload.product_id
            )));
        }
        if self.payload.quantity <= 0 {
            return Err(MessagingError::MalformedMessage(format!(
                "invalid quantity {}",
                self.payload.quantity
            )));
        }
        Ok(())
    }

    /// Serializes the envelope into a message body.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses a message body. Does not validate business fields.
    pub fn decode(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).map_err(|e| MessagingError::MalformedMessage(e.to_string()))
    }
}

/// Builder for [`EventEnvelope`].
#[derive(Debug)]
pub struct EventEnvelopeBuilder {
    payload: EventPayload,
    message_id: Option<MessageId>,
    correlation_id: Option<MessageId>,
    created_at: Option<DateTime<Utc>>,
}

impl EventEnvelopeBuilder {
    /// Sets the message ID. If not set, a new ID will be generated.
    pub fn message_id(mut self, id: MessageId) -> Self {
        self.message_id = Some(id);
        self
    }

    /// Sets the correlation ID. If not set, the message ID is used.
    pub fn correlation_id(mut self, id: MessageId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Sets the creation time. If not set, the current time is used.
    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Builds the envelope.
    pub fn build(self) -> EventEnvelope {
        let message_id = self.message_id.unwrap_or_default();
        let correlation_id = self.correlation_id.unwrap_or_else(|| message_id.clone());
        EventEnvelope {
            message_id,
            correlation_id: Some(correlation_id),
            created_at: self.created_at.unwrap_or_else(Utc::now),
            payload: self.payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn order_created() -> EventPayload {
        EventPayload::new(
            EventType::OrderCreated,
            OrderId::new(7),
            UserId::new(3),
            ProductId::new(42),
            2,
        )
    }

    #[test]
    fn builder_defaults_correlation_to_message_id() {
        let envelope = EventEnvelope::builder(order_created()).build();
        assert!(!envelope.message_id.is_empty());
        assert_eq!(envelope.correlation_id(), &envelope.message_id);
    }

    #[test]
    fn builder_keeps_supplied_identity() {
        let envelope = EventEnvelope::builder(order_created())
            .message_id(MessageId::from("m-1"))
            .correlation_id(MessageId::from("c-1"))
            .build();
        assert_eq!(envelope.message_id.as_str(), "m-1");
        assert_eq!(envelope.correlation_id().as_str(), "c-1");
    }

    #[test]
    fn serializes_with_camel_case_wire_names() {
        let envelope = EventEnvelope::builder(order_created().with_status("PENDING"))
            .message_id(MessageId::from("m-1"))
            .build();
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["messageId"], "m-1");
        assert_eq!(value["correlationId"], "m-1");
        assert_eq!(value["type"], "order.created");
        assert_eq!(value["orderId"], 7);
        assert_eq!(value["userId"], 3);
        assert_eq!(value["productId"], 42);
        assert_eq!(value["quantity"], 2);
        assert_eq!(value["status"], "PENDING");
        assert!(value.get("reason").is_none());
        assert!(value.get("extensions").is_none());
        assert!(value["createdAt"].is_string());
    }

    #[test]
    fn decode_tolerates_missing_correlation() {
        let body = json!({
            "messageId": "m-9",
            "createdAt": "2024-01-01T00:00:00Z",
            "type": "payment.failed",
            "orderId": 1,
            "userId": 2,
            "productId": 3,
            "quantity": 1,
            "reason": "MANUAL_REJECTION"
        });
        let envelope = EventEnvelope::decode(body.to_string().as_bytes()).unwrap();
        assert_eq!(envelope.event_type(), EventType::PaymentFailed);
        assert_eq!(envelope.correlation_id().as_str(), "m-9");
        assert_eq!(envelope.payload.reason.as_deref(), Some("MANUAL_REJECTION"));
        assert!(envelope.validate().is_ok());
    }

    #[test]
    fn decode_rejects_garbage_and_unknown_types() {
        assert!(matches!(
            EventEnvelope::decode(b"not json"),
            Err(MessagingError::MalformedMessage(_))
        ));
        let body = json!({
            "messageId": "m-9",
            "createdAt": "2024-01-01T00:00:00Z",
            "type": "order.shipped",
            "orderId": 1,
            "userId": 2,
            "productId": 3,
            "quantity": 1
        });
        assert!(EventEnvelope::decode(body.to_string().as_bytes()).is_err());
    }

    #[test]
    fn validate_flags_missing_business_fields() {
        let mut envelope = EventEnvelope::builder(order_created()).build();
        envelope.payload.quantity = 0;
        assert!(envelope.validate().is_err());

        let mut envelope = EventEnvelope::builder(order_created()).build();
        envelope.payload.user_id = UserId::new(0);
        assert!(envelope.validate().is_err());

        let envelope = EventEnvelope::builder(order_created())
            .message_id(MessageId::from(""))
            .build();
        assert!(envelope.validate().is_err());
    }

    #[test]
    fn event_type_round_trips_through_str() {
        for event_type in [
            EventType::OrderCreated,
            EventType::PaymentSucceeded,
            EventType::PaymentFailed,
        ] {
            assert_eq!(event_type.as_str().parse::<EventType>().unwrap(), event_type);
        }
    }
}
