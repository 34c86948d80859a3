//! Message types for EmberQ
//!
//! Defines the core Message struct and related types.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-queue message identifier, assigned at enqueue time
///
/// Ids increase monotonically within one queue, so ordering by id is the
/// queue's FIFO order. Ids are not comparable across queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl MessageId {
    /// Id carried by a message that has not been enqueued yet
    pub const UNASSIGNED: MessageId = MessageId(0);

    /// Raw numeric value
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delivery state of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageState {
    /// Waiting in the queue for a consumer
    #[default]
    Pending,
    /// Handed to a consumer, awaiting acknowledgement
    Delivered,
    /// Consumed; no longer owned by the queue
    Acknowledged,
}

/// Scalar message property value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for PropertyValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// A message in a queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Queue-assigned identifier (`UNASSIGNED` until sent)
    #[serde(default)]
    pub id: MessageId,

    /// Message body (raw bytes, base64 on the wire)
    #[serde(with = "bytes_serde")]
    pub body: Bytes,

    /// Custom properties
    #[serde(default)]
    pub properties: HashMap<String, PropertyValue>,

    /// Current delivery state
    #[serde(default)]
    pub state: MessageState,

    /// Number of times the message has been handed to a consumer
    #[serde(default)]
    pub delivery_count: u32,

    /// When the message was created
    pub timestamp: DateTime<Utc>,

    /// When the message expires (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Create a new message with the given body
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            id: MessageId::UNASSIGNED,
            body: body.into(),
            properties: HashMap::new(),
            state: MessageState::Pending,
            delivery_count: 0,
            timestamp: Utc::now(),
            expires_at: None,
        }
    }

    /// Create a text message
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Bytes::from(text.into()))
    }

    /// Add a property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Expire the message `ttl` after its timestamp
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| self.timestamp.checked_add_signed(ttl));
        self
    }

    /// Set expiration time
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Check if the message has expired
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .map(|exp| Utc::now() > exp)
            .unwrap_or(false)
    }

    /// True when the message has been delivered before
    pub fn redelivered(&self) -> bool {
        self.delivery_count > 1
    }

    /// Get the body as a string (if valid UTF-8)
    pub fn body_as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Get a property value
    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }
}

/// Base64 serialization for message bodies
pub(crate) mod bytes_serde {
    use base64::Engine;
    use bytes::Bytes;
    use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        base64::engine::general_purpose::STANDARD
            .encode(bytes)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map(Bytes::from)
            .map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_creation() {
        let msg = Message::text("Hello, World!");
        assert_eq!(msg.body_as_str(), Some("Hello, World!"));
        assert_eq!(msg.id, MessageId::UNASSIGNED);
        assert_eq!(msg.state, MessageState::Pending);
        assert!(!msg.redelivered());
    }

    #[test]
    fn test_message_properties() {
        let msg = Message::text("test")
            .with_property("priority", 8)
            .with_property("source", "sensor-1")
            .with_property("urgent", true);

        assert_eq!(msg.property("priority"), Some(&PropertyValue::Int(8)));
        assert_eq!(
            msg.property("source"),
            Some(&PropertyValue::Text("sensor-1".to_string()))
        );
        assert_eq!(msg.property("urgent"), Some(&PropertyValue::Bool(true)));
        assert_eq!(msg.property("missing"), None);
    }

    #[test]
    fn test_expiry() {
        let msg = Message::text("old").with_expiry(Utc::now() - chrono::Duration::seconds(1));
        assert!(msg.is_expired());

        let msg = Message::text("fresh").with_ttl(Duration::from_secs(60));
        assert!(msg.expires_at.is_some());
        assert!(!msg.is_expired());
    }

    #[test]
    fn test_binary_body_survives_json() {
        let msg = Message::new(vec![0u8, 159, 146, 150, 255]).with_property("ratio", 0.5);
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: Message = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.body, msg.body);
        assert_eq!(parsed.property("ratio"), Some(&PropertyValue::Float(0.5)));
    }
}
