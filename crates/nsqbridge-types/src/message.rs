//! Message types for NsqBridge
//!
//! Identity and payload types shared by the broker seam and the engine.

use bytes::Bytes;
use serde::{Deserialize, Serialize, Serializer};
use utoipa::ToSchema;
use uuid::Uuid;

/// Broker-assigned message identifier
///
/// NSQ ids are 16 ASCII characters; any string is accepted here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct MessageId(pub String);

impl MessageId {
    /// Create a new random 16-character MessageId
    pub fn new() -> Self {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(16);
        Self(id)
    }

    /// Borrow the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Decoded message data handed to a handler
///
/// Bodies that are not valid JSON are passed through untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Body parsed as JSON
    Json(serde_json::Value),
    /// Body that failed to parse
    Raw(Bytes),
}

impl Payload {
    /// The JSON value, if the body parsed
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Raw(_) => None,
        }
    }

    /// Look up a top-level field of a JSON object payload
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.as_json().and_then(|value| value.get(key))
    }

    /// The raw body, if the body did not parse
    pub fn as_raw(&self) -> Option<&Bytes> {
        match self {
            Self::Json(_) => None,
            Self::Raw(bytes) => Some(bytes),
        }
    }
}

impl Serialize for Payload {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Json(value) => value.serialize(serializer),
            // Raw bodies go out as a string if they are UTF-8, otherwise base64
            Self::Raw(bytes) => match std::str::from_utf8(bytes) {
                Ok(s) => s.serialize(serializer),
                Err(_) => {
                    use base64::Engine;
                    base64::engine::general_purpose::STANDARD
                        .encode(bytes)
                        .serialize(serializer)
                }
            },
        }
    }
}

/// Snapshot handed to a binding's discard callback once the broker gives up
#[derive(Debug, Clone)]
pub struct DiscardedMessage {
    /// Message identifier
    pub id: MessageId,
    /// Topic the message was published to
    pub topic: String,
    /// Channel that exhausted its attempts
    pub channel: String,
    /// Delivery attempts so far
    pub attempts: u16,
    /// Raw message body
    pub body: Bytes,
}

impl DiscardedMessage {
    /// Get the body as a string (if valid UTF-8)
    pub fn body_as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}
