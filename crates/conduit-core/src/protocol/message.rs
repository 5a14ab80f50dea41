//! The message entity and its JSON encoding.
//!
//! A frame body is a UTF-8 JSON object:
//!
//! ```text
//! {"channel":"render","type":"request","messageId":"msg_…","payload":"68656c6c6f","timestamp":1700000000000}
//! ```
//!
//! The payload is hex encoded so arbitrary bytes survive the JSON envelope.

use crate::connection::PeerId;
use crate::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Channel name used for responses sent with `send_response`.
pub const RESPONSE_CHANNEL: &str = "response";

/// The three message kinds carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Fire-and-forget.
    Notification,
    /// Expects a `Response` carrying the same id.
    Request,
    /// Answer to a `Request`.
    Response,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Notification => write!(f, "notification"),
            MessageKind::Request => write!(f, "request"),
            MessageKind::Response => write!(f, "response"),
        }
    }
}

/// A message routed over the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub channel: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(rename = "messageId")]
    pub id: String,
    #[serde(with = "hex_payload")]
    pub payload: Bytes,
    /// Milliseconds since the Unix epoch at creation.
    pub timestamp: u64,
    /// Connection the message arrived on. Set by the reader, never sent.
    #[serde(skip)]
    pub origin: Option<PeerId>,
}

impl Message {
    /// Create a message with a fresh id and the current timestamp.
    pub fn new(kind: MessageKind, channel: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            kind,
            id: generate_message_id(),
            payload: payload.into(),
            timestamp: now_millis(),
            origin: None,
        }
    }

    pub fn notification(channel: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Notification, channel, payload)
    }

    pub fn request(channel: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Request, channel, payload)
    }

    /// Response to the request identified by `request_id`.
    pub fn response(request_id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: request_id.into(),
            ..Self::new(MessageKind::Response, RESPONSE_CHANNEL, payload)
        }
    }

    /// Serialize into a frame body.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a frame body.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Payload interpreted as UTF-8, replacing invalid sequences.
    pub fn payload_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Random message id, e.g. `msg_3f2a…`.
pub fn generate_message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().simple())
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

mod hex_payload {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
