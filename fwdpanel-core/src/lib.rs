pub mod backoff;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub use backoff::BackoffPolicy;

/// Subscriptions under this type receive every inbound message.
pub const WILDCARD: &str = "*";

pub const TYPE_PING: &str = "ping";
pub const TYPE_PONG: &str = "pong";
pub const TYPE_LOG: &str = "new_log";
pub const TYPE_LOG_SHORT: &str = "log";
pub const TYPE_STATUS: &str = "status";
pub const TYPE_NOTIFICATION: &str = "notification";

// Lifecycle notifications raised by the client itself, never read off the wire.
pub const EVENT_CONNECTED: &str = "connected";
pub const EVENT_DISCONNECTED: &str = "disconnected";
pub const EVENT_RECONNECTING: &str = "reconnecting";
pub const EVENT_RECONNECT_FAILED: &str = "reconnect_failed";
pub const EVENT_ERROR: &str = "error";
pub const EVENT_PARSE_ERROR: &str = "parse_error";

/// Upper bound on a single inbound text frame.
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Ping,
    Pong,
    Log,
    Status,
    Notification,
    Unknown,
}

impl EventKind {
    #[must_use]
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            TYPE_PING => Self::Ping,
            TYPE_PONG => Self::Pong,
            TYPE_LOG | TYPE_LOG_SHORT => Self::Log,
            TYPE_STATUS => Self::Status,
            TYPE_NOTIFICATION => Self::Notification,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub const fn is_heartbeat(self) -> bool {
        matches!(self, Self::Ping | Self::Pong)
    }
}

/// A decoded channel message: its `type` plus the full JSON object it came in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event_type: String,
    pub payload: Value,
}

impl Envelope {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }

    #[must_use]
    pub fn kind(&self) -> EventKind {
        EventKind::from_type(&self.event_type)
    }

    /// Reads `timestamp` off the payload, if the sender included one.
    #[must_use]
    pub fn timestamp_ms(&self) -> Option<u64> {
        self.payload.get("timestamp").and_then(Value::as_u64)
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("message is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("message has no string `type` field")]
    MissingType,
    #[error("message exceeds {max} bytes (got {size})")]
    TooLarge { size: usize, max: usize },
    #[error("invalid backoff policy: {0}")]
    InvalidPolicy(&'static str),
}

pub fn decode_envelope(text: &str) -> Result<Envelope, CoreError> {
    if text.len() > MAX_MESSAGE_BYTES {
        return Err(CoreError::TooLarge {
            size: text.len(),
            max: MAX_MESSAGE_BYTES,
        });
    }

    let value: Value = serde_json::from_str(text)?;
    envelope_from_value(value)
}

pub fn envelope_from_value(value: Value) -> Result<Envelope, CoreError> {
    let event_type = match &value {
        Value::Object(object) => object
            .get("type")
            .and_then(Value::as_str)
            .ok_or(CoreError::MissingType)?
            .to_owned(),
        _ => return Err(CoreError::NotAnObject),
    };

    Ok(Envelope {
        event_type,
        payload: value,
    })
}

#[must_use]
pub fn ping_frame(timestamp_ms: u64) -> String {
    heartbeat_frame(TYPE_PING, timestamp_ms)
}

#[must_use]
pub fn pong_frame(timestamp_ms: u64) -> String {
    heartbeat_frame(TYPE_PONG, timestamp_ms)
}

fn heartbeat_frame(event_type: &str, timestamp_ms: u64) -> String {
    let mut object = Map::with_capacity(2);
    object.insert("type".to_owned(), Value::from(event_type));
    object.insert("timestamp".to_owned(), Value::from(timestamp_ms));
    Value::Object(object).to_string()
}

/// Builds the payload of a client-raised lifecycle notification.
#[must_use]
pub fn lifecycle_envelope(event_type: &str, mut fields: Map<String, Value>) -> Envelope {
    fields.insert("type".to_owned(), Value::from(event_type));
    Envelope::new(event_type, Value::Object(fields))
}
