//! Wire envelope exchanged between agents.
//!
//! Every message on a channel is a JSON object of the form
//! `{context_id, sender, receiver, payload, timestamp, message_id}`. The
//! runtime never looks inside `payload`; only the agent handlers do.

use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{PipelineError, Result};

/// Opaque key/value body carried by an envelope.
pub type Payload = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlates every envelope of one run. Never rewritten after creation.
    pub context_id: String,
    pub sender: String,
    pub receiver: String,
    pub payload: Payload,
    /// Stamped on decode when the producer left it out.
    #[serde(default = "Utc::now", deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default = "Uuid::new_v4")]
    pub message_id: Uuid,
}

/// RFC 3339, or ISO-8601 without an offset, which is read as UTC.
fn deserialize_timestamp<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(timestamp.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(serde::de::Error::custom)
}

impl Envelope {
    /// Builds a fresh envelope with a new `message_id` and the current time.
    pub fn new(
        context_id: impl Into<String>,
        sender: impl Into<String>,
        receiver: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            context_id: context_id.into(),
            sender: sender.into(),
            receiver: receiver.into(),
            payload,
            timestamp: Utc::now(),
            message_id: Uuid::new_v4(),
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(self.encode()?))
    }

    /// Parses a raw channel message.
    ///
    /// Missing routing fields or a non-object `payload` yield
    /// [`PipelineError::MalformedEnvelope`].
    pub fn decode(raw: impl AsRef<[u8]>) -> Result<Self> {
        serde_json::from_slice(raw.as_ref())
            .map_err(|e| PipelineError::MalformedEnvelope(e.to_string()))
    }

    /// String field of the payload, or `""` when absent or not a string.
    pub fn payload_str(&self, key: &str) -> &str {
        self.payload.get(key).and_then(Value::as_str).unwrap_or_default()
    }
}

/// Converts a `json!({...})` literal into a [`Payload`]. Non-object values
/// produce an empty payload.
pub fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}
