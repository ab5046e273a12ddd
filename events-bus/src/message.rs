//! Wire representation of events on a stream.
//!
//! Every entry carries exactly two string fields: `metadata`, a JSON object
//! describing the event and its delivery attempt, and `payload`, the full
//! JSON-serialized event body.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::brokers::{EntryFields, StreamEntry};

pub const METADATA_FIELD: &str = "metadata";
pub const PAYLOAD_FIELD: &str = "payload";

/// Schema version stamped on every published message.
pub const SCHEMA_VERSION: &str = "1.0";

/// Attempt number of a freshly published event.
pub const FIRST_ATTEMPT: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: String,

    #[serde(rename = "type", default, deserialize_with = "lenient_string")]
    pub event_type: String,

    #[serde(default, deserialize_with = "lenient_string")]
    pub timestamp: String,

    #[serde(default, deserialize_with = "lenient_string")]
    pub version: String,

    #[serde(default = "first_attempt", deserialize_with = "lenient_attempt")]
    pub attempt: u32,

    /// Keys this crate does not know about, carried over on resubmission.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn first_attempt() -> u32 {
    FIRST_ATTEMPT
}

/// Any JSON number is an attempt count (fractions truncated, at least 1);
/// anything else counts as the first attempt.
fn lenient_attempt<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(attempt_from_value(&value))
}

/// Known string keys holding anything but a string read as empty.
fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        _ => Ok(String::new()),
    }
}

pub(crate) fn attempt_from_value(value: &Value) -> u32 {
    value
        .as_f64()
        .map(|n| n.trunc().clamp(1.0, u32::MAX as f64) as u32)
        .unwrap_or(FIRST_ATTEMPT)
}

impl EventMetadata {
    /// Metadata for the first publication of an event.
    pub fn first(id: impl Into<String>, event_type: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            event_type: event_type.into(),
            timestamp: format_timestamp(timestamp),
            version: SCHEMA_VERSION.to_string(),
            attempt: FIRST_ATTEMPT,
            extra: Map::new(),
        }
    }

    /// Same event, next attempt. Every other key is kept as is.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            ..self.clone()
        }
    }

    /// Parsed timestamp; unparseable values map to the Unix epoch.
    pub fn event_time(&self) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

/// RFC 3339 with whole seconds and a `Z` suffix.
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Why a delivered entry could not be turned into a [`StreamMessage`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedMessage {
    #[error("message {id} has no metadata field")]
    MissingMetadata { id: String },

    #[error("message {id} has unparseable metadata: {reason}")]
    InvalidMetadata { id: String, reason: String },
}

/// A delivered entry with its metadata decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    /// Broker-assigned id of this delivery
    pub id: String,
    pub metadata: EventMetadata,
    pub payload: String,
}

impl StreamMessage {
    pub fn parse(entry: &StreamEntry) -> Result<Self, MalformedMessage> {
        let raw = entry
            .field(METADATA_FIELD)
            .ok_or_else(|| MalformedMessage::MissingMetadata { id: entry.id.clone() })?;

        let invalid = |reason: String| MalformedMessage::InvalidMetadata {
            id: entry.id.clone(),
            reason,
        };

        let value: Value = serde_json::from_str(raw).map_err(|e| invalid(e.to_string()))?;
        if !value.is_object() {
            return Err(invalid("metadata is not a JSON object".to_string()));
        }
        let metadata: EventMetadata = serde_json::from_value(value).map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            id: entry.id.clone(),
            metadata,
            payload: entry.field(PAYLOAD_FIELD).unwrap_or_default().to_string(),
        })
    }

    pub fn attempt(&self) -> u32 {
        self.metadata.attempt
    }

    /// Fields of the resubmitted copy: same payload, attempt + 1.
    pub fn retry_fields(&self) -> serde_json::Result<EntryFields> {
        encode_fields(&self.metadata.next_attempt(), &self.payload)
    }
}

/// Encode metadata and payload as the two stream fields.
pub fn encode_fields(metadata: &EventMetadata, payload: &str) -> serde_json::Result<EntryFields> {
    Ok(vec![
        (METADATA_FIELD.to_string(), serde_json::to_string(metadata)?),
        (PAYLOAD_FIELD.to_string(), payload.to_string()),
    ])
}
