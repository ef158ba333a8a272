//! Envelope contract shared by the worker and the bus.
//!
//! Every record the worker emits, and every record relayed through a bridge, is a
//! JSON object carrying at least a string `topic`. Everything else is opaque to the
//! adapter and is preserved as-is.

use serde::{Deserialize, Serialize};

/// JSON envelope exchanged with the worker and relayed on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
    /// Any other fields (created_at, service_uuid, ...).
    #[serde(flatten)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// A record that cannot be routed. Always recovered locally by dropping the record.
#[derive(Debug, thiserror::Error)]
pub enum FrameParseError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("record is not a JSON object")]
    NotAnObject,

    #[error("record has no string `topic` field")]
    MissingTopic,
}

impl Envelope {
    /// Parse one worker line. The line must be an object with a string `topic`.
    pub fn parse(line: &str) -> Result<Self, FrameParseError> {
        Self::from_value(serde_json::from_str(line)?)
    }

    /// Same checks as [`parse`](Self::parse), on a raw bus payload.
    pub fn from_slice(payload: &[u8]) -> Result<Self, FrameParseError> {
        Self::from_value(serde_json::from_slice(payload)?)
    }

    fn from_value(value: serde_json::Value) -> Result<Self, FrameParseError> {
        let serde_json::Value::Object(map) = value else {
            return Err(FrameParseError::NotAnObject);
        };
        match map.get("topic") {
            Some(serde_json::Value::String(_)) => {}
            _ => return Err(FrameParseError::MissingTopic),
        }
        Ok(serde_json::from_value(serde_json::Value::Object(map))?)
    }
}

/// Decode a bus payload and re-encode it canonically on a single line.
///
/// Used on the listener -> worker path so the worker never sees the raw bytes
/// (which could contain embedded newlines or trailing garbage).
pub fn canonicalize(payload: &[u8]) -> Result<String, FrameParseError> {
    let value: serde_json::Value = serde_json::from_slice(payload)?;
    Ok(serde_json::to_string(&value)?)
}

/// Replace the embedded `topic` field of a JSON object payload and re-serialize it.
///
/// Field order is preserved, so only the topic value changes.
pub fn rewrite_topic(payload: &[u8], topic: &str) -> Result<String, FrameParseError> {
    let value: serde_json::Value = serde_json::from_slice(payload)?;
    let serde_json::Value::Object(mut map) = value else {
        return Err(FrameParseError::NotAnObject);
    };
    map.insert(
        "topic".to_string(),
        serde_json::Value::String(topic.to_string()),
    );
    Ok(serde_json::to_string(&serde_json::Value::Object(map))?)
}
