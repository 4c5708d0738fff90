//! Topic payload variants.
//!
//! Payloads are opaque to the broker, but they are decoded exactly once at
//! the wire boundary into a closed set of variants chosen by the topic
//! scheme: JSON documents, plain text for source-like topics, and raw bytes
//! for images (base64 on the wire).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde_json::Value;

use crate::error::{ProtocolError, Result};

/// Returns the scheme prefix of a resolved topic, including the trailing
/// `:`, or the empty string for an unqualified name.
pub fn scheme_of(topic: &str) -> &str {
    match topic.find(':') {
        Some(idx) => &topic[..=idx],
        None => "",
    }
}

/// A decoded topic payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Structured JSON document (`json:`, `app:`, arbitrary server schemes).
    Json(Value),
    /// Plain text (`file:`, `javascript:`, `query:`).
    Text(String),
    /// Raw bytes (`image:`), base64-encoded on the wire.
    Binary(Bytes),
}

impl Payload {
    /// Decodes a wire `content` value for the given resolved topic.
    pub fn from_wire(topic: &str, content: Value) -> Result<Self> {
        match scheme_of(topic) {
            "image:" => match content {
                Value::String(encoded) => {
                    let bytes = BASE64.decode(encoded.as_bytes()).map_err(|e| {
                        ProtocolError::InvalidPayload {
                            scheme: "image:".to_string(),
                            detail: e.to_string(),
                        }
                    })?;
                    Ok(Payload::Binary(Bytes::from(bytes)))
                }
                other => Err(ProtocolError::InvalidPayload {
                    scheme: "image:".to_string(),
                    detail: format!("expected base64 string, got {other}"),
                }),
            },
            "file:" | "javascript:" | "query:" => match content {
                Value::String(text) => Ok(Payload::Text(text)),
                // Some server-side tooling wraps text sources in a JSON value.
                other => Ok(Payload::Text(other.to_string())),
            },
            _ => Ok(Payload::Json(content)),
        }
    }

    /// Encodes the payload into a wire `content` value.
    pub fn to_wire(&self) -> Value {
        match self {
            Payload::Json(value) => value.clone(),
            Payload::Text(text) => Value::String(text.clone()),
            Payload::Binary(bytes) => Value::String(BASE64.encode(bytes)),
        }
    }

    /// Returns the JSON document if this payload is structured.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Reads one field of an object-valued payload.
    ///
    /// Returns `None` for non-object payloads, missing fields, and fields
    /// whose value is JSON null.
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Payload::Json(Value::Object(map)) => map.get(name).filter(|v| !v.is_null()),
            _ => None,
        }
    }

    /// Writes one field of an object-valued payload.
    ///
    /// A non-object payload is replaced by a fresh single-field object.
    pub fn set_field(&mut self, name: &str, value: Value) {
        match self {
            Payload::Json(Value::Object(map)) => {
                map.insert(name.to_string(), value);
            }
            _ => {
                let mut map = serde_json::Map::new();
                map.insert(name.to_string(), value);
                *self = Payload::Json(Value::Object(map));
            }
        }
    }

    /// Renders the payload as a string for `${...}` topic substitution.
    pub fn as_substitution(&self) -> String {
        match self {
            Payload::Json(Value::String(s)) => s.clone(),
            Payload::Json(Value::Null) => String::new(),
            Payload::Json(value) => value.to_string(),
            Payload::Text(text) => text.clone(),
            Payload::Binary(_) => String::new(),
        }
    }
}
