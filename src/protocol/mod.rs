//! Control-envelope codec.
//!
//! Every frame on a session socket is one complete JSON object. A frame
//! either carries a `type` discriminator (control traffic), a `method`
//! field (the generic request/response protocol), or neither, in which
//! case it is preserved untouched and forwarded as-is. The proxy never
//! decodes spliced frames; this codec belongs to the backend session plane
//! and to tests.
//!
//! # Design Decisions
//! - Internally tagged serde enum for control messages; unknown
//!   discriminators stay `Frame::Other` rather than erroring
//! - Field-level defaults keep decoding lenient for partially filled
//!   envelopes; only malformed JSON aborts a leg
//! - Millisecond timestamps everywhere

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Error type for frame decoding.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
}

/// The first client→backend frame after an upgrade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
}

/// Typed control traffic, discriminated on `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    QueryName {
        #[serde(default)]
        id: String,
    },
    NameResponse {
        #[serde(default)]
        client_id: String,
        #[serde(default)]
        client_name: String,
        #[serde(default)]
        timestamp: i64,
    },
    Ping {
        #[serde(default)]
        timestamp: i64,
    },
    Pong {
        #[serde(default)]
        timestamp: i64,
    },
    Command {
        command: String,
        #[serde(default)]
        data: Value,
        #[serde(default)]
        from: String,
    },
    CommandResponse {
        #[serde(default)]
        result: String,
        #[serde(default)]
        message: String,
        #[serde(default)]
        data: Value,
        #[serde(default)]
        timestamp: i64,
    },
}

/// RESTish request carried over a session socket, paired with a
/// [`ResponseEnvelope`] by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(default)]
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<std::collections::HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default)]
    pub timestamp: i64,
}

/// Response half of the request/response protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<std::collections::HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: i64,
}

impl ResponseEnvelope {
    /// Build a response correlated with `request_id`.
    pub fn new(request_id: &str, status: u16, body: Option<Value>) -> Self {
        Self {
            id: request_id.to_string(),
            status,
            headers: None,
            body,
            error: None,
            timestamp: timestamp_ms(),
        }
    }
}

/// One decoded frame.
#[derive(Debug, Clone)]
pub enum Frame {
    Control(ControlMessage),
    Request(RequestEnvelope),
    /// Well-formed object with no known discriminator; preserved verbatim.
    Other(Value),
}

/// Decode one frame of text.
///
/// Malformed JSON is an error (the leg is aborted); anything that parses
/// as an object is accepted, falling back to [`Frame::Other`] so unknown
/// message shapes survive unchanged.
pub fn decode(text: &str) -> Result<Frame, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    if !value.is_object() {
        return Err(ProtocolError::NotAnObject);
    }

    if value.get("type").is_some() {
        return match serde_json::from_value::<ControlMessage>(value.clone()) {
            Ok(msg) => Ok(Frame::Control(msg)),
            // Unknown discriminator: keep the frame as-is.
            Err(_) => Ok(Frame::Other(value)),
        };
    }

    if value.get("method").is_some() {
        let request = serde_json::from_value(value)?;
        return Ok(Frame::Request(request));
    }

    Ok(Frame::Other(value))
}

/// Encode any envelope back to one frame of text.
pub fn encode<T: Serialize>(envelope: &T) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(envelope)?)
}
