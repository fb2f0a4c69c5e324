//! Wire envelope, control event names, and JSON / MessagePack encode/decode.

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite;

use crate::transport::Frame;
use crate::types::Error;

// ---------------------------------------------------------------------------
// Control event names
// ---------------------------------------------------------------------------

pub mod control {
    /// Server acknowledgement that completes the handshake.
    pub const CONNECTED: &str = "connected";
    /// Server-side error; during the handshake it may reject the credential.
    pub const ERROR: &str = "error";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const JOIN_ROOM: &str = "join-room";
    pub const LEAVE_ROOM: &str = "leave-room";
}

/// Encoding used for outbound frames. Inbound frames are accepted in either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    #[default]
    Json,
    Msgpack,
}

// ---------------------------------------------------------------------------
// Encode / decode helpers
// ---------------------------------------------------------------------------

pub fn encode_frame(frame: &Frame, format: WireFormat) -> Result<tungstenite::Message, Error> {
    match format {
        WireFormat::Json => Ok(tungstenite::Message::Text(
            serde_json::to_string(frame)?.into(),
        )),
        WireFormat::Msgpack => Ok(tungstenite::Message::Binary(
            rmp_serde::to_vec_named(frame)?.into(),
        )),
    }
}

pub fn decode_text(text: &str) -> Result<Frame, Error> {
    serde_json::from_str(text).map_err(|e| Error::Protocol(format!("frame decode error: {e}")))
}

pub fn decode_binary(data: &[u8]) -> Result<Frame, Error> {
    // msgpack → rmpv::Value → serde_json::Value → Frame. rmpv keeps binary
    // blobs that serde_json::Value has no representation for.
    let mut cursor = std::io::Cursor::new(data);
    let value = rmpv::decode::read_value(&mut cursor)
        .map_err(|e| Error::Protocol(format!("msgpack decode error: {e}")))?;
    serde_json::from_value(rmpv_to_json(value))
        .map_err(|e| Error::Protocol(format!("frame decode error: {e}")))
}

/// Convert an rmpv::Value to serde_json::Value, encoding binary data as base64 strings.
fn rmpv_to_json(value: rmpv::Value) -> serde_json::Value {
    match value {
        rmpv::Value::Nil => serde_json::Value::Null,
        rmpv::Value::Boolean(b) => serde_json::Value::Bool(b),
        rmpv::Value::Integer(i) => {
            if let Some(n) = i.as_i64() {
                serde_json::Value::Number(n.into())
            } else if let Some(n) = i.as_u64() {
                serde_json::Value::Number(n.into())
            } else {
                serde_json::Value::Null
            }
        }
        rmpv::Value::F32(f) => serde_json::Number::from_f64(f64::from(f))
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        rmpv::Value::F64(f) => serde_json::Number::from_f64(f)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        rmpv::Value::String(s) => match s.into_str() {
            Some(s) => serde_json::Value::String(s),
            None => {
                tracing::warn!("msgpack string contains invalid UTF-8, substituting empty string");
                serde_json::Value::String(String::new())
            }
        },
        rmpv::Value::Binary(bytes) => {
            serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(&bytes))
        }
        rmpv::Value::Array(arr) => {
            serde_json::Value::Array(arr.into_iter().map(rmpv_to_json).collect())
        }
        rmpv::Value::Map(map) => {
            let obj = map
                .into_iter()
                .map(|(k, v)| {
                    let key = match k {
                        rmpv::Value::String(s) => s.into_str().unwrap_or_default(),
                        other => format!("{other}"),
                    };
                    (key, rmpv_to_json(v))
                })
                .collect();
            serde_json::Value::Object(obj)
        }
        rmpv::Value::Ext(_, bytes) => {
            serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(&bytes))
        }
    }
}

/// Whether an `error` payload rejects the credential rather than reporting
/// a transient fault.
pub fn is_auth_rejection(payload: &serde_json::Value) -> bool {
    match payload.get("code") {
        Some(serde_json::Value::Number(n)) => matches!(n.as_u64(), Some(401 | 403)),
        Some(serde_json::Value::String(s)) => {
            matches!(s.as_str(), "401" | "403" | "unauthorized" | "forbidden")
        }
        _ => payload
            .get("message")
            .and_then(serde_json::Value::as_str)
            .is_some_and(|m| m.to_ascii_lowercase().starts_with("authentication")),
    }
}

/// Human-readable message from an `error` payload.
pub fn error_message(payload: &serde_json::Value) -> String {
    payload
        .get("message")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .or_else(|| payload.as_str().map(str::to_string))
        .unwrap_or_else(|| "no error details from server".to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
