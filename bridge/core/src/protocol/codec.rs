//! Packet Codec
//!
//! Serializes packets to UTF-8 JSON text and back.
//!
//! # Wire Format
//!
//! ```text
//! {"op": string, "id": string, "ts": int, "payload": object|null, "error": {"code": int, "message": string}|null}
//! ```
//!
//! Decoding checks structure only. An `op` outside the protocol vocabulary
//! decodes fine and is left for routing to reject.
//!
//! # Security
//!
//! - Maximum packet size is checked before parsing
//! - Text must be valid UTF-8

use serde_json::{Map, Value};
use thiserror::Error;

use super::packet::{ErrorInfo, Packet, Payload};

/// Maximum encoded packet size (32 MB)
///
/// Large enough for a base64-encoded resource at the default ceiling.
pub const MAX_PACKET_SIZE: usize = 32 * 1024 * 1024;

/// Reasons an inbound frame is not a packet
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Frame bytes are not UTF-8
    #[error("packet is not valid UTF-8")]
    InvalidUtf8,

    /// Frame is not JSON
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// Frame is JSON but not an object
    #[error("packet is not a JSON object")]
    NotAnObject,

    /// A required field is absent
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    /// A field has the wrong JSON type
    #[error("field `{field}` must be {expected}")]
    WrongType {
        /// Field name
        field: &'static str,
        /// Expected JSON type
        expected: &'static str,
    },

    /// The `op` field is empty
    #[error("field `op` must not be empty")]
    EmptyOp,

    /// Both `payload` and `error` are set
    #[error("packet carries both payload and error")]
    PayloadAndError,

    /// Frame exceeds [`MAX_PACKET_SIZE`]
    #[error("packet of {size} bytes exceeds the {max} byte limit")]
    TooLarge {
        /// Frame size in bytes
        size: usize,
        /// Limit in bytes
        max: usize,
    },
}

/// Encode a packet as UTF-8 JSON
///
/// Total for every packet value: `payload` and `error` serialize as `null`
/// when absent.
#[must_use]
pub fn encode(packet: &Packet) -> Vec<u8> {
    let mut object = Map::with_capacity(5);
    object.insert("op".into(), Value::String(packet.op.clone()));
    object.insert("id".into(), Value::String(packet.id.clone()));
    object.insert("ts".into(), Value::from(packet.ts));
    object.insert(
        "payload".into(),
        packet.payload.clone().map_or(Value::Null, Value::Object),
    );
    object.insert(
        "error".into(),
        packet.error.as_ref().map_or(Value::Null, error_value),
    );
    Value::Object(object).to_string().into_bytes()
}

fn error_value(error: &ErrorInfo) -> Value {
    let mut object = Map::with_capacity(2);
    object.insert("code".into(), Value::from(error.code));
    object.insert("message".into(), Value::String(error.message.clone()));
    Value::Object(object)
}

/// Decode a frame into a packet
///
/// # Errors
///
/// Returns a [`DecodeError`] when the frame is too large, not UTF-8, not a
/// JSON object, lacks `op`/`id`/`ts`, has mistyped fields, or carries both a
/// payload and an error.
pub fn decode(bytes: &[u8]) -> Result<Packet, DecodeError> {
    let mut object = parse_object(bytes)?;

    let op = take_string(&mut object, "op")?;
    if op.is_empty() {
        return Err(DecodeError::EmptyOp);
    }
    let id = take_string(&mut object, "id")?;
    let ts = match object.remove("ts") {
        None => return Err(DecodeError::MissingField("ts")),
        Some(Value::Number(n)) => n.as_i64().ok_or(DecodeError::WrongType {
            field: "ts",
            expected: "an integer",
        })?,
        Some(_) => {
            return Err(DecodeError::WrongType {
                field: "ts",
                expected: "an integer",
            })
        }
    };

    let payload: Option<Payload> = match object.remove("payload") {
        None | Some(Value::Null) => None,
        Some(Value::Object(map)) => Some(map),
        Some(_) => {
            return Err(DecodeError::WrongType {
                field: "payload",
                expected: "an object or null",
            })
        }
    };

    let error = match object.remove("error") {
        None | Some(Value::Null) => None,
        Some(value) => Some(serde_json::from_value::<ErrorInfo>(value).map_err(|_| {
            DecodeError::WrongType {
                field: "error",
                expected: "an object with code and message",
            }
        })?),
    };

    if payload.is_some() && error.is_some() {
        return Err(DecodeError::PayloadAndError);
    }

    Ok(Packet {
        op,
        id,
        ts,
        payload,
        error,
    })
}

/// Best-effort recovery of the `id` of a frame that failed to decode
///
/// Used to correlate the error response when the frame is JSON but
/// otherwise invalid.
#[must_use]
pub fn salvage_id(bytes: &[u8]) -> Option<String> {
    let object = parse_object(bytes).ok()?;
    object.get("id")?.as_str().map(str::to_string)
}

fn parse_object(bytes: &[u8]) -> Result<Map<String, Value>, DecodeError> {
    if bytes.len() > MAX_PACKET_SIZE {
        return Err(DecodeError::TooLarge {
            size: bytes.len(),
            max: MAX_PACKET_SIZE,
        });
    }
    let text = std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)?;
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(_) => Err(DecodeError::NotAnObject),
        Err(e) => Err(DecodeError::Malformed(e.to_string())),
    }
}

fn take_string(object: &mut Map<String, Value>, field: &'static str) -> Result<String, DecodeError> {
    match object.remove(field) {
        None => Err(DecodeError::MissingField(field)),
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(DecodeError::WrongType {
            field,
            expected: "a string",
        }),
    }
}
