//! Wire packet model
//!
//! Every message on the bridge connection is one [`Packet`]: an `op` selecting
//! the handler, an `id` correlating request and response, a millisecond
//! timestamp, and either a payload object or an [`ErrorInfo`].

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ops::Op;
use crate::error::ErrorCode;

/// Structured payload carried by a packet
pub type Payload = Map<String, Value>;

/// Error details attached to a rejected packet
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable numeric code shared with the client
    pub code: u32,
    /// Human readable message, safe to show to the client
    pub message: String,
}

impl ErrorInfo {
    /// Create error info from a wire code
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.as_u32(),
            message: message.into(),
        }
    }

    /// Typed view of the code, if it is one we know
    #[must_use]
    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_u32(self.code)
    }
}

/// One bridge protocol message
///
/// `payload` and `error` are mutually exclusive; the constructors keep it
/// that way and the codec rejects inbound packets carrying both.
#[derive(Clone, Debug, PartialEq)]
pub struct Packet {
    /// Operation name, e.g. `chat.input`
    pub op: String,
    /// Correlation id, unique per session
    pub id: String,
    /// Epoch milliseconds at creation
    pub ts: i64,
    /// Successful payload
    pub payload: Option<Payload>,
    /// Error details for a rejected request
    pub error: Option<ErrorInfo>,
}

impl Packet {
    /// Create a packet with no payload, stamped with the current time
    pub fn new(op: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            id: id.into(),
            ts: now_ms(),
            payload: None,
            error: None,
        }
    }

    /// Create a server-originated packet with a fresh id
    #[must_use]
    pub fn server(op: Op) -> Self {
        Self::new(op.as_str(), new_packet_id())
    }

    /// Create a response to `request` reusing its op and id
    #[must_use]
    pub fn reply(request: &Packet, payload: Payload) -> Self {
        Self::new(request.op.clone(), request.id.clone()).with_payload(payload)
    }

    /// Create an error packet correlated with `id`
    pub fn error_reply(id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        let mut packet = Self::new(Op::Error.as_str(), id);
        packet.error = Some(ErrorInfo::new(code, message));
        packet
    }

    /// Attach a payload, clearing any error
    #[must_use]
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self.error = None;
        self
    }

    /// Override the timestamp
    #[must_use]
    pub fn with_ts(mut self, ts: i64) -> Self {
        self.ts = ts;
        self
    }

    /// The typed op, or `None` for ops outside the protocol vocabulary
    #[must_use]
    pub fn known_op(&self) -> Option<Op> {
        Op::parse(&self.op)
    }

    /// Whether this packet reports an error
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Look up a payload field
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.as_ref().and_then(|p| p.get(key))
    }

    /// Look up a string payload field
    #[must_use]
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.field(key).and_then(Value::as_str)
    }
}

/// Turn a JSON value into a payload map; non-objects become an empty map
#[must_use]
pub fn into_payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Current time in epoch milliseconds
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Generate an id for a server-originated packet
#[must_use]
pub fn new_packet_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("srv-{}", COUNTER.fetch_add(1, Ordering::Relaxed))
}
