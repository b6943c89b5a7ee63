//! Handshake payload parsing and capability negotiation

use serde_json::{json, Value};

use crate::error::BridgeError;
use crate::protocol::{into_payload, Payload};

/// Protocol major version this server speaks
pub const PROTOCOL_MAJOR: &str = "1.";

/// Capabilities the server advertises in the handshake ack
pub const SERVER_CAPABILITIES: [&str; 5] = [
    "chat.perform",
    "chat.interrupt",
    "res.register",
    "res.ack",
    "status.query",
];

/// What the client reported at handshake
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientCapabilities {
    /// Avatar model identifier
    pub model: Option<String>,
    /// Motion groups the model can play
    pub motions: Vec<String>,
    /// Expression names the model has
    pub expressions: Vec<String>,
    /// Free-form feature flags
    pub features: Vec<String>,
}

impl ClientCapabilities {
    /// Whether the client advertised `group`
    #[must_use]
    pub fn supports_motion(&self, group: &str) -> bool {
        self.motions.iter().any(|m| m == group)
    }
}

/// Parsed `sys.handshake` payload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Bearer token, when auth and handshake share a packet
    pub token: Option<String>,
    /// Client protocol version
    pub version: Option<String>,
    /// Reported capabilities
    pub capabilities: ClientCapabilities,
}

impl HandshakeRequest {
    /// Parse and validate a handshake payload
    ///
    /// # Errors
    ///
    /// [`BridgeError::InvalidPayload`] for mistyped fields,
    /// [`BridgeError::VersionMismatch`] for a version outside `1.x`.
    pub fn parse(payload: Option<&Payload>) -> Result<Self, BridgeError> {
        let empty = Payload::new();
        let payload = payload.unwrap_or(&empty);

        let version = optional_string(payload, "version")?
            .or(optional_string(payload, "protocol_version")?);
        if let Some(ref v) = version {
            if !v.starts_with(PROTOCOL_MAJOR) {
                return Err(BridgeError::VersionMismatch(v.clone()));
            }
        }

        Ok(Self {
            token: optional_string(payload, "token")?,
            version,
            capabilities: ClientCapabilities {
                model: optional_string(payload, "model")?,
                motions: string_list(payload, "motions")?,
                expressions: string_list(payload, "expressions")?,
                features: string_list(payload, "capabilities")?,
            },
        })
    }
}

/// Values advertised to the client in the handshake ack
#[derive(Clone, Debug)]
pub struct ServerAdvert {
    /// Longest accepted chat text, in characters
    pub max_message_length: usize,
    /// Largest resource embedded inline in descriptors
    pub max_inline_bytes: u64,
    /// Base URL of the resource byte server
    pub resource_base_url: String,
    /// Interval after which the server pings a silent client
    pub ping_interval_ms: u64,
}

/// Build the handshake ack payload
#[must_use]
pub fn ack_payload(client_id: &str, advert: &ServerAdvert) -> Payload {
    into_payload(json!({
        "clientId": client_id,
        "sessionId": format!("session-{client_id}"),
        "server": {
            "name": "avatar-bridge",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "capabilities": SERVER_CAPABILITIES,
        "config": {
            "maxMessageLength": advert.max_message_length,
            "maxInlineBytes": advert.max_inline_bytes,
            "resourceBaseUrl": advert.resource_base_url,
            "pingIntervalMs": advert.ping_interval_ms,
            "supportedImageFormats": ["jpg", "png", "gif", "webp"],
            "supportedAudioFormats": ["mp3", "wav", "ogg"],
        },
    }))
}

fn optional_string(payload: &Payload, key: &str) -> Result<Option<String>, BridgeError> {
    match payload.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(BridgeError::InvalidPayload(format!("`{key}` must be a string"))),
    }
}

fn string_list(payload: &Payload, key: &str) -> Result<Vec<String>, BridgeError> {
    match payload.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    BridgeError::InvalidPayload(format!("`{key}` must be a list of strings"))
                })
            })
            .collect(),
        Some(_) => Err(BridgeError::InvalidPayload(format!(
            "`{key}` must be a list of strings"
        ))),
    }
}
