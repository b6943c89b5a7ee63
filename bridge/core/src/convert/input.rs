//! Input Converter - inbound client packets to normalized chat events
//!
//! `chat.input` payloads arrive in one of two shapes:
//!
//! ```text
//! {"text": "hello", "attachments": [{"type": "image", "rid": "res-.."}]}
//! {"content": [{"type": "text", "text": "look"}, {"type": "image", "data": "<base64>"}]}
//! ```
//!
//! Text pieces are concatenated in order. Attachments that arrive by `rid`
//! are resolved; attachments that arrive inline (`data`, plain base64 or a
//! `data:` URI) are registered first. Either way the event carries uniform
//! [`AttachmentRef`]s.
//!
//! A bad attachment never blocks the text: it is dropped and recorded as an
//! [`InputWarning`] on the event.

use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Serialize;
use serde_json::Value;

use crate::error::BridgeError;
use crate::manager::ClientId;
use crate::protocol::{Packet, Payload};
use crate::resource::{ResourceKind, ResourceManager, ResourceSource, Rid};

/// What produced the event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InputSource {
    /// `chat.input`
    Chat,
    /// `chat.touch`
    Touch,
    /// `chat.shortcut`
    Shortcut,
}

/// A resolved attachment
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AttachmentRef {
    /// Resource id
    pub rid: Rid,
    /// Media kind
    pub kind: ResourceKind,
    /// MIME type
    pub mime: String,
    /// Size in bytes
    pub size: u64,
}

/// Why an attachment was dropped
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InputWarning {
    /// Declared kind is not image, audio, video or file
    UnsupportedKind(String),
    /// Referenced rid could not be resolved
    Unresolvable {
        /// The rid as sent
        rid: String,
        /// Resolution error
        reason: String,
    },
    /// Inline content could not be decoded or stored
    Rejected(String),
}

impl fmt::Display for InputWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedKind(kind) => write!(f, "unsupported attachment kind `{kind}`"),
            Self::Unresolvable { rid, reason } => write!(f, "attachment {rid} dropped: {reason}"),
            Self::Rejected(reason) => write!(f, "attachment dropped: {reason}"),
        }
    }
}

/// Backend-facing representation of one inbound message
///
/// Immutable once handed to the backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NormalizedChatEvent {
    /// Sending session
    pub client_id: ClientId,
    /// `metadata.messageId` if given, otherwise the packet id
    pub message_id: String,
    /// Text content
    pub content: String,
    /// Attachments in declaration order
    pub attachments: Vec<AttachmentRef>,
    /// Client-supplied emotion hint
    pub emotion_hint: Option<String>,
    /// Producing op
    pub source: InputSource,
    /// Packet timestamp (epoch ms)
    pub timestamp: i64,
    /// Dropped attachments
    #[serde(skip)]
    pub warnings: Vec<InputWarning>,
}

impl NormalizedChatEvent {
    /// Whether any attachment was dropped
    #[must_use]
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// A converted chat packet plus the resources registered while converting
#[derive(Debug)]
pub struct ConvertedInput {
    /// The event for the backend
    pub event: NormalizedChatEvent,
    /// Inline attachments newly registered; the caller owns one reference each
    pub registered: Vec<Rid>,
}

/// Maps inbound packets to [`NormalizedChatEvent`]s
#[derive(Clone, Debug)]
pub struct InputConverter {
    resources: ResourceManager,
    max_message_length: usize,
}

impl InputConverter {
    /// Create a converter
    #[must_use]
    pub fn new(resources: ResourceManager, max_message_length: usize) -> Self {
        Self {
            resources,
            max_message_length,
        }
    }

    /// Longest accepted text in characters
    #[must_use]
    pub fn max_message_length(&self) -> usize {
        self.max_message_length
    }

    /// Convert a `chat.input` packet
    ///
    /// # Errors
    ///
    /// [`BridgeError::InvalidPayload`] when the text is mistyped or too
    /// long, or when neither text nor a usable attachment remains.
    pub async fn convert_chat(
        &self,
        client_id: &ClientId,
        packet: &Packet,
    ) -> Result<ConvertedInput, BridgeError> {
        let empty = Payload::new();
        let payload = packet.payload.as_ref().unwrap_or(&empty);

        let mut content = match payload.get("text") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(text)) => text.clone(),
            Some(_) => return Err(BridgeError::InvalidPayload("`text` must be a string".into())),
        };

        let mut declared: Vec<&Value> = Vec::new();
        for key in ["content", "attachments"] {
            match payload.get(key) {
                None | Some(Value::Null) => {}
                Some(Value::Array(items)) => declared.extend(items),
                Some(_) => {
                    return Err(BridgeError::InvalidPayload(format!("`{key}` must be a list")))
                }
            }
        }

        let mut attachments = Vec::new();
        let mut registered = Vec::new();
        let mut warnings = Vec::new();

        for item in declared {
            let Some(object) = item.as_object() else {
                warnings.push(InputWarning::Rejected("item is not an object".into()));
                continue;
            };
            let kind_name = object
                .get("type")
                .or_else(|| object.get("kind"))
                .and_then(Value::as_str)
                .unwrap_or("file");

            if kind_name == "text" {
                if let Some(text) = object.get("text").and_then(Value::as_str) {
                    content.push_str(text);
                }
                continue;
            }

            let Some(kind) = ResourceKind::parse(kind_name) else {
                tracing::warn!(client_id = %client_id, kind = %kind_name, "Dropping unsupported attachment");
                warnings.push(InputWarning::UnsupportedKind(kind_name.to_string()));
                continue;
            };

            match self.attach(client_id, kind, object).await {
                Ok((attachment, fresh)) => {
                    if fresh {
                        registered.push(attachment.rid.clone());
                    }
                    attachments.push(attachment);
                }
                Err(warning) => {
                    tracing::warn!(client_id = %client_id, warning = %warning, "Dropping attachment");
                    warnings.push(warning);
                }
            }
        }

        let length = content.chars().count();
        if length > self.max_message_length {
            self.resources.release_all(&registered);
            return Err(BridgeError::InvalidPayload(format!(
                "text is {length} characters (max {})",
                self.max_message_length
            )));
        }
        if content.trim().is_empty() && attachments.is_empty() {
            return Err(BridgeError::InvalidPayload("message has no content".into()));
        }

        let message_id = payload
            .get("metadata")
            .and_then(|m| m.get("messageId"))
            .and_then(Value::as_str)
            .map_or_else(|| packet.id.clone(), str::to_string);

        Ok(ConvertedInput {
            event: NormalizedChatEvent {
                client_id: client_id.clone(),
                message_id,
                content,
                attachments,
                emotion_hint: payload
                    .get("emotion")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                source: InputSource::Chat,
                timestamp: packet.ts,
                warnings,
            },
            registered,
        })
    }

    async fn attach(
        &self,
        client_id: &ClientId,
        kind: ResourceKind,
        object: &serde_json::Map<String, Value>,
    ) -> Result<(AttachmentRef, bool), InputWarning> {
        let declared_mime = object.get("mime").and_then(Value::as_str);

        if let Some(rid) = object.get("rid").and_then(Value::as_str) {
            let rid = Rid::from(rid);
            let descriptor = self
                .resources
                .resolve(&rid)
                .map_err(|e| InputWarning::Unresolvable {
                    rid: rid.to_string(),
                    reason: e.to_string(),
                })?;
            return Ok((
                AttachmentRef {
                    rid,
                    kind: descriptor.kind,
                    mime: descriptor.mime,
                    size: descriptor.size,
                },
                false,
            ));
        }

        let Some(data) = object.get("data").and_then(Value::as_str) else {
            return Err(InputWarning::Rejected("attachment has neither rid nor data".into()));
        };
        let (uri_mime, bytes) = decode_inline(data)?;
        let mime = declared_mime
            .map(str::to_string)
            .or(uri_mime)
            .unwrap_or_else(|| kind.default_mime().to_string());
        let size = bytes.len() as u64;

        let rid = self
            .resources
            .register(
                ResourceSource::Bytes(bytes),
                kind,
                Some(mime.clone()),
                Some(client_id.clone()),
            )
            .await
            .map_err(|e| InputWarning::Rejected(e.to_string()))?;

        Ok((
            AttachmentRef {
                rid,
                kind,
                mime,
                size,
            },
            true,
        ))
    }

    /// Convert a `chat.touch` packet into `[touch] part=.. action=..` text
    #[must_use]
    pub fn convert_touch(&self, client_id: &ClientId, packet: &Packet) -> NormalizedChatEvent {
        let part = packet
            .str_field("part")
            .or_else(|| packet.str_field("area"))
            .unwrap_or("Unknown");
        let action = packet.str_field("action").unwrap_or("tap");

        let mut details = vec![format!("part={part}"), format!("action={action}")];
        for key in ["x", "y", "duration"] {
            if let Some(value) = packet.field(key).filter(|v| !v.is_null()) {
                details.push(format!("{key}={}", plain(value)));
            }
        }

        simple_event(
            client_id,
            packet,
            format!("[touch] {}", details.join(" ")),
            InputSource::Touch,
        )
    }

    /// Convert a `chat.shortcut` packet into `[shortcut] key=..` text
    #[must_use]
    pub fn convert_shortcut(&self, client_id: &ClientId, packet: &Packet) -> NormalizedChatEvent {
        let content = match packet.str_field("key").filter(|k| !k.is_empty()) {
            Some(key) => format!("[shortcut] key={key}"),
            None => "[shortcut]".to_string(),
        };
        simple_event(client_id, packet, content, InputSource::Shortcut)
    }
}

fn simple_event(
    client_id: &ClientId,
    packet: &Packet,
    content: String,
    source: InputSource,
) -> NormalizedChatEvent {
    NormalizedChatEvent {
        client_id: client_id.clone(),
        message_id: packet.id.clone(),
        content,
        attachments: Vec::new(),
        emotion_hint: None,
        source,
        timestamp: packet.ts,
        warnings: Vec::new(),
    }
}

fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Decode plain base64 or a `data:<mime>;base64,<payload>` URI
pub(crate) fn decode_inline(data: &str) -> Result<(Option<String>, Vec<u8>), InputWarning> {
    let (mime, encoded) = match data.strip_prefix("data:") {
        Some(rest) => {
            let (header, body) = rest
                .split_once(',')
                .ok_or_else(|| InputWarning::Rejected("malformed data URI".into()))?;
            let mime = header.strip_suffix(";base64").ok_or_else(|| {
                InputWarning::Rejected("data URI is not base64-encoded".into())
            })?;
            ((!mime.is_empty()).then(|| mime.to_string()), body)
        }
        None => (None, data),
    };
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| InputWarning::Rejected(format!("invalid base64: {e}")))?;
    Ok((mime, bytes))
}
