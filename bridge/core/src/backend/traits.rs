//! Backend Traits
//!
//! The bridge hands every normalized inbound event to a [`ChatBackend`] and
//! turns whatever it replies into a performance. Backends know nothing about
//! sessions, packets, or transports.
//!
//! # Design Philosophy
//!
//! A backend may answer immediately (return `Some(reply)` from
//! `handle_event`) or later, by pushing replies through
//! `Bridge::deliver_reply`. Both paths go through the same output converter.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::convert::NormalizedChatEvent;
use crate::resource::Rid;

/// Where a voice clip's bytes come from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MediaSource {
    /// Already registered
    Resource(Rid),
    /// Raw bytes to register
    Bytes {
        /// Encoded audio
        data: Vec<u8>,
        /// MIME type
        mime: String,
    },
    /// File to register in place
    Path(PathBuf),
}

/// One voice clip, matched to a reply segment by position
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoiceClip {
    /// Clip content
    pub source: MediaSource,
    /// Declared length; estimated from the text when absent
    pub duration_ms: Option<u64>,
}

/// A backend's answer
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackendReply {
    /// Text to speak/show; may contain `[bridge:...]` hint tags
    pub text: String,
    /// Expression for every segment without its own tag
    pub emotion: Option<String>,
    /// Motion for every segment without its own tag
    pub motion: Option<String>,
    /// Voice clips, one per segment in order
    pub voice: Vec<VoiceClip>,
    /// Ask the client to cut off current playback
    pub interrupt: bool,
    /// Message id this reply answers
    pub reply_to: Option<String>,
}

impl BackendReply {
    /// Plain text reply
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Set the reply-level expression
    #[must_use]
    pub fn with_emotion(mut self, emotion: impl Into<String>) -> Self {
        self.emotion = Some(emotion.into());
        self
    }

    /// Set the reply-level motion
    #[must_use]
    pub fn with_motion(mut self, motion: impl Into<String>) -> Self {
        self.motion = Some(motion.into());
        self
    }

    /// Append a voice clip
    #[must_use]
    pub fn with_voice(mut self, source: MediaSource, duration_ms: Option<u64>) -> Self {
        self.voice.push(VoiceClip {
            source,
            duration_ms,
        });
        self
    }

    /// Set the interrupt flag
    #[must_use]
    pub fn with_interrupt(mut self, interrupt: bool) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Correlate with an inbound message id
    #[must_use]
    pub fn with_reply_to(mut self, message_id: impl Into<String>) -> Self {
        self.reply_to = Some(message_id.into());
        self
    }
}

/// Chat backend trait
///
/// Implement this trait to connect the bridge to a conversational host.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Get the backend name (e.g., "Echo", "Ollama")
    fn name(&self) -> &str;

    /// Check if the backend is reachable
    async fn health_check(&self) -> bool {
        true
    }

    /// Handle one inbound event, optionally replying right away
    async fn handle_event(
        &self,
        event: &NormalizedChatEvent,
    ) -> anyhow::Result<Option<BackendReply>>;
}

/// Standalone backend that echoes the text back
#[derive(Clone, Copy, Debug, Default)]
pub struct EchoBackend;

#[async_trait]
impl ChatBackend for EchoBackend {
    fn name(&self) -> &'static str {
        "Echo"
    }

    async fn handle_event(
        &self,
        event: &NormalizedChatEvent,
    ) -> anyhow::Result<Option<BackendReply>> {
        Ok(Some(
            BackendReply::text(format!("Received: {}", event.content))
                .with_reply_to(event.message_id.clone()),
        ))
    }
}
