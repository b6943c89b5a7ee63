//! Output Converter - backend replies to performance sequences
//!
//! # Algorithm
//!
//! 1. Split the reply into playback-ordered segments at sentence ends
//! 2. Strip `[bridge:...]` tags from each segment and apply them to it
//! 3. Pick an expression per segment: tag, then reply-level hint, then the
//!    emotion policy (when `auto_emotion` is on), else neutral
//! 4. Lay segments end to end. A segment lasts as long as its text estimate
//!    or its voice clip, whichever is longer
//!
//! # Channels
//!
//! The expression channel is serial: a cue is emitted only when the
//! expression changes and it lasts until the next one starts. Motion and
//! voice cues start at segment boundaries and may overlap expression.
//!
//! Cues at one offset are ordered expression, text, motion, voice, so
//! offsets are non-decreasing across the whole sequence.
//!
//! # Media
//!
//! Voice clips are resolved to rids before the sequence leaves the
//! converter. A clip that cannot be registered or resolved is dropped and
//! the rest of the sequence is still delivered. Every rid in a returned
//! sequence carries one reference taken for the receiving session.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::emotion::{
    default_expressions, EmotionPolicy, ExpressionEntry, KeywordEmotionPolicy, NEUTRAL_EXPRESSION,
};
use super::hints::{extract_tags, tag_span, HintTag};
use crate::backend::{BackendReply, MediaSource, VoiceClip};
use crate::manager::ClientId;
use crate::protocol::{into_payload, Payload};
use crate::resource::{ResourceDescriptor, ResourceKind, ResourceManager, ResourceSource, Rid};
use crate::session::ClientCapabilities;

/// Characters that end a segment
const SENTENCE_ENDS: [char; 9] = ['.', '!', '?', '\n', '。', '！', '？', '…', '~'];

/// Output converter settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Run the emotion policy when no hint is present
    pub auto_emotion: bool,
    /// Text duration estimate per character
    pub ms_per_char: u64,
    /// Floor for a segment's estimated duration
    pub min_segment_ms: u64,
    /// Ordered expression table
    pub expressions: Vec<ExpressionEntry>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            auto_emotion: true,
            ms_per_char: 120,
            min_segment_ms: 800,
            expressions: default_expressions(),
        }
    }
}

/// Cue channel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CueKind {
    /// Motion group playback
    Motion,
    /// Facial expression
    Expression,
    /// Voice clip
    Voice,
    /// Subtitle text
    Text,
}

impl CueKind {
    /// Lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Motion => "motion",
            Self::Expression => "expression",
            Self::Voice => "voice",
            Self::Text => "text",
        }
    }
}

/// One timed instruction
#[derive(Clone, Debug, PartialEq)]
pub struct Cue {
    /// Channel
    pub kind: CueKind,
    /// Start, in milliseconds from sequence start
    pub start_offset: u64,
    /// Length in milliseconds, when bounded
    pub duration: Option<u64>,
    /// Referenced resource
    pub resource_ref: Option<Rid>,
    /// Channel-specific data
    pub payload: Value,
}

impl Cue {
    fn new(kind: CueKind, start_offset: u64, payload: Value) -> Self {
        Self {
            kind,
            start_offset,
            duration: None,
            resource_ref: None,
            payload,
        }
    }

    /// End offset, when the cue has a duration
    #[must_use]
    pub fn end_offset(&self) -> Option<u64> {
        self.duration.map(|d| self.start_offset.saturating_add(d))
    }

    /// JSON form used in `chat.perform`
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut value = json!({
            "kind": self.kind.as_str(),
            "startOffset": self.start_offset,
            "payload": self.payload,
        });
        if let Some(object) = value.as_object_mut() {
            if let Some(duration) = self.duration {
                object.insert("duration".into(), json!(duration));
            }
            if let Some(rid) = &self.resource_ref {
                object.insert("resourceRef".into(), json!(rid.as_str()));
            }
        }
        value
    }
}

/// Ordered cues for one reply
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PerformanceSequence {
    /// Cues with non-decreasing offsets
    pub cues: Vec<Cue>,
    /// Ask the client to cut off current playback
    pub interrupt: bool,
}

impl PerformanceSequence {
    /// Whether there is nothing to perform
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cues.is_empty()
    }

    /// Every rid referenced by a cue, in cue order
    #[must_use]
    pub fn resource_refs(&self) -> Vec<Rid> {
        self.cues
            .iter()
            .filter_map(|c| c.resource_ref.clone())
            .collect()
    }

    /// End of the last bounded cue
    #[must_use]
    pub fn total_duration(&self) -> u64 {
        self.cues
            .iter()
            .filter_map(Cue::end_offset)
            .max()
            .unwrap_or(0)
    }

    /// Cues on one channel
    pub fn of_kind(&self, kind: CueKind) -> impl Iterator<Item = &Cue> {
        self.cues.iter().filter(move |c| c.kind == kind)
    }

    /// `chat.perform` payload
    #[must_use]
    pub fn to_payload(&self, reply_to: Option<&str>) -> Payload {
        let mut payload = into_payload(json!({
            "sequence": self.cues.iter().map(Cue::to_value).collect::<Vec<_>>(),
            "interrupt": self.interrupt,
        }));
        if let Some(id) = reply_to {
            payload.insert("replyTo".into(), json!(id));
        }
        payload
    }
}

struct Segment {
    text: String,
    emotion: Option<String>,
    motion: Option<String>,
}

/// Maps [`BackendReply`]s to [`PerformanceSequence`]s
pub struct OutputConverter {
    config: OutputConfig,
    policy: Box<dyn EmotionPolicy>,
    resources: ResourceManager,
}

impl std::fmt::Debug for OutputConverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputConverter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OutputConverter {
    /// Create a converter using the keyword policy over the configured table
    #[must_use]
    pub fn new(config: OutputConfig, resources: ResourceManager) -> Self {
        let policy = KeywordEmotionPolicy::new(config.expressions.clone());
        Self {
            config,
            policy: Box::new(policy),
            resources,
        }
    }

    /// Replace the emotion policy
    #[must_use]
    pub fn with_policy(mut self, policy: Box<dyn EmotionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Split text into playback-ordered segments
    ///
    /// Hint tags are kept whole, so terminators inside a tag argument never
    /// split a segment.
    #[must_use]
    pub fn segment(text: &str) -> Vec<String> {
        let mut segments = Vec::new();
        let mut current = String::new();
        let mut rest = text;

        while let Some(c) = rest.chars().next() {
            if let Some(len) = tag_span(rest) {
                current.push_str(&rest[..len]);
                rest = &rest[len..];
                continue;
            }
            current.push(c);
            rest = &rest[c.len_utf8()..];
            if SENTENCE_ENDS.contains(&c) {
                // keep runs like "?!" or "..." together
                while let Some(next) = rest.chars().next().filter(|n| SENTENCE_ENDS.contains(n)) {
                    current.push(next);
                    rest = &rest[next.len_utf8()..];
                }
                push_segment(&mut segments, &current);
                current.clear();
            }
        }
        push_segment(&mut segments, &current);
        segments
    }

    fn estimate_ms(&self, text: &str) -> u64 {
        let chars = text.chars().count() as u64;
        chars
            .saturating_mul(self.config.ms_per_char)
            .max(self.config.min_segment_ms)
    }

    fn plan(reply: &BackendReply) -> (Vec<Segment>, bool) {
        let mut interrupt = reply.interrupt;
        let mut segments = Vec::new();
        let mut carried_emotion = None;
        let mut carried_motion = None;

        for raw in Self::segment(&reply.text) {
            let (text, tags) = extract_tags(&raw);
            let mut emotion = carried_emotion.take();
            let mut motion = carried_motion.take();
            for tag in tags {
                match tag {
                    HintTag::Emotion(name) => emotion = Some(name),
                    HintTag::Motion(group) => motion = Some(group),
                    HintTag::Interrupt => interrupt = true,
                }
            }
            if text.is_empty() {
                // tag-only segments apply to the next spoken one
                carried_emotion = emotion;
                carried_motion = motion;
                continue;
            }
            segments.push(Segment {
                text,
                emotion,
                motion,
            });
        }

        if segments.is_empty() && !reply.voice.is_empty() {
            segments.push(Segment {
                text: String::new(),
                emotion: carried_emotion,
                motion: carried_motion,
            });
        }
        (segments, interrupt)
    }

    /// Build the performance for `reply` as seen by a client with `capabilities`
    ///
    /// `owner` is recorded on resources registered from reply media.
    pub async fn convert(
        &self,
        reply: &BackendReply,
        capabilities: &ClientCapabilities,
        owner: Option<&ClientId>,
    ) -> PerformanceSequence {
        let (segments, interrupt) = Self::plan(reply);
        let mut cues: Vec<Cue> = Vec::new();
        let mut expression_starts: Vec<usize> = Vec::new();
        let mut current_expression: Option<String> = None;
        let mut offset = 0u64;

        for (index, segment) in segments.iter().enumerate() {
            let (expression, suggested_motion) = self.pick_expression(segment, reply);
            let explicit_motion = segment.motion.clone().or_else(|| reply.motion.clone());

            let text_ms = if segment.text.is_empty() {
                0
            } else {
                self.estimate_ms(&segment.text)
            };
            let voice = match reply.voice.get(index) {
                Some(clip) => self.resolve_voice(clip, owner).await,
                None => None,
            };
            let voice_ms = voice
                .as_ref()
                .map(|(_, clip_ms)| clip_ms.unwrap_or_else(|| self.estimate_ms(&segment.text)));
            let length = text_ms.max(voice_ms.unwrap_or(0));

            if current_expression.as_deref() != Some(expression.as_str()) {
                expression_starts.push(cues.len());
                cues.push(Cue::new(
                    CueKind::Expression,
                    offset,
                    json!({ "name": expression }),
                ));
                current_expression = Some(expression);
            }

            if !segment.text.is_empty() {
                let mut cue = Cue::new(CueKind::Text, offset, json!({ "text": segment.text }));
                cue.duration = Some(length);
                cues.push(cue);
            }

            if let Some(group) = explicit_motion {
                let payload = if capabilities.supports_motion(&group) {
                    json!({ "group": group, "index": 0 })
                } else {
                    tracing::debug!(group = %group, "Motion not advertised by client, sending no-op");
                    json!({ "noop": true, "requested": group })
                };
                cues.push(Cue::new(CueKind::Motion, offset, payload));
            } else if let Some(group) = suggested_motion.filter(|g| capabilities.supports_motion(g)) {
                cues.push(Cue::new(
                    CueKind::Motion,
                    offset,
                    json!({ "group": group, "index": 0 }),
                ));
            }

            if let (Some((descriptor, _)), Some(ms)) = (voice, voice_ms) {
                let mut cue = Cue::new(
                    CueKind::Voice,
                    offset,
                    json!({ "resource": descriptor.to_value() }),
                );
                cue.duration = Some(ms);
                cue.resource_ref = Some(descriptor.rid);
                cues.push(cue);
            }

            offset = offset.saturating_add(length);
        }

        // Each expression holds until the next one, the last until the end
        for (n, &at) in expression_starts.iter().enumerate() {
            let end = expression_starts
                .get(n + 1)
                .map_or(offset, |&next| cues[next].start_offset);
            cues[at].duration = Some(end - cues[at].start_offset);
        }

        PerformanceSequence { cues, interrupt }
    }

    fn pick_expression(&self, segment: &Segment, reply: &BackendReply) -> (String, Option<String>) {
        if let Some(name) = segment.emotion.clone().or_else(|| reply.emotion.clone()) {
            let motion = self.policy.motion_for(&name);
            return (name, motion);
        }
        if self.config.auto_emotion && !segment.text.is_empty() {
            let score = self.policy.classify(&segment.text);
            return (score.expression, score.motion);
        }
        (NEUTRAL_EXPRESSION.to_string(), None)
    }

    /// Register or retain a clip's resource and resolve it
    ///
    /// On failure any reference taken here is given back.
    async fn resolve_voice(
        &self,
        clip: &VoiceClip,
        owner: Option<&ClientId>,
    ) -> Option<(ResourceDescriptor, Option<u64>)> {
        let rid = match &clip.source {
            MediaSource::Resource(rid) => match self.resources.retain(rid) {
                Ok(_) => rid.clone(),
                Err(e) => {
                    tracing::warn!(rid = %rid, error = %e, "Dropping voice cue");
                    return None;
                }
            },
            MediaSource::Bytes { data, mime } => {
                let registered = self
                    .resources
                    .register(
                        ResourceSource::Bytes(data.clone()),
                        ResourceKind::Audio,
                        Some(mime.clone()),
                        owner.cloned(),
                    )
                    .await;
                match registered {
                    Ok(rid) => rid,
                    Err(e) => {
                        tracing::warn!(error = %e, "Dropping voice cue");
                        return None;
                    }
                }
            }
            MediaSource::Path(path) => {
                let registered = self
                    .resources
                    .register(
                        ResourceSource::Path(path.clone()),
                        ResourceKind::Audio,
                        None,
                        owner.cloned(),
                    )
                    .await;
                match registered {
                    Ok(rid) => rid,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Dropping voice cue");
                        return None;
                    }
                }
            }
        };

        match self.resources.resolve(&rid) {
            Ok(descriptor) => Some((descriptor, clip.duration_ms)),
            Err(e) => {
                tracing::warn!(rid = %rid, error = %e, "Dropping voice cue");
                let _ = self.resources.release(&rid);
                None
            }
        }
    }
}

fn push_segment(segments: &mut Vec<String>, raw: &str) {
    let trimmed = raw.trim();
    if !trimmed.is_empty() {
        segments.push(trimmed.to_string());
    }
}
