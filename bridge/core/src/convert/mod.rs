//! Conversion between the wire protocol and the backend
//!
//! ```text
//!  chat.input ──► InputConverter ──► NormalizedChatEvent ──► ChatBackend
//!                                                               │
//!  chat.perform ◄── PerformanceSequence ◄── OutputConverter ◄── BackendReply
//! ```

mod emotion;
mod hints;
mod input;
mod output;

pub use emotion::{
    default_expressions, EmotionPolicy, EmotionScore, ExpressionEntry, KeywordEmotionPolicy,
    NEUTRAL_EXPRESSION,
};
pub use hints::{extract_tags, HintTag};
pub(crate) use input::decode_inline;
pub use input::{
    AttachmentRef, ConvertedInput, InputConverter, InputSource, InputWarning, NormalizedChatEvent,
};
pub use output::{Cue, CueKind, OutputConfig, OutputConverter, PerformanceSequence};
