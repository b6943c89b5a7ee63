//! Hint tags embedded in backend reply text
//!
//! Backends can steer the performance inline with `[bridge:...]` tags:
//!
//! - `[bridge:emotion happy]` sets the expression for the enclosing segment
//! - `[bridge:motion TapBody]` requests a motion group for the segment
//! - `[bridge:interrupt]` asks the client to cut off whatever is playing
//!
//! Tags are removed from the spoken text. Anything else in brackets is left
//! untouched, including malformed `bridge:` tags.

/// Tag prefix inside brackets
const TAG_PREFIX: &str = "bridge:";

/// One parsed hint tag
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HintTag {
    /// Expression override
    Emotion(String),
    /// Motion group request
    Motion(String),
    /// Interrupt current playback
    Interrupt,
}

/// Strip hint tags from `text`
///
/// Returns the cleaned text (whitespace left by removed tags is collapsed)
/// and the tags in order of appearance.
#[must_use]
pub fn extract_tags(text: &str) -> (String, Vec<HintTag>) {
    let mut result = String::with_capacity(text.len());
    let mut tags = Vec::new();
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        if c != '[' {
            result.push(c);
            continue;
        }

        let mut tag_buf = String::new();
        let mut found_end = false;
        for inner in chars.by_ref() {
            if inner == ']' {
                found_end = true;
                break;
            }
            tag_buf.push(inner);
        }

        let parsed = if found_end {
            tag_buf.strip_prefix(TAG_PREFIX).and_then(parse_tag)
        } else {
            None
        };

        match parsed {
            Some(tag) => tags.push(tag),
            None => {
                result.push('[');
                result.push_str(&tag_buf);
                if found_end {
                    result.push(']');
                }
            }
        }
    }

    (collapse_whitespace(&result), tags)
}

/// Byte length of the `[bridge:...]` tag opening `text`, if one does
pub(crate) fn tag_span(text: &str) -> Option<usize> {
    let body = text.strip_prefix('[')?.strip_prefix(TAG_PREFIX)?;
    let end = body.find(|c: char| c == ']' || c == '\n')?;
    body[end..]
        .starts_with(']')
        .then_some(1 + TAG_PREFIX.len() + end + 1)
}

fn parse_tag(body: &str) -> Option<HintTag> {
    let parts: Vec<&str> = body.split_whitespace().collect();
    match parts.as_slice() {
        ["emotion", name] => Some(HintTag::Emotion((*name).to_string())),
        ["motion", group] => Some(HintTag::Motion((*group).to_string())),
        ["interrupt"] => Some(HintTag::Interrupt),
        _ => None,
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
