//! Emotion tagging for reply segments
//!
//! Classification sits behind the [`EmotionPolicy`] trait so the scoring can
//! be swapped without touching the output converter. The default
//! [`KeywordEmotionPolicy`] counts case-insensitive keyword occurrences per
//! expression in an ordered table:
//!
//! - the highest score wins
//! - ties go to the entry declared first
//! - a score of zero yields [`NEUTRAL_EXPRESSION`]

use serde::{Deserialize, Serialize};

/// Expression used when nothing scores
pub const NEUTRAL_EXPRESSION: &str = "neutral";

/// One row of the expression table
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpressionEntry {
    /// Expression name sent to the client
    pub name: String,
    /// Lowercase keywords that vote for this expression
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Motion group suggested alongside this expression
    #[serde(default)]
    pub motion: Option<String>,
}

impl ExpressionEntry {
    /// Create an entry
    #[must_use]
    pub fn new(name: &str, keywords: &[&str], motion: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
            motion: motion.map(str::to_string),
        }
    }
}

/// Built-in expression table
#[must_use]
pub fn default_expressions() -> Vec<ExpressionEntry> {
    vec![
        ExpressionEntry::new(
            "happy",
            &["happy", "glad", "great", "love", "wonderful", "yay", "haha", "thanks", "excited", "😊", "开心"],
            Some("TapBody"),
        ),
        ExpressionEntry::new(
            "sad",
            &["sad", "sorry", "unfortunately", "miss", "cry", "lonely", "难过"],
            None,
        ),
        ExpressionEntry::new(
            "angry",
            &["angry", "annoyed", "furious", "hate", "stop it", "生气"],
            Some("Shake"),
        ),
        ExpressionEntry::new(
            "surprised",
            &["wow", "whoa", "really?", "amazing", "surprise", "incredible", "惊讶"],
            Some("Shake"),
        ),
        ExpressionEntry::new(
            "thinking",
            &["hmm", "think", "maybe", "perhaps", "let me see", "wonder"],
            None,
        ),
        ExpressionEntry::new(
            "shy",
            &["blush", "embarrass", "shy", "flatter", "害羞"],
            None,
        ),
    ]
}

/// Outcome of classifying one piece of text
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmotionScore {
    /// Winning expression
    pub expression: String,
    /// Its score; zero means nothing matched
    pub score: usize,
    /// Motion suggested by the table, if any
    pub motion: Option<String>,
}

impl EmotionScore {
    /// Neutral result
    #[must_use]
    pub fn neutral() -> Self {
        Self {
            expression: NEUTRAL_EXPRESSION.to_string(),
            score: 0,
            motion: None,
        }
    }
}

/// Replaceable emotion classifier
pub trait EmotionPolicy: Send + Sync {
    /// Pick an expression for `text`
    fn classify(&self, text: &str) -> EmotionScore;

    /// Motion suggested for a named expression
    fn motion_for(&self, expression: &str) -> Option<String>;
}

/// Keyword-counting classifier over an ordered expression table
#[derive(Clone, Debug)]
pub struct KeywordEmotionPolicy {
    table: Vec<ExpressionEntry>,
}

impl Default for KeywordEmotionPolicy {
    fn default() -> Self {
        Self::new(default_expressions())
    }
}

impl KeywordEmotionPolicy {
    /// Create from a table; order decides ties
    #[must_use]
    pub fn new(table: Vec<ExpressionEntry>) -> Self {
        Self { table }
    }

    /// The table in declaration order
    #[must_use]
    pub fn table(&self) -> &[ExpressionEntry] {
        &self.table
    }
}

impl EmotionPolicy for KeywordEmotionPolicy {
    fn classify(&self, text: &str) -> EmotionScore {
        let lowered = text.to_lowercase();
        let mut best: Option<(&ExpressionEntry, usize)> = None;

        for entry in &self.table {
            let score: usize = entry
                .keywords
                .iter()
                .filter(|k| !k.is_empty())
                .map(|k| lowered.matches(k.as_str()).count())
                .sum();
            // strict comparison keeps the earlier entry on ties
            if score > 0 && best.map_or(true, |(_, top)| score > top) {
                best = Some((entry, score));
            }
        }

        match best {
            Some((entry, score)) => EmotionScore {
                expression: entry.name.clone(),
                score,
                motion: entry.motion.clone(),
            },
            None => EmotionScore::neutral(),
        }
    }

    fn motion_for(&self, expression: &str) -> Option<String> {
        self.table
            .iter()
            .find(|e| e.name == expression)
            .and_then(|e| e.motion.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_reply() {
        let policy = KeywordEmotionPolicy::default();
        let score = policy.classify("I'm happy to help!");
        assert_eq!(score.expression, "happy");
        assert_eq!(score.score, 1);
        assert_eq!(score.motion.as_deref(), Some("TapBody"));
    }

    #[test]
    fn test_no_keywords_is_neutral() {
        let policy = KeywordEmotionPolicy::default();
        assert_eq!(policy.classify("The meeting is at noon."), EmotionScore::neutral());
    }

    #[test]
    fn test_tie_goes_to_first_declared() {
        let policy = KeywordEmotionPolicy::new(vec![
            ExpressionEntry::new("first", &["alpha"], None),
            ExpressionEntry::new("second", &["beta"], None),
        ]);
        assert_eq!(policy.classify("beta alpha").expression, "first");
        assert_eq!(policy.classify("beta beta alpha").expression, "second");
    }

    #[test]
    fn test_case_insensitive() {
        let policy = KeywordEmotionPolicy::default();
        assert_eq!(policy.classify("WOW that is AMAZING").expression, "surprised");
    }

    #[test]
    fn test_motion_for_expression() {
        let policy = KeywordEmotionPolicy::default();
        assert_eq!(policy.motion_for("angry").as_deref(), Some("Shake"));
        assert_eq!(policy.motion_for("sad"), None);
        assert_eq!(policy.motion_for("unknown"), None);
    }
}
