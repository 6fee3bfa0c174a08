//! Emotion labels and per-turn emotion metadata.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The fixed label set produced by emotion inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmotionLabel {
    Neutral,
    Happy,
    Sad,
    Angry,
    Surprised,
    Confident,
    Gentle,
}

impl EmotionLabel {
    pub const ALL: [EmotionLabel; 7] = [
        EmotionLabel::Neutral,
        EmotionLabel::Happy,
        EmotionLabel::Sad,
        EmotionLabel::Angry,
        EmotionLabel::Surprised,
        EmotionLabel::Confident,
        EmotionLabel::Gentle,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EmotionLabel::Neutral => "neutral",
            EmotionLabel::Happy => "happy",
            EmotionLabel::Sad => "sad",
            EmotionLabel::Angry => "angry",
            EmotionLabel::Surprised => "surprised",
            EmotionLabel::Confident => "confident",
            EmotionLabel::Gentle => "gentle",
        }
    }
}

impl fmt::Display for EmotionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of heuristic emotion inference for one assistant reply.
///
/// `reasons` records which signals contributed so the label is explainable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionMetadata {
    pub label: EmotionLabel,
    /// In `[0.2, 1.0]`.
    pub intensity: f64,
    /// In `[0.2, 0.95]`.
    pub confidence: f64,
    /// Suggested avatar animation tag.
    pub motion: String,
    pub reasons: Vec<String>,
}
