//! Agent persona and per-persona chat configuration.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A configurable AI persona the user talks to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub system_prompt_override: Option<String>,
    /// Language the persona answers in unless told otherwise.
    pub language_default: Option<String>,
    /// Guidance used only until the persona has replied once.
    pub first_turn_hint: Option<String>,
    pub voice_id: Option<String>,
    pub voice_provider: Option<String>,
}

/// Optional per-persona overrides for generation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonaChatConfig {
    pub agent_id: Uuid,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    /// Wins over the persona's own `system_prompt_override`.
    pub system_prompt: Option<String>,
    /// Guidance included on every turn.
    pub conversation_hint: Option<String>,
    pub language: Option<String>,
}
