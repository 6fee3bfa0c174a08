//! Global configuration types for Companion.
//!
//! `CompanionConfig` represents the top-level `config.toml` in the data
//! directory. Every field has a default so an empty or partial file is valid.

use serde::{Deserialize, Serialize};

use crate::speech::VoiceInfo;

/// Lowest accepted `recent_message_limit`.
pub const MIN_RECENT_MESSAGES: usize = 2;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompanionConfig {
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub speech: SpeechConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

/// Context window and rolling-summary tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    #[serde(default = "default_recent_message_limit")]
    pub recent_message_limit: usize,
    /// Message count at which summarization starts.
    #[serde(default = "default_summary_trigger")]
    pub summary_trigger: i64,
    #[serde(default = "default_summary_window")]
    pub summary_window: usize,
    #[serde(default = "default_summary_max_chars")]
    pub summary_max_chars: usize,
}

fn default_recent_message_limit() -> usize {
    12
}

fn default_summary_trigger() -> i64 {
    6
}

fn default_summary_window() -> usize {
    40
}

fn default_summary_max_chars() -> usize {
    1200
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            recent_message_limit: default_recent_message_limit(),
            summary_trigger: default_summary_trigger(),
            summary_window: default_summary_window(),
            summary_max_chars: default_summary_max_chars(),
        }
    }
}

impl ConversationConfig {
    /// Recent-message limit with the minimum enforced.
    pub fn resolve_recent_limit(&self) -> usize {
        self.recent_message_limit.max(MIN_RECENT_MESSAGES)
    }

    /// Summary window, never smaller than twice the recent limit.
    pub fn resolve_summary_window(&self) -> usize {
        self.summary_window.max(2 * self.resolve_recent_limit())
    }

    pub fn resolve_summary_trigger(&self) -> i64 {
        self.summary_trigger.max(1)
    }

    pub fn resolve_summary_max_chars(&self) -> usize {
        self.summary_max_chars.max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_cache_ttl_secs() -> u64 {
    30
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

/// Speech collaborator settings.
///
/// Speech is considered disabled when `enabled` is false or no endpoint is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub default_voice_id: Option<String>,
    #[serde(default)]
    pub voices: Vec<VoiceInfo>,
    /// Providers whose endpoint supports chunked incremental synthesis.
    #[serde(default = "default_streaming_providers")]
    pub streaming_providers: Vec<String>,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_async_timeout_secs")]
    pub async_timeout_secs: u64,
    #[serde(default = "default_persist_timeout_secs")]
    pub persist_timeout_secs: u64,
    #[serde(default = "default_chunk_queue_capacity")]
    pub chunk_queue_capacity: usize,
}

fn default_streaming_providers() -> Vec<String> {
    vec!["elevenlabs".to_string()]
}

fn default_sample_rate() -> u32 {
    24_000
}

fn default_async_timeout_secs() -> u64 {
    45
}

fn default_persist_timeout_secs() -> u64 {
    5
}

fn default_chunk_queue_capacity() -> usize {
    32
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            api_key: None,
            default_voice_id: None,
            voices: Vec::new(),
            streaming_providers: default_streaming_providers(),
            sample_rate: default_sample_rate(),
            async_timeout_secs: default_async_timeout_secs(),
            persist_timeout_secs: default_persist_timeout_secs(),
            chunk_queue_capacity: default_chunk_queue_capacity(),
        }
    }
}

impl SpeechConfig {
    pub fn is_active(&self) -> bool {
        self.enabled && self.endpoint.as_deref().is_some_and(|e| !e.trim().is_empty())
    }

    /// Persistence must finish well inside the synthesis budget.
    pub fn resolve_persist_timeout_secs(&self) -> u64 {
        self.persist_timeout_secs
            .clamp(1, self.async_timeout_secs.max(2) - 1)
    }

    pub fn resolve_chunk_queue_capacity(&self) -> usize {
        self.chunk_queue_capacity.max(1)
    }
}

/// Chat-completion collaborator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_temperature")]
    pub temperature: f64,
    #[serde(default = "default_summary_max_tokens")]
    pub summary_max_tokens: u32,
}

fn default_llm_provider() -> String {
    "openai".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_llm_max_tokens() -> u32 {
    1024
}

fn default_llm_temperature() -> f64 {
    0.7
}

fn default_summary_max_tokens() -> u32 {
    512
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            base_url: None,
            api_key: None,
            model: default_llm_model(),
            max_tokens: default_llm_max_tokens(),
            temperature: default_llm_temperature(),
            summary_max_tokens: default_summary_max_tokens(),
        }
    }
}
