//! Conversation, message, and per-message extras types for Companion.
//!
//! A conversation is keyed by the (agent, user) pair and owns a gapless,
//! strictly increasing sequence of messages. Assistant messages start as an
//! empty placeholder and are completed in place once generation settles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use std::fmt;
use std::str::FromStr;

pub use crate::llm::MessageRole;

use crate::emotion::EmotionMetadata;
use crate::speech::{SpeechPayload, SpeechPreferences, SpeechStatus};

/// Lifecycle status of a conversation.
///
/// Maps to the CHECK constraint in the SQLite schema:
/// `CHECK (status IN ('active', 'archived', 'ended'))`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    #[default]
    Active,
    Archived,
    Ended,
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationStatus::Active => write!(f, "active"),
            ConversationStatus::Archived => write!(f, "archived"),
            ConversationStatus::Ended => write!(f, "ended"),
        }
    }
}

impl FromStr for ConversationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(ConversationStatus::Active),
            "archived" => Ok(ConversationStatus::Archived),
            "ended" => Ok(ConversationStatus::Ended),
            other => Err(format!("invalid conversation status: '{other}'")),
        }
    }
}

/// A conversation between one user and one agent persona.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub user_id: Uuid,
    pub status: ConversationStatus,
    pub title: Option<String>,
    /// Rolling memory summary of older turns.
    pub summary: Option<String>,
    pub summary_updated_at: Option<DateTime<Utc>>,
    /// Highest message `seq` the stored summary covers.
    pub summary_through_seq: Option<i64>,
    pub token_input_sum: i64,
    pub token_output_sum: i64,
    pub started_at: DateTime<Utc>,
    pub last_msg_at: DateTime<Utc>,
}

impl Conversation {
    /// A fresh, active conversation for the (agent, user) pair.
    pub fn new(agent_id: Uuid, user_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            agent_id,
            user_id,
            status: ConversationStatus::Active,
            title: None,
            summary: None,
            summary_updated_at: None,
            summary_through_seq: None,
            token_input_sum: 0,
            token_output_sum: 0,
            started_at: now,
            last_msg_at: now,
        }
    }

    pub fn has_summary(&self) -> bool {
        self.summary.as_deref().is_some_and(|s| !s.trim().is_empty())
    }
}

/// A single persisted message within a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub seq: i64,
    pub role: MessageRole,
    pub content: String,
    pub parent_message_id: Option<Uuid>,
    pub latency_ms: Option<i64>,
    pub token_input: Option<i64>,
    pub token_output: Option<i64>,
    pub err_code: Option<String>,
    pub err_msg: Option<String>,
    #[serde(default)]
    pub extras: MessageExtras,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for appending a message. The store assigns `id`, `seq` and timestamps.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    pub parent_message_id: Option<Uuid>,
    pub extras: MessageExtras,
}

impl NewMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            parent_message_id: None,
            extras: MessageExtras::default(),
        }
    }

    /// An empty assistant placeholder replying to `parent`.
    pub fn assistant_placeholder(parent: Uuid) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: String::new(),
            parent_message_id: Some(parent),
            extras: MessageExtras::default(),
        }
    }
}

/// Final column values written when an assistant message settles.
#[derive(Debug, Clone, Default)]
pub struct MessageCompletion {
    pub content: String,
    pub latency_ms: Option<i64>,
    pub token_input: Option<i64>,
    pub token_output: Option<i64>,
    pub err_code: Option<String>,
    pub err_msg: Option<String>,
}

/// Schema-less JSON object stored alongside a message.
///
/// Different steps of a turn (emotion inference, preference capture, speech
/// synthesis) each own a key. Writers always merge a partial document into
/// the stored one rather than replacing it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageExtras(Map<String, Value>);

impl MessageExtras {
    pub const EMOTION: &'static str = "emotion";
    pub const SPEECH_PREFERENCES: &'static str = "speech_preferences";
    pub const SPEECH_STATUS: &'static str = "speech_status";
    pub const SPEECH: &'static str = "speech";
    pub const SPEECH_ERROR: &'static str = "speech_error";

    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a stored JSON text column. Anything that is not an object is
    /// treated as empty.
    pub fn from_json_str(raw: &str) -> Self {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Self(map),
            _ => Self::default(),
        }
    }

    pub fn to_json_string(&self) -> String {
        Value::Object(self.0.clone()).to_string()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Overlay every key of `other` onto `self`. Keys absent from `other`
    /// are preserved.
    pub fn merge(&mut self, other: &MessageExtras) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    pub fn with_emotion(mut self, emotion: &EmotionMetadata) -> Self {
        if let Ok(v) = serde_json::to_value(emotion) {
            self.insert(Self::EMOTION, v);
        }
        self
    }

    pub fn with_speech_preferences(mut self, prefs: &SpeechPreferences) -> Self {
        if let Ok(v) = serde_json::to_value(prefs) {
            self.insert(Self::SPEECH_PREFERENCES, v);
        }
        self
    }

    pub fn with_speech_status(mut self, status: SpeechStatus) -> Self {
        self.insert(Self::SPEECH_STATUS, Value::String(status.to_string()));
        self
    }

    /// Record a successful synthesis result. Clears any earlier error.
    pub fn with_speech_payload(mut self, payload: &SpeechPayload) -> Self {
        if let Ok(v) = serde_json::to_value(payload) {
            self.insert(Self::SPEECH, v);
        }
        self.insert(Self::SPEECH_ERROR, Value::Null);
        self.with_speech_status(SpeechStatus::Completed)
    }

    pub fn with_speech_error(mut self, error: impl Into<String>) -> Self {
        self.insert(Self::SPEECH_ERROR, Value::String(error.into()));
        self.with_speech_status(SpeechStatus::Error)
    }

    pub fn speech_status(&self) -> Option<SpeechStatus> {
        self.get(Self::SPEECH_STATUS)
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for MessageExtras {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Per (agent, user) long-lived memory row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserAgentMemory {
    pub agent_id: Uuid,
    pub user_id: Uuid,
    /// Free-form preference document (voice id/provider/speed/pitch/emotion).
    pub preferences: Map<String, Value>,
    pub profile_summary: Option<String>,
    pub last_task: Option<String>,
}

impl UserAgentMemory {
    pub fn empty(agent_id: Uuid, user_id: Uuid) -> Self {
        Self {
            agent_id,
            user_id,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.preferences.is_empty()
            && self.profile_summary.as_deref().is_none_or(|s| s.trim().is_empty())
            && self.last_task.as_deref().is_none_or(|s| s.trim().is_empty())
    }
}
