//! Server-push events produced during a streaming turn.
//!
//! Each variant maps to one SSE event name; the payload is the variant's
//! inner value serialized as JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::chat::ChatMessage;
use crate::speech::{SpeechPayload, VoiceProvider};

/// Incremental assistant text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantDelta {
    pub id: Uuid,
    /// Full content accumulated so far.
    pub full: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechStreamStarted {
    pub id: Uuid,
    pub voice_id: String,
    pub provider: VoiceProvider,
    pub format: String,
    pub sample_rate: u32,
    pub speed: f64,
    pub pitch: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotion: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechStreamChunk {
    pub id: Uuid,
    pub sequence: u32,
    pub audio_base64: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechStreamCompleted {
    pub id: Uuid,
    #[serde(flatten)]
    pub speech: SpeechPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechStreamFailed {
    pub id: Uuid,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnErrorEvent {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnDone {
    pub id: Uuid,
}

/// One event on a turn's push stream.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    UserMessage(ChatMessage),
    AssistantPlaceholder(ChatMessage),
    AssistantDelta(AssistantDelta),
    SpeechStreamStarted(SpeechStreamStarted),
    SpeechStreamChunk(SpeechStreamChunk),
    SpeechStreamCompleted(SpeechStreamCompleted),
    SpeechStreamFailed(SpeechStreamFailed),
    AssistantMessage(ChatMessage),
    Error(TurnErrorEvent),
    Done(TurnDone),
}

impl TurnEvent {
    pub fn error(message: impl Into<String>) -> Self {
        TurnEvent::Error(TurnErrorEvent {
            error: message.into(),
        })
    }

    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            TurnEvent::UserMessage(_) => "user_message",
            TurnEvent::AssistantPlaceholder(_) => "assistant_placeholder",
            TurnEvent::AssistantDelta(_) => "assistant_delta",
            TurnEvent::SpeechStreamStarted(_) => "speech_stream_started",
            TurnEvent::SpeechStreamChunk(_) => "speech_stream_chunk",
            TurnEvent::SpeechStreamCompleted(_) => "speech_stream_completed",
            TurnEvent::SpeechStreamFailed(_) => "speech_stream_failed",
            TurnEvent::AssistantMessage(_) => "assistant_message",
            TurnEvent::Error(_) => "error",
            TurnEvent::Done(_) => "done",
        }
    }

    pub fn payload(&self) -> Value {
        let result = match self {
            TurnEvent::UserMessage(m)
            | TurnEvent::AssistantPlaceholder(m)
            | TurnEvent::AssistantMessage(m) => serde_json::to_value(m),
            TurnEvent::AssistantDelta(d) => serde_json::to_value(d),
            TurnEvent::SpeechStreamStarted(s) => serde_json::to_value(s),
            TurnEvent::SpeechStreamChunk(c) => serde_json::to_value(c),
            TurnEvent::SpeechStreamCompleted(c) => serde_json::to_value(c),
            TurnEvent::SpeechStreamFailed(f) => serde_json::to_value(f),
            TurnEvent::Error(e) => serde_json::to_value(e),
            TurnEvent::Done(d) => serde_json::to_value(d),
        };
        result.unwrap_or(Value::Null)
    }

    pub fn payload_json(&self) -> String {
        self.payload().to_string()
    }
}
