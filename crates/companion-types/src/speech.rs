//! Speech synthesis value types: voices, preferences, selections and results.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// The synthesis back-ends a voice can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceProvider {
    Azure,
    ElevenLabs,
}

impl VoiceProvider {
    /// Fold a free-form provider name into a canonical back-end.
    ///
    /// Case-insensitive; `-` and spaces are treated as `_`.
    pub fn canonicalize(raw: &str) -> Option<Self> {
        let folded = raw.trim().to_lowercase().replace(['-', ' '], "_");
        match folded.as_str() {
            "azure" | "ms" | "microsoft" | "azure_tts" => Some(VoiceProvider::Azure),
            "elevenlabs" | "11labs" | "eleven" | "eleven_labs" => Some(VoiceProvider::ElevenLabs),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VoiceProvider::Azure => "azure",
            VoiceProvider::ElevenLabs => "elevenlabs",
        }
    }
}

impl fmt::Display for VoiceProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VoiceProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VoiceProvider::canonicalize(s).ok_or_else(|| format!("invalid voice provider: '{s}'"))
    }
}

/// A voice exposed by the speech collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceInfo {
    pub id: String,
    pub provider: VoiceProvider,
    /// Audio container/codec, e.g. `mp3` or `pcm`.
    pub format: String,
}

/// Speech preferences supplied with a turn or remembered per (agent, user).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeechPreferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pitch: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

impl SpeechPreferences {
    pub fn is_empty(&self) -> bool {
        self.voice_id.is_none()
            && self.provider.is_none()
            && self.speed.is_none()
            && self.pitch.is_none()
            && self.emotion.is_none()
    }

    /// Read preferences back out of a stored preference document.
    pub fn from_map(map: &Map<String, Value>) -> Self {
        serde_json::from_value(Value::Object(map.clone())).unwrap_or_default()
    }

    /// Fill any unset field from `fallback`.
    pub fn or(self, fallback: &SpeechPreferences) -> Self {
        Self {
            voice_id: self.voice_id.or_else(|| fallback.voice_id.clone()),
            provider: self.provider.or_else(|| fallback.provider.clone()),
            speed: self.speed.or(fallback.speed),
            pitch: self.pitch.or(fallback.pitch),
            emotion: self.emotion.or_else(|| fallback.emotion.clone()),
            enabled: self.enabled.or(fallback.enabled),
        }
    }
}

/// A voice settled on for one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceSelection {
    pub voice_id: String,
    pub provider: VoiceProvider,
    pub format: String,
}

/// Fully resolved synthesis parameters for one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechParams {
    pub voice_id: String,
    pub provider: VoiceProvider,
    pub speed: f64,
    pub pitch: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotion: Option<String>,
}

/// Audio produced by a batch synthesis call.
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    pub audio: Vec<u8>,
    pub format: String,
    pub sample_rate: u32,
    pub voice_id: String,
    pub provider: VoiceProvider,
}

/// One chunk of incrementally synthesized audio.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Monotonic per-session sequence number starting at 0.
    pub sequence: u32,
    pub data: Vec<u8>,
}

/// Speech state recorded in message extras.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeechStatus {
    Pending,
    Streaming,
    Queued,
    Completed,
    Error,
}

impl fmt::Display for SpeechStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpeechStatus::Pending => write!(f, "pending"),
            SpeechStatus::Streaming => write!(f, "streaming"),
            SpeechStatus::Queued => write!(f, "queued"),
            SpeechStatus::Completed => write!(f, "completed"),
            SpeechStatus::Error => write!(f, "error"),
        }
    }
}

impl FromStr for SpeechStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(SpeechStatus::Pending),
            "streaming" => Ok(SpeechStatus::Streaming),
            "queued" => Ok(SpeechStatus::Queued),
            "completed" => Ok(SpeechStatus::Completed),
            "error" => Ok(SpeechStatus::Error),
            other => Err(format!("invalid speech status: '{other}'")),
        }
    }
}

/// Persisted and client-facing representation of synthesized audio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechPayload {
    pub audio_base64: String,
    pub format: String,
    pub sample_rate: u32,
    pub voice_id: String,
    pub provider: VoiceProvider,
    pub speed: f64,
    pub pitch: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotion: Option<String>,
    pub byte_len: usize,
}

/// Errors from speech synthesis operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SpeechError {
    #[error("speech provider error: {0}")]
    Provider(String),

    #[error("voice not available: {0}")]
    VoiceUnavailable(String),

    #[error("streaming synthesis not supported for provider '{0}'")]
    StreamingUnsupported(VoiceProvider),

    #[error("speech session closed")]
    SessionClosed,

    #[error("speech synthesis timed out after {0}s")]
    Timeout(u64),

    #[error("speech synthesis produced no audio")]
    Empty,
}
