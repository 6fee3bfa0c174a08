//! Voice selection and speech parameter sanitizing.
//!
//! Pure functions; no I/O.

use companion_types::speech::{
    SpeechParams, SpeechPreferences, VoiceInfo, VoiceProvider, VoiceSelection,
};

pub const SPEED_RANGE: (f64, f64) = (0.5, 1.6);
pub const PITCH_RANGE: (f64, f64) = (0.7, 1.4);

const DEFAULT_FORMAT: &str = "mp3";

/// Settle on a voice for this turn.
///
/// A candidate id that matches a listed voice wins, keeping the caller's
/// provider when it names a known back-end. Otherwise the default voice is
/// used, then the first listed voice. The provider always comes out
/// canonical.
pub fn resolve_voice_selection(
    candidate_id: Option<&str>,
    candidate_provider: Option<&str>,
    voices: &[VoiceInfo],
    default_voice: Option<&str>,
) -> Option<VoiceSelection> {
    let requested_provider = candidate_provider.and_then(VoiceProvider::canonicalize);

    let known = non_empty(candidate_id).and_then(|id| voices.iter().find(|v| v.id == id));
    if let Some(voice) = known {
        return Some(VoiceSelection {
            voice_id: voice.id.clone(),
            provider: requested_provider.unwrap_or(voice.provider),
            format: voice.format.clone(),
        });
    }

    if let Some(id) = non_empty(default_voice) {
        let listed = voices.iter().find(|v| v.id == id);
        let provider = listed
            .map(|v| v.provider)
            .or(requested_provider)
            .or_else(|| voices.first().map(|v| v.provider))
            .unwrap_or(VoiceProvider::Azure);
        return Some(VoiceSelection {
            voice_id: id.to_string(),
            provider,
            format: listed
                .map(|v| v.format.clone())
                .unwrap_or_else(|| DEFAULT_FORMAT.to_string()),
        });
    }

    voices.first().map(|v| VoiceSelection {
        voice_id: v.id.clone(),
        provider: v.provider,
        format: v.format.clone(),
    })
}

pub fn sanitize_speed(speed: Option<f64>) -> f64 {
    sanitize(speed, SPEED_RANGE)
}

pub fn sanitize_pitch(pitch: Option<f64>) -> f64 {
    sanitize(pitch, PITCH_RANGE)
}

fn sanitize(value: Option<f64>, (lo, hi): (f64, f64)) -> f64 {
    match value {
        Some(v) if v.is_finite() && v > 0.0 => v.clamp(lo, hi),
        _ => 1.0,
    }
}

/// Combine a settled voice with sanitized preferences.
pub fn speech_params(selection: &VoiceSelection, prefs: &SpeechPreferences) -> SpeechParams {
    SpeechParams {
        voice_id: selection.voice_id.clone(),
        provider: selection.provider,
        speed: sanitize_speed(prefs.speed),
        pitch: sanitize_pitch(prefs.pitch),
        emotion: prefs
            .emotion
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::to_lowercase),
    }
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}
