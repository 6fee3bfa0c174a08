//! Background speech work: the streaming chunk relay and detached batch
//! synthesis.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use companion_types::chat::MessageExtras;
use companion_types::event::{SpeechStreamChunk, TurnEvent};
use companion_types::speech::{SpeechError, SpeechParams, SpeechPayload, SynthesizedAudio};

use crate::chat::repository::ChatRepository;
use crate::speech::box_provider::BoxSpeechProvider;
use crate::speech::session::ChunkReceiver;

use super::events::{EventSink, EventWriter};

/// Forward audio chunks to the client as they arrive and accumulate the
/// full audio. Resolves once the back-end closes the chunk queue.
///
/// Zero bytes of audio is a failure.
pub fn spawn_speech_relay<S: EventSink>(
    writer: EventWriter<S>,
    message_id: Uuid,
    mut chunks: ChunkReceiver,
    cancel: CancellationToken,
) -> JoinHandle<Result<Vec<u8>, SpeechError>> {
    tokio::spawn(async move {
        let mut audio = Vec::new();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(SpeechError::SessionClosed),
                next = chunks.recv() => next,
            };
            match next {
                None => break,
                Some(Ok(chunk)) => {
                    let event = TurnEvent::SpeechStreamChunk(SpeechStreamChunk {
                        id: message_id,
                        sequence: chunk.sequence,
                        audio_base64: STANDARD.encode(&chunk.data),
                    });
                    audio.extend_from_slice(&chunk.data);
                    writer.emit(event).await;
                }
                Some(Err(e)) => return Err(e),
            }
        }
        if audio.is_empty() {
            return Err(SpeechError::Empty);
        }
        debug!(%message_id, bytes = audio.len(), "speech relay finished");
        Ok(audio)
    })
}

/// Timeouts for detached synthesis.
#[derive(Debug, Clone, Copy)]
pub struct AsyncSpeechBudget {
    pub synthesis: Duration,
    pub persist: Duration,
}

/// Run batch synthesis outside the request and merge the outcome into the
/// message's extras. Never fails; the outcome is only observable in the store.
pub fn spawn_async_synthesis<C: ChatRepository + 'static>(
    chat: Arc<C>,
    speech: Arc<BoxSpeechProvider>,
    message_id: Uuid,
    text: String,
    params: SpeechParams,
    budget: AsyncSpeechBudget,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let outcome = tokio::time::timeout(budget.synthesis, speech.synthesize(&text, &params))
            .await
            .unwrap_or_else(|_| Err(SpeechError::Timeout(budget.synthesis.as_secs())));
        let patch = match outcome.and_then(|audio| speech_payload(audio, &params)) {
            Ok(payload) => {
                info!(%message_id, bytes = payload.byte_len, "async speech synthesized");
                MessageExtras::new().with_speech_payload(&payload)
            }
            Err(e) => {
                warn!(%message_id, error = %e, "async speech failed");
                MessageExtras::new().with_speech_error(e.to_string())
            }
        };
        match tokio::time::timeout(budget.persist, chat.merge_message_extras(&message_id, &patch))
            .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(%message_id, error = %e, "failed to persist async speech result"),
            Err(_) => warn!(%message_id, "timed out persisting async speech result"),
        }
    })
}

/// Encode synthesized audio for extras and events.
pub fn speech_payload(
    audio: SynthesizedAudio,
    params: &SpeechParams,
) -> Result<SpeechPayload, SpeechError> {
    if audio.audio.is_empty() {
        return Err(SpeechError::Empty);
    }
    Ok(SpeechPayload {
        byte_len: audio.audio.len(),
        audio_base64: STANDARD.encode(&audio.audio),
        format: audio.format,
        sample_rate: audio.sample_rate,
        voice_id: audio.voice_id,
        provider: audio.provider,
        speed: params.speed,
        pitch: params.pitch,
        emotion: params.emotion.clone(),
    })
}
