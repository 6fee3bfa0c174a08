//! Incremental speech session plumbing.
//!
//! A session is two bounded queues: text flows from the turn into the
//! synthesis back-end, audio chunks flow back out. The turn side holds a
//! [`SpeechStreamHandle`]; the back-end side holds a [`SpeechSessionBackend`].

use tokio::sync::mpsc;

use companion_types::speech::{AudioChunk, SpeechError};

/// Input pushed into a speech session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechInput {
    Text(String),
    /// No more text will follow; flush remaining audio and end the chunk stream.
    Finalize,
}

pub type ChunkReceiver = mpsc::Receiver<Result<AudioChunk, SpeechError>>;

/// Turn-side end of an open speech session.
#[derive(Debug)]
pub struct SpeechStreamHandle {
    input: Option<mpsc::Sender<SpeechInput>>,
    chunks: Option<ChunkReceiver>,
    pub format: String,
    pub sample_rate: u32,
}

/// Back-end end of an open speech session.
#[derive(Debug)]
pub struct SpeechSessionBackend {
    pub input: mpsc::Receiver<SpeechInput>,
    pub chunks: mpsc::Sender<Result<AudioChunk, SpeechError>>,
}

impl SpeechStreamHandle {
    /// Create a connected handle/backend pair.
    pub fn channel(
        capacity: usize,
        format: impl Into<String>,
        sample_rate: u32,
    ) -> (Self, SpeechSessionBackend) {
        let capacity = capacity.max(1);
        let (input_tx, input_rx) = mpsc::channel(capacity);
        let (chunk_tx, chunk_rx) = mpsc::channel(capacity);
        (
            Self {
                input: Some(input_tx),
                chunks: Some(chunk_rx),
                format: format.into(),
                sample_rate,
            },
            SpeechSessionBackend {
                input: input_rx,
                chunks: chunk_tx,
            },
        )
    }

    pub async fn append_text(&self, text: &str) -> Result<(), SpeechError> {
        let input = self.input.as_ref().ok_or(SpeechError::SessionClosed)?;
        input
            .send(SpeechInput::Text(text.to_string()))
            .await
            .map_err(|_| SpeechError::SessionClosed)
    }

    pub async fn finalize(&self) -> Result<(), SpeechError> {
        let input = self.input.as_ref().ok_or(SpeechError::SessionClosed)?;
        input
            .send(SpeechInput::Finalize)
            .await
            .map_err(|_| SpeechError::SessionClosed)
    }

    /// Take the chunk receiver. Returns `None` after the first call.
    pub fn take_chunks(&mut self) -> Option<ChunkReceiver> {
        self.chunks.take()
    }

    /// Drop the input side without finalizing. The back-end observes a
    /// closed input queue and abandons the session.
    pub fn close(&mut self) {
        self.input = None;
    }

    pub fn is_closed(&self) -> bool {
        self.input.as_ref().is_none_or(|tx| tx.is_closed())
    }
}
