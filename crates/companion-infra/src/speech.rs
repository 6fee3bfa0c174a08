//! HTTP client for the speech gateway.
//!
//! The gateway fronts the actual TTS back-ends and exposes:
//!
//! - `GET  {endpoint}/v1/voices`: JSON list of [`VoiceInfo`]
//! - `POST {endpoint}/v1/speech`: batch synthesis, raw audio body
//! - `POST {endpoint}/v1/speech/stream`: chunked synthesis, audio streamed
//!   as the body arrives
//!
//! Incremental sessions buffer text until a sentence boundary, then stream
//! each sentence through the chunked endpoint. Chunks are numbered across
//! the whole session.

use std::sync::Arc;

use futures_util::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::{debug, warn};

use companion_core::speech::provider::SpeechProvider;
use companion_core::speech::session::{SpeechInput, SpeechSessionBackend, SpeechStreamHandle};
use companion_observe::genai_attrs;
use companion_types::config::SpeechConfig;
use companion_types::speech::{
    AudioChunk, SpeechError, SpeechParams, SynthesizedAudio, VoiceInfo, VoiceProvider,
};

const DEFAULT_FORMAT: &str = "mp3";

/// Speech provider backed by the HTTP speech gateway.
///
/// Does not derive Debug: it holds the gateway API key.
#[derive(Clone)]
pub struct HttpSpeechProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<Arc<SecretString>>,
    voices: Vec<VoiceInfo>,
    default_voice_id: Option<String>,
    streaming_providers: Vec<VoiceProvider>,
    sample_rate: u32,
    chunk_queue_capacity: usize,
}

#[derive(Debug, Serialize)]
struct SynthesisBody<'a> {
    text: &'a str,
    voice_id: &'a str,
    provider: VoiceProvider,
    speed: f64,
    pitch: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    emotion: Option<&'a str>,
    format: &'a str,
    sample_rate: u32,
}

impl HttpSpeechProvider {
    /// Build from the `[speech]` section. Requires an endpoint.
    pub fn from_config(config: &SpeechConfig) -> Result<Self, SpeechError> {
        let endpoint = config
            .endpoint
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| SpeechError::Provider("speech.endpoint is not configured".into()))?;

        let streaming_providers = config
            .streaming_providers
            .iter()
            .filter_map(|name| {
                let provider = VoiceProvider::canonicalize(name);
                if provider.is_none() {
                    warn!(provider = %name, "ignoring unknown streaming speech provider");
                }
                provider
            })
            .collect();

        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: config
                .api_key
                .clone()
                .filter(|k| !k.trim().is_empty())
                .map(|k| Arc::new(SecretString::from(k))),
            voices: config.voices.clone(),
            default_voice_id: config.default_voice_id.clone(),
            streaming_providers,
            sample_rate: config.sample_rate,
            chunk_queue_capacity: config.resolve_chunk_queue_capacity(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.endpoint)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key.expose_secret()),
            None => builder,
        }
    }

    /// Audio format of the voice, from the configured voice list.
    fn format_for(&self, voice_id: &str) -> String {
        self.voices
            .iter()
            .find(|v| v.id == voice_id)
            .map(|v| v.format.clone())
            .unwrap_or_else(|| DEFAULT_FORMAT.to_string())
    }

    async fn post_synthesis(
        &self,
        path: &str,
        text: &str,
        params: &SpeechParams,
        format: &str,
    ) -> Result<reqwest::Response, SpeechError> {
        let body = SynthesisBody {
            text,
            voice_id: &params.voice_id,
            provider: params.provider,
            speed: params.speed,
            pitch: params.pitch,
            emotion: params.emotion.as_deref(),
            format,
            sample_rate: self.sample_rate,
        };
        let response = self
            .authorized(self.client.post(self.url(path)))
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        ensure_success(response).await
    }
}

fn map_reqwest_error(err: reqwest::Error) -> SpeechError {
    SpeechError::Provider(err.to_string())
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, SpeechError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::UNPROCESSABLE_ENTITY
    {
        return Err(SpeechError::VoiceUnavailable(body));
    }
    Err(SpeechError::Provider(format!("gateway returned {status}: {body}")))
}

impl SpeechProvider for HttpSpeechProvider {
    fn name(&self) -> &str {
        "http_gateway"
    }

    async fn list_voices(&self) -> Result<Vec<VoiceInfo>, SpeechError> {
        if !self.voices.is_empty() {
            return Ok(self.voices.clone());
        }
        let response = self
            .authorized(self.client.get(self.url("/v1/voices")))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        ensure_success(response)
            .await?
            .json::<Vec<VoiceInfo>>()
            .await
            .map_err(|e| SpeechError::Provider(format!("invalid voice list: {e}")))
    }

    fn default_voice_id(&self) -> Option<String> {
        self.default_voice_id.clone()
    }

    fn supports_streaming(&self, provider: VoiceProvider) -> bool {
        self.streaming_providers.contains(&provider)
    }

    async fn synthesize(
        &self,
        text: &str,
        params: &SpeechParams,
    ) -> Result<SynthesizedAudio, SpeechError> {
        if text.trim().is_empty() {
            return Err(SpeechError::Empty);
        }
        let format = self.format_for(&params.voice_id);
        debug!(
            gen_ai.operation.name = genai_attrs::OP_SYNTHESIZE_SPEECH,
            voice_id = %params.voice_id,
            provider = %params.provider,
            chars = text.len(),
            "batch synthesis"
        );

        let audio = self
            .post_synthesis("/v1/speech", text, params, &format)
            .await?
            .bytes()
            .await
            .map_err(map_reqwest_error)?;
        if audio.is_empty() {
            return Err(SpeechError::Empty);
        }

        Ok(SynthesizedAudio {
            audio: audio.to_vec(),
            format,
            sample_rate: self.sample_rate,
            voice_id: params.voice_id.clone(),
            provider: params.provider,
        })
    }

    async fn open_stream(&self, params: &SpeechParams) -> Result<SpeechStreamHandle, SpeechError> {
        if !self.supports_streaming(params.provider) {
            return Err(SpeechError::StreamingUnsupported(params.provider));
        }
        let format = self.format_for(&params.voice_id);
        let (handle, backend) =
            SpeechStreamHandle::channel(self.chunk_queue_capacity, format.clone(), self.sample_rate);

        tokio::spawn(run_stream_session(
            self.clone(),
            params.clone(),
            format,
            backend,
        ));
        Ok(handle)
    }
}

/// Drive one incremental session until it is finalized or abandoned.
async fn run_stream_session(
    provider: HttpSpeechProvider,
    params: SpeechParams,
    format: String,
    mut backend: SpeechSessionBackend,
) {
    let mut buffer = String::new();
    let mut sequence: u32 = 0;

    loop {
        match backend.input.recv().await {
            Some(SpeechInput::Text(text)) => {
                buffer.push_str(&text);
                if let Some(end) = segment_end(&buffer) {
                    let segment: String = buffer.drain(..end).collect();
                    let sent = stream_segment(
                        &provider,
                        &params,
                        &format,
                        &segment,
                        &mut sequence,
                        &backend,
                    )
                    .await;
                    if !sent {
                        return;
                    }
                }
            }
            Some(SpeechInput::Finalize) => {
                if !buffer.trim().is_empty() {
                    stream_segment(&provider, &params, &format, &buffer, &mut sequence, &backend)
                        .await;
                }
                debug!(chunks = sequence, voice_id = %params.voice_id, "speech session finalized");
                return;
            }
            None => {
                debug!(chunks = sequence, "speech session abandoned");
                return;
            }
        }
    }
}

/// Synthesize one segment and forward its audio. Returns false when the
/// session should stop (gateway error or nobody listening).
async fn stream_segment(
    provider: &HttpSpeechProvider,
    params: &SpeechParams,
    format: &str,
    segment: &str,
    sequence: &mut u32,
    backend: &SpeechSessionBackend,
) -> bool {
    if segment.trim().is_empty() {
        return true;
    }
    let response = match provider
        .post_synthesis("/v1/speech/stream", segment, params, format)
        .await
    {
        Ok(r) => r,
        Err(e) => {
            let _ = backend.chunks.send(Err(e)).await;
            return false;
        }
    };

    let mut body = response.bytes_stream();
    while let Some(next) = body.next().await {
        let item = match next {
            Ok(bytes) if bytes.is_empty() => continue,
            Ok(bytes) => {
                let chunk = AudioChunk {
                    sequence: *sequence,
                    data: bytes.to_vec(),
                };
                *sequence += 1;
                Ok(chunk)
            }
            Err(e) => Err(map_reqwest_error(e)),
        };
        let failed = item.is_err();
        if backend.chunks.send(item).await.is_err() || failed {
            return false;
        }
    }
    true
}

/// Byte offset just past the last sentence boundary in `buffer`.
///
/// Latin terminators count only when followed by whitespace so decimals and
/// abbreviations mid-token do not split. Newlines and CJK terminators always
/// count.
fn segment_end(buffer: &str) -> Option<usize> {
    let mut end = None;
    let mut chars = buffer.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        let after = i + c.len_utf8();
        match c {
            '\n' | '。' | '！' | '？' => end = Some(after),
            '.' | '!' | '?' | ';' => {
                if chars.peek().is_some_and(|(_, next)| next.is_whitespace()) {
                    end = Some(after);
                }
            }
            _ => {}
        }
    }
    end.filter(|&e| !buffer[..e].trim().is_empty())
}
