//! BoxSpeechProvider -- object-safe dynamic dispatch wrapper for SpeechProvider.

use std::future::Future;
use std::pin::Pin;

use companion_types::speech::{
    SpeechError, SpeechParams, SynthesizedAudio, VoiceInfo, VoiceProvider,
};

use super::provider::SpeechProvider;
use super::session::SpeechStreamHandle;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait SpeechProviderDyn: Send + Sync {
    fn name(&self) -> &str;

    fn list_voices_boxed(&self) -> BoxFuture<'_, Result<Vec<VoiceInfo>, SpeechError>>;

    fn default_voice_id(&self) -> Option<String>;

    fn supports_streaming(&self, provider: VoiceProvider) -> bool;

    fn synthesize_boxed<'a>(
        &'a self,
        text: &'a str,
        params: &'a SpeechParams,
    ) -> BoxFuture<'a, Result<SynthesizedAudio, SpeechError>>;

    fn open_stream_boxed<'a>(
        &'a self,
        params: &'a SpeechParams,
    ) -> BoxFuture<'a, Result<SpeechStreamHandle, SpeechError>>;
}

impl<T: SpeechProvider> SpeechProviderDyn for T {
    fn name(&self) -> &str {
        SpeechProvider::name(self)
    }

    fn list_voices_boxed(&self) -> BoxFuture<'_, Result<Vec<VoiceInfo>, SpeechError>> {
        Box::pin(self.list_voices())
    }

    fn default_voice_id(&self) -> Option<String> {
        SpeechProvider::default_voice_id(self)
    }

    fn supports_streaming(&self, provider: VoiceProvider) -> bool {
        SpeechProvider::supports_streaming(self, provider)
    }

    fn synthesize_boxed<'a>(
        &'a self,
        text: &'a str,
        params: &'a SpeechParams,
    ) -> BoxFuture<'a, Result<SynthesizedAudio, SpeechError>> {
        Box::pin(self.synthesize(text, params))
    }

    fn open_stream_boxed<'a>(
        &'a self,
        params: &'a SpeechParams,
    ) -> BoxFuture<'a, Result<SpeechStreamHandle, SpeechError>> {
        Box::pin(self.open_stream(params))
    }
}

/// Type-erased speech provider.
pub struct BoxSpeechProvider {
    inner: Box<dyn SpeechProviderDyn + Send + Sync>,
}

impl BoxSpeechProvider {
    pub fn new<T: SpeechProvider + 'static>(provider: T) -> Self {
        Self {
            inner: Box::new(provider),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn list_voices(&self) -> Result<Vec<VoiceInfo>, SpeechError> {
        self.inner.list_voices_boxed().await
    }

    pub fn default_voice_id(&self) -> Option<String> {
        self.inner.default_voice_id()
    }

    pub fn supports_streaming(&self, provider: VoiceProvider) -> bool {
        self.inner.supports_streaming(provider)
    }

    pub async fn synthesize(
        &self,
        text: &str,
        params: &SpeechParams,
    ) -> Result<SynthesizedAudio, SpeechError> {
        self.inner.synthesize_boxed(text, params).await
    }

    pub async fn open_stream(
        &self,
        params: &SpeechParams,
    ) -> Result<SpeechStreamHandle, SpeechError> {
        self.inner.open_stream_boxed(params).await
    }
}
