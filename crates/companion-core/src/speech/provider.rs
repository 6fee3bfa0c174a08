//! SpeechProvider trait definition.

use companion_types::speech::{
    SpeechError, SpeechParams, SynthesizedAudio, VoiceInfo, VoiceProvider,
};

use super::session::SpeechStreamHandle;

/// Trait for text-to-speech back-ends.
///
/// Batch synthesis is mandatory. Incremental synthesis is optional and
/// advertised per voice provider through [`supports_streaming`].
///
/// [`supports_streaming`]: SpeechProvider::supports_streaming
pub trait SpeechProvider: Send + Sync {
    fn name(&self) -> &str;

    fn list_voices(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<VoiceInfo>, SpeechError>> + Send;

    fn default_voice_id(&self) -> Option<String>;

    fn supports_streaming(&self, provider: VoiceProvider) -> bool;

    fn synthesize(
        &self,
        text: &str,
        params: &SpeechParams,
    ) -> impl std::future::Future<Output = Result<SynthesizedAudio, SpeechError>> + Send;

    /// Open an incremental synthesis session. Text is pushed with
    /// `append_text`, audio arrives on the handle's chunk receiver.
    fn open_stream(
        &self,
        params: &SpeechParams,
    ) -> impl std::future::Future<Output = Result<SpeechStreamHandle, SpeechError>> + Send;
}
