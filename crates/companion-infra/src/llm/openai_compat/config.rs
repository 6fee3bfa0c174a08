//! Connection settings for OpenAI-compatible chat endpoints.

use secrecy::SecretString;

use companion_types::llm::ProviderCapabilities;

/// Default OpenAI API base.
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Configuration for an [`super::OpenAiCompatibleProvider`].
pub struct OpenAiCompatConfig {
    /// Provider name reported in spans and logs (e.g., "openai").
    pub provider_name: String,
    pub base_url: String,
    pub api_key: SecretString,
    /// Model used when a request leaves `model` empty.
    pub model: String,
    pub capabilities: ProviderCapabilities,
}

/// OpenAI defaults: 128K context, 16K output.
pub fn openai_defaults(api_key: &str, model: &str) -> OpenAiCompatConfig {
    OpenAiCompatConfig {
        provider_name: "openai".into(),
        base_url: OPENAI_BASE_URL.into(),
        api_key: SecretString::from(api_key.to_string()),
        model: model.into(),
        capabilities: ProviderCapabilities {
            streaming: true,
            max_context_tokens: 128_000,
            max_output_tokens: 16_384,
        },
    }
}

/// A self-hosted or third-party endpoint at `base_url`.
///
/// Capabilities are conservative since nothing is known about the server.
pub fn custom_endpoint(
    provider_name: &str,
    base_url: &str,
    api_key: &str,
    model: &str,
) -> OpenAiCompatConfig {
    OpenAiCompatConfig {
        provider_name: provider_name.into(),
        base_url: base_url.trim_end_matches('/').into(),
        api_key: SecretString::from(api_key.to_string()),
        model: model.into(),
        capabilities: ProviderCapabilities {
            streaming: true,
            max_context_tokens: 32_000,
            max_output_tokens: 4_096,
        },
    }
}
