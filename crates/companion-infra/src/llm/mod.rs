//! Chat-completion provider implementations.
//!
//! Provides the OpenAI-compatible client and a factory ([`create_provider`])
//! that builds it from the `[llm]` configuration section.

pub mod openai_compat;

use companion_core::llm::box_provider::BoxLlmProvider;
use companion_observe::genai_attrs;
use companion_types::config::LlmConfig;
use companion_types::llm::{CompletionRequest, LlmError, Message};

use self::openai_compat::OpenAiCompatibleProvider;

/// Create a [`BoxLlmProvider`] from the `[llm]` section.
///
/// `provider = "openai"` without a `base_url` targets the public OpenAI API.
/// Any other name, or an explicit `base_url`, targets that endpoint.
///
/// # Errors
///
/// [`LlmError::AuthenticationFailed`] when no API key is available, and
/// [`LlmError::InvalidRequest`] for a non-OpenAI provider with no `base_url`.
pub fn create_provider(
    config: &LlmConfig,
    api_key: Option<&str>,
) -> Result<BoxLlmProvider, LlmError> {
    let key = api_key.ok_or(LlmError::AuthenticationFailed)?;

    let provider = match config.base_url.as_deref() {
        Some(base_url) => OpenAiCompatibleProvider::new(openai_compat::config::custom_endpoint(
            &config.provider,
            base_url,
            key,
            &config.model,
        )),
        None if config.provider == genai_attrs::PROVIDER_OPENAI => {
            OpenAiCompatibleProvider::openai(key, &config.model)
        }
        None => {
            return Err(LlmError::InvalidRequest(format!(
                "provider '{}' requires llm.base_url",
                config.provider
            )));
        }
    };

    tracing::info!(
        provider = %config.provider,
        model = %config.model,
        "chat-completion provider configured"
    );
    Ok(BoxLlmProvider::new(provider))
}

/// Send a minimal completion to verify the endpoint and key.
pub async fn test_provider_connection(provider: &BoxLlmProvider) -> Result<(), LlmError> {
    let request = CompletionRequest {
        model: String::new(),
        messages: vec![Message::user("Hello")],
        system: None,
        max_tokens: 10,
        temperature: Some(0.0),
        stream: false,
    };
    provider.complete(&request).await?;
    Ok(())
}
