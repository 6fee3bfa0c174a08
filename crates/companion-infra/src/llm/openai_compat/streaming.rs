//! OpenAI SSE stream to [`StreamEvent`] adapter.
//!
//! Maps `async-openai`'s [`ChatCompletionResponseStream`] chunks to the
//! provider-agnostic [`StreamEvent`] enum defined in `companion-types`.

use futures_util::StreamExt;

use async_openai::types::chat::{ChatCompletionResponseStream, FinishReason};

use companion_core::llm::provider::LlmEventStream;
use companion_types::llm::{LlmError, StopReason, StreamEvent, Usage};

/// Map an OpenAI finish reason onto a [`StopReason`].
///
/// Tool and function calls are never requested, so they read as a normal end.
pub(crate) fn map_finish_reason(reason: &FinishReason) -> StopReason {
    match reason {
        FinishReason::Stop => StopReason::EndTurn,
        FinishReason::Length => StopReason::MaxTokens,
        FinishReason::ContentFilter => StopReason::ContentFilter,
        FinishReason::ToolCalls | FinishReason::FunctionCall => StopReason::EndTurn,
    }
}

/// Map an async-openai stream to a stream of [`StreamEvent`]s.
///
/// Emits `Connected` first, then `TextDelta`s in arrival order, a
/// `MessageDelta` when a finish reason appears, `Usage` from the final chunk
/// (requires `stream_options.include_usage`) and `Done` at the end.
pub fn map_openai_stream(stream: ChatCompletionResponseStream) -> LlmEventStream {
    Box::pin(async_stream::try_stream! {
        yield StreamEvent::Connected;

        let mut stream = stream;
        while let Some(result) = stream.next().await {
            let chunk = result.map_err(|e| LlmError::Stream(e.to_string()))?;

            if let Some(usage) = chunk.usage.as_ref() {
                yield StreamEvent::Usage(Usage {
                    input_tokens: usage.prompt_tokens,
                    output_tokens: usage.completion_tokens,
                });
            }

            for choice in &chunk.choices {
                if let Some(text) = choice.delta.content.as_ref() {
                    if !text.is_empty() {
                        yield StreamEvent::TextDelta { text: text.clone() };
                    }
                }
                if let Some(reason) = choice.finish_reason.as_ref() {
                    yield StreamEvent::MessageDelta {
                        stop_reason: map_finish_reason(reason),
                    };
                }
            }
        }

        yield StreamEvent::Done;
    })
}
