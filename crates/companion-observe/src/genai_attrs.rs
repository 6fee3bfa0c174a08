//! OpenTelemetry GenAI semantic-convention attribute names and values.
//!
//! Field names are used literally in `tracing::info_span!` calls (dotted
//! identifiers); the constants here document them and supply the value
//! strings for operation and provider names.

/// The name of the operation being performed (e.g., "chat").
pub const GEN_AI_OPERATION_NAME: &str = "gen_ai.operation.name";

/// The name of the GenAI provider (e.g., "openai").
pub const GEN_AI_PROVIDER_NAME: &str = "gen_ai.provider.name";

/// The model ID requested.
pub const GEN_AI_REQUEST_MODEL: &str = "gen_ai.request.model";

pub const GEN_AI_REQUEST_TEMPERATURE: &str = "gen_ai.request.temperature";

pub const GEN_AI_REQUEST_MAX_TOKENS: &str = "gen_ai.request.max_tokens";

pub const GEN_AI_USAGE_INPUT_TOKENS: &str = "gen_ai.usage.input_tokens";

pub const GEN_AI_USAGE_OUTPUT_TOKENS: &str = "gen_ai.usage.output_tokens";

/// The finish reason of the response (e.g., "end_turn", "max_tokens").
pub const GEN_AI_RESPONSE_FINISH_REASONS: &str = "gen_ai.response.finish_reasons";

pub const GEN_AI_RESPONSE_ID: &str = "gen_ai.response.id";

/// The persona answering (agent_id).
pub const GEN_AI_AGENT_ID: &str = "gen_ai.agent.id";

// --- Operation name values ---

/// Standard chat completion operation.
pub const OP_CHAT: &str = "chat";

/// Streaming chat completion.
pub const OP_CHAT_STREAM: &str = "chat_stream";

/// Rolling conversation summary refresh.
pub const OP_SUMMARIZE_CONTEXT: &str = "summarize_context";

/// Text-to-speech synthesis.
pub const OP_SYNTHESIZE_SPEECH: &str = "synthesize_speech";

// --- Provider name values ---

pub const PROVIDER_OPENAI: &str = "openai";

/// Any endpoint speaking the OpenAI chat completions protocol.
pub const PROVIDER_OPENAI_COMPATIBLE: &str = "openai_compatible";
