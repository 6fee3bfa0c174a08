//! Prompt assembly for one conversation turn.
//!
//! The prompt is an ordered list of messages:
//! 1. System prompt (grounding, description, override, hint, language)
//! 2. Rolling memory summary, if any
//! 3. What is known about the user, if anything
//! 4. Relevant knowledge chunks, if a knowledge provider answered
//! 5. Recent history (system/user/assistant only), oldest first

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use companion_types::chat::{ChatMessage, Conversation, MessageRole, UserAgentMemory};
use companion_types::config::LlmConfig;
use companion_types::error::TurnError;
use companion_types::knowledge::KnowledgeChunk;
use companion_types::llm::{CompletionRequest, Message};
use companion_types::persona::{Persona, PersonaChatConfig};

use crate::chat::repository::ChatRepository;
use crate::knowledge::{BoxKnowledgeProvider, KNOWLEDGE_CHUNK_LIMIT};
use crate::memory::service::ConversationMemory;
use crate::memory::store::ProfileRepository;
use crate::persona::BoxPersonaProvider;

/// Everything the model call and the post-generation steps need.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub persona: Persona,
    pub chat_config: Option<PersonaChatConfig>,
    pub profile: UserAgentMemory,
    pub messages: Vec<Message>,
}

impl TurnContext {
    /// Completion request with chat-config overrides applied over `defaults`.
    pub fn completion_request(&self, defaults: &LlmConfig, stream: bool) -> CompletionRequest {
        let cfg = self.chat_config.as_ref();
        CompletionRequest {
            model: cfg
                .and_then(|c| non_empty(c.model.as_deref()))
                .unwrap_or(defaults.model.as_str())
                .to_string(),
            messages: self.messages.clone(),
            system: None,
            max_tokens: cfg
                .and_then(|c| c.max_tokens)
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_tokens),
            temperature: Some(cfg.and_then(|c| c.temperature).unwrap_or(defaults.temperature)),
            stream,
        }
    }
}

pub struct ContextBuilder<C: ChatRepository, P: ProfileRepository> {
    chat: Arc<C>,
    memory: Arc<ConversationMemory<C, P>>,
    personas: Arc<BoxPersonaProvider>,
    knowledge: Option<Arc<BoxKnowledgeProvider>>,
    recent_limit: usize,
}

impl<C: ChatRepository, P: ProfileRepository> ContextBuilder<C, P> {
    pub fn new(
        chat: Arc<C>,
        memory: Arc<ConversationMemory<C, P>>,
        personas: Arc<BoxPersonaProvider>,
        knowledge: Option<Arc<BoxKnowledgeProvider>>,
        recent_limit: usize,
    ) -> Self {
        Self {
            chat,
            memory,
            personas,
            knowledge,
            recent_limit,
        }
    }

    /// Assemble the prompt for the next reply in `conversation`.
    ///
    /// Persona load failure propagates. A missing or unreadable chat
    /// configuration is treated as absent.
    #[tracing::instrument(name = "build_context", skip_all, fields(conversation_id = %conversation.id))]
    pub async fn build(&self, conversation: &Conversation) -> Result<TurnContext, TurnError> {
        let persona = self.personas.get_persona(&conversation.agent_id).await?;
        let chat_config = match self.personas.get_chat_config(&conversation.agent_id).await {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(agent_id = %conversation.agent_id, error = %e, "chat config unavailable, ignoring");
                None
            }
        };
        let profile = self
            .memory
            .load_profile(&conversation.agent_id, &conversation.user_id)
            .await;
        let history = self
            .chat
            .recent_messages(conversation, self.recent_limit)
            .await?;
        let replied = self.chat.has_assistant_reply(&conversation.id).await?;

        let mut messages = vec![Message::system(system_prompt(
            &persona,
            chat_config.as_ref(),
            replied,
        ))];

        if let Some(summary) = conversation.summary.as_deref().filter(|s| !s.trim().is_empty()) {
            messages.push(Message::system(format!(
                "Summary of the conversation so far:\n{}",
                summary.trim()
            )));
        }

        if let Some(profile_msg) = profile_message(&profile) {
            messages.push(Message::system(profile_msg));
        }

        if let Some(knowledge_msg) = self.knowledge_message(conversation, &history).await {
            messages.push(Message::system(knowledge_msg));
        }

        messages.extend(
            history
                .iter()
                .filter(|m| m.role.is_prompt_role())
                .map(|m| Message {
                    role: m.role,
                    content: m.content.clone(),
                }),
        );

        debug!(prompt_messages = messages.len(), history = history.len(), "context built");
        Ok(TurnContext {
            persona,
            chat_config,
            profile,
            messages,
        })
    }

    async fn knowledge_message(
        &self,
        conversation: &Conversation,
        history: &[ChatMessage],
    ) -> Option<String> {
        let provider = self.knowledge.as_ref()?;
        let query = history
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User && !m.content.trim().is_empty())?;
        match provider
            .query_top_chunks(&conversation.agent_id, &query.content, KNOWLEDGE_CHUNK_LIMIT)
            .await
        {
            Ok(chunks) if !chunks.is_empty() => Some(knowledge_text(&chunks)),
            Ok(_) => None,
            Err(e) => {
                warn!(agent_id = %conversation.agent_id, error = %e, "knowledge lookup failed, continuing without it");
                None
            }
        }
    }
}

/// Concatenate the non-empty system prompt sections.
pub fn system_prompt(
    persona: &Persona,
    chat_config: Option<&PersonaChatConfig>,
    has_replied: bool,
) -> String {
    let mut sections: Vec<String> = Vec::with_capacity(5);
    sections.push(format!(
        "You are {}, an AI companion. Stay in character and speak as {} in every reply.",
        persona.name.trim(),
        persona.name.trim()
    ));

    if let Some(desc) = non_empty(Some(&persona.description)) {
        sections.push(desc.to_string());
    }

    let override_prompt = chat_config
        .and_then(|c| non_empty(c.system_prompt.as_deref()))
        .or_else(|| non_empty(persona.system_prompt_override.as_deref()));
    if let Some(p) = override_prompt {
        sections.push(p.to_string());
    }

    let hint = chat_config
        .and_then(|c| non_empty(c.conversation_hint.as_deref()))
        .or_else(|| {
            if has_replied {
                None
            } else {
                non_empty(persona.first_turn_hint.as_deref())
            }
        });
    if let Some(h) = hint {
        sections.push(h.to_string());
    }

    let language = chat_config
        .and_then(|c| non_empty(c.language.as_deref()))
        .or_else(|| non_empty(persona.language_default.as_deref()));
    if let Some(lang) = language {
        sections.push(format!("Always reply in {lang}."));
    }

    sections.join("\n\n")
}

/// Profile summary, sorted preferences and outstanding task.
pub fn profile_message(profile: &UserAgentMemory) -> Option<String> {
    let mut lines = Vec::new();
    if let Some(summary) = non_empty(profile.profile_summary.as_deref()) {
        lines.push(format!("About the user: {summary}"));
    }
    if !profile.preferences.is_empty() {
        let mut pairs: Vec<(&String, &Value)> = profile.preferences.iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(b.0));
        let rendered = pairs
            .into_iter()
            .map(|(k, v)| match v {
                Value::String(s) => format!("{k}={s}"),
                other => format!("{k}={other}"),
            })
            .collect::<Vec<_>>()
            .join(", ");
        lines.push(format!("User preferences: {rendered}"));
    }
    if let Some(task) = non_empty(profile.last_task.as_deref()) {
        lines.push(format!("Outstanding task: {task}"));
    }
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

fn knowledge_text(chunks: &[KnowledgeChunk]) -> String {
    let mut text = String::from("Relevant knowledge:");
    for chunk in chunks {
        text.push_str("\n- ");
        text.push_str(chunk.text.trim());
        if let Some(source) = non_empty(chunk.source.as_deref()) {
            text.push_str(&format!(" (source: {source})"));
        }
    }
    text
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}
