//! ConversationMemory -- rolling summaries and remembered preferences.
//!
//! Everything here is best-effort: failures are logged and absorbed, never
//! returned to the turn.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use companion_types::chat::{ChatMessage, Conversation, UserAgentMemory};
use companion_types::config::ConversationConfig;
use companion_types::llm::{CompletionRequest, Message};
use companion_types::speech::SpeechPreferences;

use crate::chat::repository::ChatRepository;
use crate::llm::box_provider::BoxLlmProvider;
use crate::memory::store::ProfileRepository;

/// System instruction for the summarization call.
pub(crate) const SUMMARY_SYSTEM_PROMPT: &str = r#"You maintain the long-term memory of an ongoing conversation between a user and an AI companion.
Update the summary using the transcript below. Preserve:
1. Facts the user shared about themselves
2. Preferences, plans and promises
3. Open questions or unfinished tasks

Write in third person, plain prose, no headings. Be concise."#;

/// Lines kept by the local fallback summary.
const FALLBACK_LINES: usize = 10;

/// Summary and profile access for the turn pipeline.
pub struct ConversationMemory<C: ChatRepository, P: ProfileRepository> {
    chat: Arc<C>,
    profiles: Arc<P>,
    llm: Arc<BoxLlmProvider>,
    config: ConversationConfig,
    model: String,
    max_tokens: u32,
}

impl<C: ChatRepository, P: ProfileRepository> ConversationMemory<C, P> {
    pub fn new(
        chat: Arc<C>,
        profiles: Arc<P>,
        llm: Arc<BoxLlmProvider>,
        config: ConversationConfig,
        model: impl Into<String>,
        max_tokens: u32,
    ) -> Self {
        Self {
            chat,
            profiles,
            llm,
            config,
            model: model.into(),
            max_tokens,
        }
    }

    /// Stored profile for (agent, user), empty when absent or unreadable.
    pub async fn load_profile(&self, agent_id: &Uuid, user_id: &Uuid) -> UserAgentMemory {
        match self.profiles.get_memory(agent_id, user_id).await {
            Ok(Some(memory)) => memory,
            Ok(None) => UserAgentMemory::empty(*agent_id, *user_id),
            Err(e) => {
                warn!(%agent_id, %user_id, error = %e, "profile load failed, using empty profile");
                UserAgentMemory::empty(*agent_id, *user_id)
            }
        }
    }

    /// Persist explicitly supplied speech preferences. Empty input is ignored.
    pub async fn remember_preferences(
        &self,
        agent_id: &Uuid,
        user_id: &Uuid,
        prefs: &SpeechPreferences,
    ) {
        if prefs.is_empty() {
            return;
        }
        let map = match serde_json::to_value(prefs) {
            Ok(Value::Object(map)) => map,
            _ => return,
        };
        if let Err(e) = self.profiles.upsert_preferences(agent_id, user_id, &map).await {
            warn!(%agent_id, %user_id, error = %e, "failed to remember speech preferences");
        }
    }

    /// Refresh the rolling summary when enough new messages have accumulated.
    ///
    /// Returns the new summary when one was written.
    #[tracing::instrument(name = "ensure_summary", skip_all, fields(conversation_id = %conversation_id))]
    pub async fn ensure_summary(&self, conversation_id: &Uuid) -> Option<String> {
        let conversation = match self.chat.get_conversation(conversation_id).await {
            Ok(Some(c)) => c,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "summary skipped: conversation load failed");
                return None;
            }
        };

        let count = match self.chat.count_messages(conversation_id).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "summary skipped: message count failed");
                return None;
            }
        };
        if count < self.config.resolve_summary_trigger() {
            return None;
        }

        let latest = match self.chat.latest_seq(conversation_id).await {
            Ok(Some(seq)) => seq,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "summary skipped: latest seq lookup failed");
                return None;
            }
        };
        if conversation
            .summary_through_seq
            .is_some_and(|through| latest <= through)
        {
            debug!(latest, "summary already covers latest message");
            return None;
        }

        let window = self.config.resolve_summary_window();
        let messages = match self.chat.recent_messages(&conversation, window).await {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "summary skipped: window load failed");
                return None;
            }
        };

        let transcript = build_transcript(&conversation, &messages);
        if transcript.is_empty() {
            return None;
        }

        let summary = match self.summarize(&transcript).await {
            Some(s) => s,
            None => local_summary(&transcript),
        };
        let summary = truncate_chars(summary.trim(), self.config.resolve_summary_max_chars());

        if let Err(e) = self.chat.save_summary(conversation_id, &summary, latest).await {
            warn!(error = %e, "failed to persist conversation summary");
            return None;
        }
        info!(through_seq = latest, chars = summary.chars().count(), "conversation summary updated");
        Some(summary)
    }

    async fn summarize(&self, transcript: &[String]) -> Option<String> {
        let request = CompletionRequest {
            model: self.model.clone(),
            messages: vec![Message::user(format!(
                "<transcript>\n{}\n</transcript>",
                transcript.join("\n")
            ))],
            system: Some(SUMMARY_SYSTEM_PROMPT.to_string()),
            max_tokens: self.max_tokens,
            temperature: Some(0.2),
            stream: false,
        };
        match self.llm.complete(&request).await {
            Ok(resp) if !resp.content.trim().is_empty() => Some(resp.content),
            Ok(_) => {
                warn!("summarizer returned empty content, using local fallback");
                None
            }
            Err(e) => {
                warn!(error = %e, "summarizer call failed, using local fallback");
                None
            }
        }
    }
}

/// Prior summary first, then one role-tagged line per turn.
fn build_transcript(conversation: &Conversation, messages: &[ChatMessage]) -> Vec<String> {
    let mut lines = Vec::with_capacity(messages.len() + 1);
    if let Some(prior) = conversation.summary.as_deref().filter(|s| !s.trim().is_empty()) {
        lines.push(format!("previous summary: {}", prior.trim()));
    }
    for m in messages {
        if !m.role.is_prompt_role() || m.content.trim().is_empty() {
            continue;
        }
        let flat = m.content.split_whitespace().collect::<Vec<_>>().join(" ");
        lines.push(format!("{}: {flat}", m.role));
    }
    lines
}

fn local_summary(transcript: &[String]) -> String {
    let skip = transcript.len().saturating_sub(FALLBACK_LINES);
    transcript[skip..].join("\n")
}

/// Truncate to at most `max` characters on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
