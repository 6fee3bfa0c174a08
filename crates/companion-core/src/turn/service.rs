//! TurnService -- entry point for conversation turns.
//!
//! Generic over the chat and profile repositories so any backend can be
//! plugged in (SQLite in production, in-memory in tests). Collaborators are
//! passed in once at startup and shared by every turn.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use companion_types::chat::{ChatMessage, Conversation, MessageExtras, MessageRole, NewMessage};
use companion_types::config::CompanionConfig;
use companion_types::emotion::EmotionMetadata;
use companion_types::error::TurnError;
use companion_types::speech::{SpeechParams, SpeechPreferences, SpeechStatus};

use crate::chat::context::{ContextBuilder, TurnContext};
use crate::chat::repository::ChatRepository;
use crate::emotion::infer_emotion;
use crate::knowledge::BoxKnowledgeProvider;
use crate::ledger::{BoxIdentityProvider, TokenLedger};
use crate::llm::box_provider::BoxLlmProvider;
use crate::memory::service::ConversationMemory;
use crate::memory::store::ProfileRepository;
use crate::persona::BoxPersonaProvider;
use crate::speech::box_provider::BoxSpeechProvider;
use crate::speech::preferences::{resolve_voice_selection, speech_params};

use super::speech_task::{AsyncSpeechBudget, spawn_async_synthesis};
use super::streaming::StreamingTurn;

/// Inbound message for one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRequest {
    pub agent_id: Uuid,
    pub user_id: Uuid,
    #[serde(default = "default_role")]
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub speech: SpeechPreferences,
}

fn default_role() -> MessageRole {
    MessageRole::User
}

impl TurnRequest {
    pub fn user(agent_id: Uuid, user_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            agent_id,
            user_id,
            role: MessageRole::User,
            content: content.into(),
            speech: SpeechPreferences::default(),
        }
    }

    fn validate(&self) -> Result<(), TurnError> {
        if self.agent_id.is_nil() {
            return Err(TurnError::Validation("agent_id is required".into()));
        }
        if self.user_id.is_nil() {
            return Err(TurnError::Validation("user_id is required".into()));
        }
        if self.content.trim().is_empty() {
            return Err(TurnError::Validation("content must not be empty".into()));
        }
        Ok(())
    }
}

/// Result of a non-streaming turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnReply {
    pub conversation_id: Uuid,
    pub agent_id: Uuid,
    pub user_id: Uuid,
    pub user_message: ChatMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_message: Option<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_balance: Option<i64>,
}

/// Collaborators wired once at startup.
pub struct TurnDeps<C: ChatRepository, P: ProfileRepository> {
    pub chat: Arc<C>,
    pub profiles: Arc<P>,
    pub llm: Arc<BoxLlmProvider>,
    pub personas: Arc<BoxPersonaProvider>,
    pub identity: Arc<BoxIdentityProvider>,
    pub speech: Option<Arc<BoxSpeechProvider>>,
    pub knowledge: Option<Arc<BoxKnowledgeProvider>>,
}

/// A persisted inbound message, ready for generation.
pub(crate) struct AcceptedTurn {
    pub conversation: Conversation,
    pub user_message: ChatMessage,
    pub starting_balance: i64,
    pub speech: SpeechPreferences,
}

/// Voice and parameters settled for one turn's speech.
#[derive(Debug, Clone)]
pub(crate) struct SpeechPlan {
    pub params: SpeechParams,
    pub format: String,
    pub streaming: bool,
}

impl SpeechPlan {
    /// Preferences as recorded in message extras.
    pub fn preferences(&self) -> SpeechPreferences {
        SpeechPreferences {
            voice_id: Some(self.params.voice_id.clone()),
            provider: Some(self.params.provider.to_string()),
            speed: Some(self.params.speed),
            pitch: Some(self.params.pitch),
            emotion: self.params.emotion.clone(),
            enabled: Some(true),
        }
    }
}

pub(crate) struct Inner<C: ChatRepository, P: ProfileRepository> {
    pub chat: Arc<C>,
    pub memory: Arc<ConversationMemory<C, P>>,
    pub context: ContextBuilder<C, P>,
    pub llm: Arc<BoxLlmProvider>,
    pub speech: Option<Arc<BoxSpeechProvider>>,
    pub ledger: TokenLedger,
    pub config: CompanionConfig,
}

/// Orchestrates streaming and non-streaming turns.
pub struct TurnService<C: ChatRepository, P: ProfileRepository> {
    pub(crate) inner: Arc<Inner<C, P>>,
}

impl<C: ChatRepository, P: ProfileRepository> Clone for TurnService<C, P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C, P> TurnService<C, P>
where
    C: ChatRepository + 'static,
    P: ProfileRepository + 'static,
{
    pub fn new(deps: TurnDeps<C, P>, config: CompanionConfig) -> Self {
        let memory = Arc::new(ConversationMemory::new(
            deps.chat.clone(),
            deps.profiles,
            deps.llm.clone(),
            config.conversation.clone(),
            config.llm.model.clone(),
            config.llm.summary_max_tokens,
        ));
        let context = ContextBuilder::new(
            deps.chat.clone(),
            memory.clone(),
            deps.personas,
            deps.knowledge,
            config.conversation.resolve_recent_limit(),
        );
        Self {
            inner: Arc::new(Inner {
                chat: deps.chat,
                memory,
                context,
                llm: deps.llm,
                speech: deps.speech,
                ledger: TokenLedger::new(deps.identity),
                config,
            }),
        }
    }

    pub fn ledger(&self) -> &TokenLedger {
        &self.inner.ledger
    }

    /// Most recent messages for (agent, user), oldest first.
    pub async fn recent_messages(
        &self,
        agent_id: &Uuid,
        user_id: &Uuid,
        limit: Option<usize>,
    ) -> Result<Vec<ChatMessage>, TurnError> {
        let Some(conversation) = self.inner.chat.find_conversation(agent_id, user_id).await? else {
            return Ok(Vec::new());
        };
        let limit = limit
            .unwrap_or_else(|| self.inner.config.conversation.resolve_recent_limit())
            .clamp(1, 200);
        Ok(self.inner.chat.recent_messages(&conversation, limit).await?)
    }

    /// Handle a turn synchronously and return the complete reply.
    ///
    /// Non-user messages are stored without generating a reply.
    #[tracing::instrument(name = "submit_turn", skip_all, fields(agent_id = %request.agent_id, user_id = %request.user_id))]
    pub async fn submit(&self, request: TurnRequest) -> Result<TurnReply, TurnError> {
        let accepted = self.accept(&request).await?;
        if request.role != MessageRole::User {
            return Ok(TurnReply {
                conversation_id: accepted.conversation.id,
                agent_id: request.agent_id,
                user_id: request.user_id,
                user_message: accepted.user_message,
                assistant_message: None,
                assistant_error: None,
                tokens_used: None,
                token_balance: None,
            });
        }
        self.generate_reply(accepted).await
    }

    /// Persist the user message, build context and create the assistant
    /// placeholder. Any error here happens before the push stream opens.
    #[tracing::instrument(name = "begin_stream", skip_all, fields(agent_id = %request.agent_id, user_id = %request.user_id))]
    pub async fn begin_stream(&self, request: TurnRequest) -> Result<StreamingTurn<C, P>, TurnError> {
        if request.role != MessageRole::User {
            return Err(TurnError::Validation(
                "only user messages can be streamed".into(),
            ));
        }
        let accepted = self.accept(&request).await?;
        let context = self.inner.context.build(&accepted.conversation).await?;
        let plan = self.plan_speech(&context, &accepted.speech).await;

        let placeholder = self
            .inner
            .chat
            .append_message(
                &accepted.conversation,
                NewMessage::assistant_placeholder(accepted.user_message.id),
            )
            .await?;

        Ok(StreamingTurn::new(self.clone(), accepted, context, plan, placeholder))
    }

    /// Validate, gate on balance, then persist the inbound message.
    async fn accept(&self, request: &TurnRequest) -> Result<AcceptedTurn, TurnError> {
        request.validate()?;

        let starting_balance = if request.role == MessageRole::User {
            self.inner.ledger.ensure_can_spend(&request.user_id).await?
        } else {
            0
        };

        let conversation = self
            .inner
            .chat
            .get_or_create_conversation(&request.agent_id, &request.user_id)
            .await?;

        self.inner
            .memory
            .remember_preferences(&request.agent_id, &request.user_id, &request.speech)
            .await;

        let user_message = self
            .inner
            .chat
            .append_message(
                &conversation,
                NewMessage {
                    role: request.role,
                    content: request.content.trim().to_string(),
                    parent_message_id: None,
                    extras: MessageExtras::default(),
                },
            )
            .await?;

        info!(
            conversation_id = %conversation.id,
            seq = user_message.seq,
            "inbound message stored"
        );
        Ok(AcceptedTurn {
            conversation,
            user_message,
            starting_balance,
            speech: request.speech.clone(),
        })
    }

    /// Settle voice and parameters for this turn, or `None` when speech is off.
    pub(crate) async fn plan_speech(
        &self,
        context: &TurnContext,
        explicit: &SpeechPreferences,
    ) -> Option<SpeechPlan> {
        let speech = self.inner.speech.as_ref()?;
        let stored = SpeechPreferences::from_map(&context.profile.preferences);
        let prefs = explicit.clone().or(&stored);
        if prefs.enabled == Some(false) {
            return None;
        }

        let voices = match speech.list_voices().await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "voice listing failed, relying on defaults");
                Vec::new()
            }
        };
        let candidate_id = prefs
            .voice_id
            .as_deref()
            .or(context.persona.voice_id.as_deref());
        let candidate_provider = prefs
            .provider
            .as_deref()
            .or(context.persona.voice_provider.as_deref());
        let default_voice = speech.default_voice_id();
        let selection = resolve_voice_selection(
            candidate_id,
            candidate_provider,
            &voices,
            default_voice.as_deref(),
        )?;

        Some(SpeechPlan {
            params: speech_params(&selection, &prefs),
            streaming: speech.supports_streaming(selection.provider),
            format: selection.format,
        })
    }

    pub(crate) fn async_budget(&self) -> AsyncSpeechBudget {
        let cfg = &self.inner.config.speech;
        AsyncSpeechBudget {
            synthesis: Duration::from_secs(cfg.async_timeout_secs.max(1)),
            persist: Duration::from_secs(cfg.resolve_persist_timeout_secs()),
        }
    }

    /// Queue detached synthesis for `text`. Marks the message `queued` first
    /// so the task's own result is the last write.
    pub(crate) async fn queue_async_speech(
        &self,
        message_id: Uuid,
        text: &str,
        plan: &SpeechPlan,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let speech = self.inner.speech.clone()?;
        if text.trim().is_empty() {
            return None;
        }
        let queued = MessageExtras::new().with_speech_status(SpeechStatus::Queued);
        if let Err(e) = self.inner.chat.merge_message_extras(&message_id, &queued).await {
            warn!(%message_id, error = %e, "failed to mark speech queued");
        }
        Some(spawn_async_synthesis(
            self.inner.chat.clone(),
            speech,
            message_id,
            text.to_string(),
            plan.params.clone(),
            self.async_budget(),
        ))
    }
}

/// Extras written when an assistant reply settles.
pub(crate) fn settled_extras(
    emotion: Option<&EmotionMetadata>,
    plan: Option<&SpeechPlan>,
    status: Option<SpeechStatus>,
) -> MessageExtras {
    let mut extras = MessageExtras::new();
    if let Some(e) = emotion {
        extras = extras.with_emotion(e);
    }
    if let Some(p) = plan {
        extras = extras.with_speech_preferences(&p.preferences());
    }
    if let Some(s) = status {
        extras = extras.with_speech_status(s);
    }
    extras
}

/// Emotion for a settled reply, steered by the speech emotion hint.
pub(crate) fn reply_emotion(text: &str, plan: Option<&SpeechPlan>, explicit: &SpeechPreferences) -> Option<EmotionMetadata> {
    let hint = plan
        .and_then(|p| p.params.emotion.as_deref())
        .or(explicit.emotion.as_deref());
    infer_emotion(text, hint)
}
