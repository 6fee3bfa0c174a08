//! Synchronous reply generation for clients that do not take a push stream.

use std::time::Instant;

use tracing::{info, warn};

use companion_types::chat::{ChatMessage, MessageCompletion, MessageExtras, MessageRole, NewMessage};
use companion_types::error::TurnError;
use companion_types::llm::Usage;

use crate::chat::repository::ChatRepository;
use crate::memory::store::ProfileRepository;

use super::service::{AcceptedTurn, SpeechPlan, TurnReply, TurnService, reply_emotion, settled_extras};
use super::speech_task::speech_payload;

impl<C, P> TurnService<C, P>
where
    C: ChatRepository + 'static,
    P: ProfileRepository + 'static,
{
    /// One blocking model call, then the same post-generation steps as the
    /// streaming path. Model failure is stored on an assistant row and
    /// reported through `assistant_error`.
    pub(crate) async fn generate_reply(&self, accepted: AcceptedTurn) -> Result<TurnReply, TurnError> {
        let inner = &self.inner;
        let conversation = &accepted.conversation;
        let context = inner.context.build(conversation).await?;
        let plan = self.plan_speech(&context, &accepted.speech).await;
        let request = context.completion_request(&inner.config.llm, false);

        let started = Instant::now();
        let result = inner.llm.complete(&request).await;
        let latency_ms = elapsed_ms(started);

        let mut reply = TurnReply {
            conversation_id: conversation.id,
            agent_id: conversation.agent_id,
            user_id: conversation.user_id,
            user_message: accepted.user_message.clone(),
            assistant_message: None,
            assistant_error: None,
            tokens_used: None,
            token_balance: None,
        };

        let response = match result {
            Ok(r) => r,
            Err(e) => {
                warn!(conversation_id = %conversation.id, error = %e, "model call failed");
                let row = inner
                    .chat
                    .append_message(conversation, assistant_row(&accepted, String::new()))
                    .await?;
                let completion = MessageCompletion {
                    latency_ms: Some(latency_ms),
                    err_code: Some(e.code().to_string()),
                    err_msg: Some(e.to_string()),
                    ..Default::default()
                };
                inner
                    .chat
                    .finalize_message(conversation, &row.id, &completion)
                    .await?;
                reply.assistant_error = Some(e.to_string());
                return Ok(reply);
            }
        };

        let content = response.content;
        let row = inner
            .chat
            .append_message(conversation, assistant_row(&accepted, content.clone()))
            .await?;
        let completion = MessageCompletion {
            content: content.clone(),
            latency_ms: Some(latency_ms),
            token_input: response.usage.map(|u| i64::from(u.input_tokens)),
            token_output: response.usage.map(|u| i64::from(u.output_tokens)),
            ..Default::default()
        };
        inner
            .chat
            .finalize_message(conversation, &row.id, &completion)
            .await?;
        record_conversation_tokens(&*inner.chat, &conversation.id, response.usage.as_ref()).await;

        let emotion = reply_emotion(&content, plan.as_ref(), &accepted.speech);
        let mut extras = settled_extras(emotion.as_ref(), plan.as_ref(), None);
        if let Some(plan) = plan.as_ref() {
            extras.merge(&self.blocking_speech(&row, &content, plan).await);
        }
        if !extras.is_empty() {
            if let Err(e) = inner.chat.merge_message_extras(&row.id, &extras).await {
                warn!(message_id = %row.id, error = %e, "failed to merge reply extras");
            }
        }

        let balance = inner
            .ledger
            .apply_usage(&conversation.user_id, response.usage.as_ref(), accepted.starting_balance)
            .await?;
        inner.memory.ensure_summary(&conversation.id).await;

        let row_id = row.id;
        let stored = inner.chat.get_message(&row_id).await?.unwrap_or(row);
        info!(
            conversation_id = %conversation.id,
            message_id = %stored.id,
            latency_ms,
            "reply generated"
        );
        reply.assistant_message = Some(stored);
        reply.tokens_used = response.usage.map(|u| u.total());
        reply.token_balance = Some(balance);
        Ok(reply)
    }

    /// Synthesize the whole reply in-request, bounded by the synthesis timeout.
    async fn blocking_speech(&self, row: &ChatMessage, text: &str, plan: &SpeechPlan) -> MessageExtras {
        let Some(speech) = self.inner.speech.as_ref() else {
            return MessageExtras::new();
        };
        if text.trim().is_empty() {
            return MessageExtras::new();
        }
        let budget = self.async_budget();
        let outcome = match tokio::time::timeout(budget.synthesis, speech.synthesize(text, &plan.params)).await {
            Ok(r) => r.and_then(|audio| speech_payload(audio, &plan.params)),
            Err(_) => Err(companion_types::speech::SpeechError::Timeout(budget.synthesis.as_secs())),
        };
        match outcome {
            Ok(payload) => MessageExtras::new().with_speech_payload(&payload),
            Err(e) => {
                warn!(message_id = %row.id, error = %e, "speech synthesis failed");
                MessageExtras::new().with_speech_error(e.to_string())
            }
        }
    }
}

fn assistant_row(accepted: &AcceptedTurn, content: String) -> NewMessage {
    NewMessage {
        role: MessageRole::Assistant,
        content,
        parent_message_id: Some(accepted.user_message.id),
        extras: MessageExtras::default(),
    }
}

pub(crate) fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}

/// Add usage to the conversation counters. Failures are logged.
pub(crate) async fn record_conversation_tokens<C: ChatRepository>(
    chat: &C,
    conversation_id: &uuid::Uuid,
    usage: Option<&Usage>,
) {
    let Some(usage) = usage else {
        return;
    };
    if let Err(e) = chat
        .add_conversation_tokens(
            conversation_id,
            i64::from(usage.input_tokens),
            i64::from(usage.output_tokens),
        )
        .await
    {
        warn!(%conversation_id, error = %e, "failed to update conversation token counters");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use companion_types::config::CompanionConfig;
    use companion_types::speech::{SpeechPreferences, SpeechStatus};

    use super::*;
    use crate::ledger::BoxIdentityProvider;
    use crate::llm::box_provider::BoxLlmProvider;
    use crate::persona::BoxPersonaProvider;
    use crate::speech::box_provider::BoxSpeechProvider;
    use crate::testing::{
        InMemoryChatRepository, InMemoryProfileRepository, MockIdentity, MockLlm, MockPersona,
        MockSpeech,
    };
    use crate::turn::service::{TurnDeps, TurnRequest};

    struct Harness {
        service: TurnService<InMemoryChatRepository, InMemoryProfileRepository>,
        chat: InMemoryChatRepository,
        identity: MockIdentity,
        agent: Uuid,
        user: Uuid,
    }

    fn harness(llm: MockLlm, speech: Option<MockSpeech>, balance: i64) -> Harness {
        let chat = InMemoryChatRepository::new();
        let identity = MockIdentity::new();
        let user = identity.add_user(balance);
        let agent = Uuid::now_v7();
        let deps = TurnDeps {
            chat: Arc::new(chat.clone()),
            profiles: Arc::new(InMemoryProfileRepository::new()),
            llm: Arc::new(BoxLlmProvider::new(llm)),
            personas: Arc::new(BoxPersonaProvider::new(MockPersona::new(agent))),
            identity: Arc::new(BoxIdentityProvider::new(identity.clone())),
            speech: speech.map(|s| Arc::new(BoxSpeechProvider::new(s))),
            knowledge: None,
        };
        Harness {
            service: TurnService::new(deps, CompanionConfig::default()),
            chat,
            identity,
            agent,
            user,
        }
    }

    #[tokio::test]
    async fn test_submit_returns_reply_and_debits() {
        let h = harness(MockLlm::streaming(&["Hi ", "there!"]), None, 1_000);
        let reply = h
            .service
            .submit(TurnRequest::user(h.agent, h.user, "Hello"))
            .await
            .unwrap();

        let assistant = reply.assistant_message.unwrap();
        assert_eq!(assistant.content, "Hi there!");
        assert_eq!(assistant.seq, 2);
        assert_eq!(assistant.parent_message_id, Some(reply.user_message.id));
        assert_eq!(assistant.token_input, Some(40));
        assert_eq!(reply.tokens_used, Some(50));
        assert_eq!(reply.token_balance, Some(950));
        assert_eq!(h.identity.balance(&h.user), 950);
        assert!(assistant.extras.contains_key(MessageExtras::EMOTION));
        assert!(!assistant.extras.contains_key(MessageExtras::SPEECH_STATUS));

        let conv = h.chat.conversation(&reply.conversation_id).unwrap();
        assert_eq!(conv.token_input_sum, 40);
        assert_eq!(conv.token_output_sum, 10);
    }

    #[tokio::test]
    async fn test_submit_stores_reply_verbatim() {
        let llm = MockLlm::streaming(&["x"]).with_complete(Some("  Hello!\n\n"));
        let h = harness(llm, None, 1_000);
        let reply = h
            .service
            .submit(TurnRequest::user(h.agent, h.user, "Hello"))
            .await
            .unwrap();

        assert_eq!(reply.assistant_message.unwrap().content, "  Hello!\n\n");
        let msgs = h.chat.messages(&reply.conversation_id);
        assert_eq!(msgs[1].content, "  Hello!\n\n");
    }

    #[tokio::test]
    async fn test_submit_model_failure_records_error_row() {
        let llm = MockLlm::streaming(&["x"]).with_complete(None);
        let h = harness(llm, None, 1_000);
        let reply = h
            .service
            .submit(TurnRequest::user(h.agent, h.user, "Hello"))
            .await
            .unwrap();

        assert!(reply.assistant_message.is_none());
        assert!(reply.assistant_error.unwrap().contains("mock complete failure"));
        let msgs = h.chat.messages(&reply.conversation_id);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].err_code.as_deref(), Some("llm_provider"));
        assert_eq!(h.identity.balance(&h.user), 1_000);
    }

    #[tokio::test]
    async fn test_submit_with_speech_attaches_audio() {
        let h = harness(MockLlm::streaming(&["Nice to meet you."]), Some(MockSpeech::new(false)), 1_000);
        let reply = h
            .service
            .submit(TurnRequest::user(h.agent, h.user, "Hello"))
            .await
            .unwrap();

        let extras = reply.assistant_message.unwrap().extras;
        assert_eq!(extras.speech_status(), Some(SpeechStatus::Completed));
        assert!(extras.contains_key(MessageExtras::SPEECH));
        assert!(extras.contains_key(MessageExtras::SPEECH_PREFERENCES));
    }

    #[tokio::test]
    async fn test_submit_speech_failure_is_recorded_not_raised() {
        let speech = MockSpeech::new(false).failing();
        let h = harness(MockLlm::streaming(&["Okay."]), Some(speech), 1_000);
        let reply = h
            .service
            .submit(TurnRequest::user(h.agent, h.user, "Hello"))
            .await
            .unwrap();
        let extras = reply.assistant_message.unwrap().extras;
        assert_eq!(extras.speech_status(), Some(SpeechStatus::Error));
    }

    #[tokio::test]
    async fn test_submit_speech_disabled_by_request() {
        let h = harness(MockLlm::streaming(&["Okay."]), Some(MockSpeech::new(false)), 1_000);
        let mut request = TurnRequest::user(h.agent, h.user, "Hello");
        request.speech = SpeechPreferences {
            enabled: Some(false),
            ..Default::default()
        };
        let reply = h.service.submit(request).await.unwrap();
        let extras = reply.assistant_message.unwrap().extras;
        assert!(!extras.contains_key(MessageExtras::SPEECH_STATUS));
    }

    #[tokio::test]
    async fn test_submit_non_user_role_stores_without_reply() {
        let llm = MockLlm::streaming(&["unused"]);
        let spy = llm.clone();
        let h = harness(llm, None, 0);
        let mut request = TurnRequest::user(h.agent, h.user, "Context note");
        request.role = MessageRole::System;

        let reply = h.service.submit(request).await.unwrap();
        assert!(reply.assistant_message.is_none());
        assert_eq!(reply.user_message.role, MessageRole::System);
        assert_eq!(spy.complete_calls(), 0);
    }

    #[tokio::test]
    async fn test_submit_rejects_zero_balance_before_storing() {
        let h = harness(MockLlm::streaming(&["x"]), None, 0);
        let err = h
            .service
            .submit(TurnRequest::user(h.agent, h.user, "Hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, TurnError::InsufficientBalance { balance: 0 }));
        assert!(h.chat.conversation_for(&h.agent, &h.user).is_none());
        assert!(h.chat.all_messages().is_empty());
    }

    #[tokio::test]
    async fn test_submit_rejects_blank_content() {
        let h = harness(MockLlm::streaming(&["x"]), None, 10);
        let err = h
            .service
            .submit(TurnRequest::user(h.agent, h.user, "   "))
            .await
            .unwrap_err();
        assert!(matches!(err, TurnError::Validation(_)));
    }

    #[tokio::test]
    async fn test_recent_messages_unknown_pair_is_empty() {
        let h = harness(MockLlm::streaming(&["x"]), None, 10);
        let msgs = h.service.recent_messages(&h.agent, &h.user, None).await.unwrap();
        assert!(msgs.is_empty());
    }
}
