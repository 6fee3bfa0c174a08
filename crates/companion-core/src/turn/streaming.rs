//! Streaming turn execution.
//!
//! A [`StreamingTurn`] is produced by `TurnService::begin_stream` once the
//! user message and the assistant placeholder are stored. Running it pushes
//! events to an [`EventSink`] until the turn settles:
//!
//! ```text
//! user_message, assistant_placeholder,
//! [speech_stream_started], assistant_delta*, [speech_stream_chunk*],
//! assistant_message, [speech_stream_completed | speech_stream_failed],
//! done
//! ```
//!
//! A session that breaks while the reply is still being generated reports
//! `speech_stream_failed` before `assistant_message` instead.
//!
//! After the placeholder exists every failure is reported in-band.

use std::time::Instant;

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use companion_types::chat::{ChatMessage, MessageCompletion, MessageExtras};
use companion_types::error::TurnError;
use companion_types::event::{
    AssistantDelta, SpeechStreamCompleted, SpeechStreamFailed, SpeechStreamStarted, TurnDone,
    TurnEvent,
};
use companion_types::llm::{CompletionRequest, StopReason, StreamEvent, Usage};
use companion_types::speech::{SpeechError, SpeechStatus, SynthesizedAudio};

use crate::chat::context::TurnContext;
use crate::chat::repository::ChatRepository;
use crate::memory::store::ProfileRepository;
use crate::speech::session::SpeechStreamHandle;

use super::events::{EventSink, EventWriter};
use super::generator::{elapsed_ms, record_conversation_tokens};
use super::service::{AcceptedTurn, SpeechPlan, TurnService, reply_emotion, settled_extras};
use super::speech_task::{spawn_speech_relay, speech_payload};

/// How a streaming turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    Completed,
    /// Batch fallback answered after the stream failed.
    Recovered,
    Failed,
    Cancelled,
}

/// Handle returned once a streaming turn has finished writing events.
#[derive(Debug)]
pub struct TurnOutcome {
    pub message_id: Uuid,
    pub status: TurnStatus,
    /// Detached synthesis, if one was queued. Dropping it does not cancel it.
    pub speech_task: Option<JoinHandle<()>>,
}

/// Speech session that is open for the current reply.
struct LiveSpeech {
    handle: SpeechStreamHandle,
    relay: JoinHandle<Result<Vec<u8>, SpeechError>>,
    spoken: bool,
    failed: Option<SpeechError>,
}

impl LiveSpeech {
    async fn append(&mut self, text: &str, cancel: &CancellationToken) {
        if self.failed.is_some() {
            return;
        }
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(SpeechError::SessionClosed),
            r = self.handle.append_text(text) => r,
        };
        match result {
            Ok(()) => self.spoken = true,
            Err(e) => self.fail(e),
        }
    }

    fn fail(&mut self, error: SpeechError) {
        warn!(error = %error, "speech session failed, degrading to async synthesis");
        self.handle.close();
        self.relay.abort();
        self.failed = Some(error);
    }

    fn abandon(mut self) {
        self.handle.close();
        self.relay.abort();
    }
}

/// What the model produced.
struct Generation {
    content: String,
    usage: Option<Usage>,
    finish: Option<StopReason>,
    recovered: bool,
}

enum GenerationEnd {
    Settled(Generation),
    Failed { partial: String, error: String, code: String },
    Cancelled { partial: String },
}

/// A turn whose inbound message and placeholder are stored, ready to stream.
pub struct StreamingTurn<C: ChatRepository, P: ProfileRepository> {
    service: TurnService<C, P>,
    accepted: AcceptedTurn,
    context: TurnContext,
    plan: Option<SpeechPlan>,
    placeholder: ChatMessage,
}

impl<C, P> StreamingTurn<C, P>
where
    C: ChatRepository + 'static,
    P: ProfileRepository + 'static,
{
    pub(crate) fn new(
        service: TurnService<C, P>,
        accepted: AcceptedTurn,
        context: TurnContext,
        plan: Option<SpeechPlan>,
        placeholder: ChatMessage,
    ) -> Self {
        Self {
            service,
            accepted,
            context,
            plan,
            placeholder,
        }
    }

    pub fn conversation_id(&self) -> Uuid {
        self.accepted.conversation.id
    }

    pub fn user_message(&self) -> &ChatMessage {
        &self.accepted.user_message
    }

    pub fn placeholder(&self) -> &ChatMessage {
        &self.placeholder
    }

    /// Drive the turn to completion, writing every event to `sink`.
    ///
    /// `cancel` fires when the client goes away: generation stops, the
    /// placeholder keeps the last flushed text and no further events are
    /// written.
    #[tracing::instrument(
        name = "stream_turn",
        skip_all,
        fields(conversation_id = %self.accepted.conversation.id, message_id = %self.placeholder.id)
    )]
    pub async fn run<S: EventSink>(self, sink: S, cancel: CancellationToken) -> TurnOutcome {
        let writer = EventWriter::new(sink);
        let id = self.placeholder.id;

        writer
            .emit(TurnEvent::UserMessage(self.accepted.user_message.clone()))
            .await;
        writer
            .emit(TurnEvent::AssistantPlaceholder(self.placeholder.clone()))
            .await;

        let mut live = self.open_speech(&writer, &cancel).await;
        let started = Instant::now();
        let end = self.generate(&writer, &cancel, live.as_mut()).await;
        let latency_ms = elapsed_ms(started);

        let generation = match end {
            GenerationEnd::Settled(g) => g,
            GenerationEnd::Cancelled { partial } => {
                self.abandon_speech(live, "cancelled").await;
                self.record_failure(partial, latency_ms, "cancelled", "client disconnected")
                    .await;
                info!("turn cancelled by client");
                return TurnOutcome {
                    message_id: id,
                    status: TurnStatus::Cancelled,
                    speech_task: None,
                };
            }
            GenerationEnd::Failed {
                partial,
                error,
                code,
            } => {
                self.abandon_speech(live, &error).await;
                self.record_failure(partial, latency_ms, &code, &error).await;
                writer.emit(TurnEvent::error(error)).await;
                return TurnOutcome {
                    message_id: id,
                    status: TurnStatus::Failed,
                    speech_task: None,
                };
            }
        };

        // A session that heard partial text from a broken stream cannot be
        // trusted with the recovered reply. One that heard nothing gets the
        // whole reply at once.
        if let Some(s) = live.as_mut() {
            if generation.recovered && s.spoken {
                s.fail(SpeechError::SessionClosed);
            } else if !s.spoken && !generation.content.trim().is_empty() {
                s.append(&generation.content, &cancel).await;
            }
        }

        // A broken session is reported here and async synthesis takes over.
        let broken = live
            .as_ref()
            .and_then(|s| s.failed.as_ref())
            .map(ToString::to_string);
        if let Some(error) = broken {
            if let Some(s) = live.take() {
                s.abandon();
            }
            self.report_speech_failure(&writer, error).await;
        }

        let mut speech_task = self.settle(&generation, latency_ms, live.as_ref()).await;

        let balance = self
            .service
            .inner
            .ledger
            .apply_usage(
                &self.accepted.conversation.user_id,
                generation.usage.as_ref(),
                self.accepted.starting_balance,
            )
            .await;
        if let Err(e) = balance {
            warn!(error = %e, "ledger debit failed");
            let error = TurnError::from(e).to_string();
            self.abandon_speech(live, &error).await;
            writer.emit(TurnEvent::error(error)).await;
            return TurnOutcome {
                message_id: id,
                status: TurnStatus::Failed,
                speech_task,
            };
        }

        let message = self.reload(&generation.content).await;
        writer.emit(TurnEvent::AssistantMessage(message)).await;

        if let Some(s) = live {
            if let Some(task) = self.finish_speech(s, &writer, &generation.content, &cancel).await {
                speech_task = Some(task);
            }
        }

        if cancel.is_cancelled() {
            return TurnOutcome {
                message_id: id,
                status: TurnStatus::Cancelled,
                speech_task,
            };
        }

        self.service
            .inner
            .memory
            .ensure_summary(&self.accepted.conversation.id)
            .await;
        writer.emit(TurnEvent::Done(TurnDone { id })).await;

        info!(latency_ms, recovered = generation.recovered, "streaming turn completed");
        TurnOutcome {
            message_id: id,
            status: if generation.recovered {
                TurnStatus::Recovered
            } else {
                TurnStatus::Completed
            },
            speech_task,
        }
    }

    /// Open an incremental speech session when the voice supports one.
    async fn open_speech<S: EventSink>(
        &self,
        writer: &EventWriter<S>,
        cancel: &CancellationToken,
    ) -> Option<LiveSpeech> {
        let plan = self.plan.as_ref().filter(|p| p.streaming)?;
        let speech = self.service.inner.speech.as_ref()?;
        let mut handle = match speech.open_stream(&plan.params).await {
            Ok(h) => h,
            Err(e) => {
                warn!(error = %e, "speech stream unavailable, using async synthesis");
                return None;
            }
        };
        let chunks = handle.take_chunks()?;
        let id = self.placeholder.id;

        let streaming = MessageExtras::new().with_speech_status(SpeechStatus::Streaming);
        if let Err(e) = self.service.inner.chat.merge_message_extras(&id, &streaming).await {
            warn!(error = %e, "failed to mark speech streaming");
        }

        writer
            .emit(TurnEvent::SpeechStreamStarted(SpeechStreamStarted {
                id,
                voice_id: plan.params.voice_id.clone(),
                provider: plan.params.provider,
                format: handle.format.clone(),
                sample_rate: handle.sample_rate,
                speed: plan.params.speed,
                pitch: plan.params.pitch,
                emotion: plan.params.emotion.clone(),
            }))
            .await;

        let relay = spawn_speech_relay(writer.clone(), id, chunks, cancel.child_token());
        debug!(voice_id = %plan.params.voice_id, "speech stream opened");
        Some(LiveSpeech {
            handle,
            relay,
            spoken: false,
            failed: None,
        })
    }

    /// Consume the model stream, falling back to one batch call if it fails.
    async fn generate<S: EventSink>(
        &self,
        writer: &EventWriter<S>,
        cancel: &CancellationToken,
        mut live: Option<&mut LiveSpeech>,
    ) -> GenerationEnd {
        let inner = &self.service.inner;
        let id = self.placeholder.id;
        let request = self.context.completion_request(&inner.config.llm, true);
        if !inner.llm.capabilities().streaming {
            debug!(provider = inner.llm.name(), "provider cannot stream, answering in one piece");
            return self.complete_once(writer, cancel, request, String::new(), false).await;
        }
        let mut stream = inner.llm.stream(request.clone());

        let mut full = String::new();
        let mut usage = None;
        let mut finish = None;
        let mut failure = None;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return GenerationEnd::Cancelled { partial: full },
                next = stream.next() => next,
            };
            match next {
                None | Some(Ok(StreamEvent::Done)) => break,
                Some(Ok(StreamEvent::Connected)) => {}
                Some(Ok(StreamEvent::MessageDelta { stop_reason })) => finish = Some(stop_reason),
                Some(Ok(StreamEvent::Usage(u))) => usage = Some(u),
                Some(Ok(StreamEvent::TextDelta { text })) => {
                    if text.is_empty() {
                        continue;
                    }
                    full.push_str(&text);
                    if let Err(e) = inner.chat.update_message_content(&id, &full).await {
                        warn!(error = %e, "failed to flush partial reply");
                    }
                    writer
                        .emit(TurnEvent::AssistantDelta(AssistantDelta {
                            id,
                            full: full.clone(),
                            delta: Some(text.clone()),
                            finish_reason: None,
                            done: None,
                        }))
                        .await;
                    if let Some(s) = live.as_deref_mut() {
                        s.append(&text, cancel).await;
                    }
                }
                Some(Err(e)) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        drop(stream);

        let Some(stream_error) = failure else {
            writer
                .emit(TurnEvent::AssistantDelta(AssistantDelta {
                    id,
                    full: full.clone(),
                    delta: None,
                    finish_reason: finish.map(finish_reason),
                    done: Some(true),
                }))
                .await;
            return GenerationEnd::Settled(Generation {
                content: full,
                usage,
                finish,
                recovered: false,
            });
        };

        warn!(error = %stream_error, partial_len = full.len(), "model stream failed, trying batch completion");
        self.complete_once(writer, cancel, request, full, true).await
    }

    /// Answer with one batch completion, reported as a single done delta.
    async fn complete_once<S: EventSink>(
        &self,
        writer: &EventWriter<S>,
        cancel: &CancellationToken,
        mut request: CompletionRequest,
        partial: String,
        recovered: bool,
    ) -> GenerationEnd {
        let inner = &self.service.inner;
        let id = self.placeholder.id;
        request.stream = false;
        let batch = tokio::select! {
            biased;
            _ = cancel.cancelled() => return GenerationEnd::Cancelled { partial },
            r = inner.llm.complete(&request) => r,
        };
        match batch {
            Ok(response) => {
                let content = response.content;
                if let Err(e) = inner.chat.update_message_content(&id, &content).await {
                    warn!(error = %e, "failed to store batch reply");
                }
                writer
                    .emit(TurnEvent::AssistantDelta(AssistantDelta {
                        id,
                        full: content.clone(),
                        delta: None,
                        finish_reason: Some(finish_reason(response.stop_reason)),
                        done: Some(true),
                    }))
                    .await;
                GenerationEnd::Settled(Generation {
                    content,
                    usage: response.usage,
                    finish: Some(response.stop_reason),
                    recovered,
                })
            }
            Err(e) => {
                warn!(error = %e, recovered, "batch completion failed");
                GenerationEnd::Failed {
                    partial,
                    error: e.to_string(),
                    code: e.code().to_string(),
                }
            }
        }
    }

    /// Store counters, latency and extras for the settled reply and queue
    /// async speech when no session is carrying it.
    async fn settle(
        &self,
        generation: &Generation,
        latency_ms: i64,
        live: Option<&LiveSpeech>,
    ) -> Option<JoinHandle<()>> {
        let inner = &self.service.inner;
        let conversation = &self.accepted.conversation;
        let id = self.placeholder.id;

        let completion = MessageCompletion {
            content: generation.content.clone(),
            latency_ms: Some(latency_ms),
            token_input: generation.usage.map(|u| i64::from(u.input_tokens)),
            token_output: generation.usage.map(|u| i64::from(u.output_tokens)),
            ..Default::default()
        };
        if let Err(e) = inner.chat.finalize_message(conversation, &id, &completion).await {
            warn!(error = %e, "failed to finalize assistant message");
        }
        record_conversation_tokens(&*inner.chat, &conversation.id, generation.usage.as_ref()).await;

        let plan = self.plan.as_ref();
        let emotion = reply_emotion(&generation.content, plan, &self.accepted.speech);
        let session_alive = live.is_some();
        let status = session_alive.then_some(SpeechStatus::Streaming);
        let extras = settled_extras(emotion.as_ref(), plan, status);
        if !extras.is_empty() {
            if let Err(e) = inner.chat.merge_message_extras(&id, &extras).await {
                warn!(error = %e, "failed to merge reply extras");
            }
        }

        let mut speech_task = None;
        if !session_alive {
            if let Some(plan) = plan {
                speech_task = self
                    .service
                    .queue_async_speech(id, &generation.content, plan)
                    .await;
            }
        }
        debug!(finish = ?generation.finish, "reply settled");
        speech_task
    }

    /// Await the relay and report the streamed audio.
    async fn finish_speech<S: EventSink>(
        &self,
        mut live: LiveSpeech,
        writer: &EventWriter<S>,
        text: &str,
        cancel: &CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let id = self.placeholder.id;
        let plan = self.plan.as_ref()?;

        let outcome = match live.handle.finalize().await {
            Err(e) => {
                live.relay.abort();
                Err(e)
            }
            Ok(()) => {
                let budget = self.service.async_budget().synthesis;
                match tokio::time::timeout(budget, &mut live.relay).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(join)) => Err(SpeechError::Provider(join.to_string())),
                    Err(_) => {
                        live.relay.abort();
                        Err(SpeechError::Timeout(budget.as_secs()))
                    }
                }
            }
        };
        live.handle.close();

        if cancel.is_cancelled() {
            self.mark_speech_error("cancelled").await;
            return None;
        }

        let payload = outcome.and_then(|audio| {
            speech_payload(
                SynthesizedAudio {
                    audio,
                    format: live.handle.format.clone(),
                    sample_rate: live.handle.sample_rate,
                    voice_id: plan.params.voice_id.clone(),
                    provider: plan.params.provider,
                },
                &plan.params,
            )
        });
        let chat = &self.service.inner.chat;
        match payload {
            Ok(speech) => {
                let patch = MessageExtras::new().with_speech_payload(&speech);
                if let Err(e) = chat.merge_message_extras(&id, &patch).await {
                    warn!(error = %e, "failed to store streamed speech");
                }
                info!(bytes = speech.byte_len, "speech stream completed");
                writer
                    .emit(TurnEvent::SpeechStreamCompleted(SpeechStreamCompleted { id, speech }))
                    .await;
                None
            }
            Err(e) => {
                warn!(error = %e, "speech stream failed");
                self.report_speech_failure(writer, e.to_string()).await;
                self.service.queue_async_speech(id, text, plan).await
            }
        }
    }

    /// Record a broken session on the message and tell the client.
    async fn report_speech_failure<S: EventSink>(&self, writer: &EventWriter<S>, error: String) {
        self.mark_speech_error(&error).await;
        writer
            .emit(TurnEvent::SpeechStreamFailed(SpeechStreamFailed {
                id: self.placeholder.id,
                error,
            }))
            .await;
    }

    /// Close a session the turn will not finish so the message does not stay
    /// marked `streaming`.
    async fn abandon_speech(&self, live: Option<LiveSpeech>, reason: &str) {
        let Some(s) = live else {
            return;
        };
        let error = match &s.failed {
            Some(e) => e.to_string(),
            None => reason.to_string(),
        };
        s.abandon();
        self.mark_speech_error(&error).await;
    }

    async fn mark_speech_error(&self, error: &str) {
        let patch = MessageExtras::new().with_speech_error(error);
        if let Err(e) = self
            .service
            .inner
            .chat
            .merge_message_extras(&self.placeholder.id, &patch)
            .await
        {
            warn!(error = %e, "failed to record speech failure");
        }
    }

    async fn record_failure(&self, partial: String, latency_ms: i64, code: &str, message: &str) {
        let completion = MessageCompletion {
            content: partial,
            latency_ms: Some(latency_ms),
            err_code: Some(code.to_string()),
            err_msg: Some(message.to_string()),
            ..Default::default()
        };
        if let Err(e) = self
            .service
            .inner
            .chat
            .finalize_message(&self.accepted.conversation, &self.placeholder.id, &completion)
            .await
        {
            warn!(error = %e, "failed to record turn failure on placeholder");
        }
    }

    /// The stored assistant message, or a local copy if the reload fails.
    async fn reload(&self, content: &str) -> ChatMessage {
        match self.service.inner.chat.get_message(&self.placeholder.id).await {
            Ok(Some(m)) => m,
            Ok(None) => self.local_copy(content),
            Err(e) => {
                warn!(error = %e, "assistant message reload failed");
                self.local_copy(content)
            }
        }
    }

    fn local_copy(&self, content: &str) -> ChatMessage {
        let mut message = self.placeholder.clone();
        message.content = content.to_string();
        message
    }
}

fn finish_reason(reason: StopReason) -> String {
    match reason {
        StopReason::EndTurn => "stop",
        StopReason::MaxTokens => "length",
        StopReason::StopSequence => "stop_sequence",
        StopReason::ContentFilter => "content_filter",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use std::time::Duration;

    use tokio::sync::mpsc;

    use companion_types::config::CompanionConfig;
    use companion_types::speech::SpeechPreferences;

    use super::*;
    use crate::ledger::BoxIdentityProvider;
    use crate::llm::box_provider::BoxLlmProvider;
    use crate::persona::BoxPersonaProvider;
    use crate::speech::box_provider::BoxSpeechProvider;
    use crate::testing::{
        InMemoryChatRepository, InMemoryProfileRepository, MockIdentity, MockLlm, MockPersona,
        MockSpeech, StreamScript,
    };
    use crate::turn::events::SinkClosed;
    use crate::turn::service::{TurnDeps, TurnRequest};

    const SPEECH_TASK_GRACE: Duration = Duration::from_secs(5);

    struct Harness {
        service: TurnService<InMemoryChatRepository, InMemoryProfileRepository>,
        chat: InMemoryChatRepository,
        identity: MockIdentity,
        llm: MockLlm,
        agent: Uuid,
        user: Uuid,
    }

    fn harness_with(llm: MockLlm, speech: Option<MockSpeech>, config: CompanionConfig) -> Harness {
        let chat = InMemoryChatRepository::new();
        let identity = MockIdentity::new();
        let user = identity.add_user(10_000);
        let agent = Uuid::now_v7();
        let deps = TurnDeps {
            chat: Arc::new(chat.clone()),
            profiles: Arc::new(InMemoryProfileRepository::new()),
            llm: Arc::new(BoxLlmProvider::new(llm.clone())),
            personas: Arc::new(BoxPersonaProvider::new(MockPersona::new(agent))),
            identity: Arc::new(BoxIdentityProvider::new(identity.clone())),
            speech: speech.map(|s| Arc::new(BoxSpeechProvider::new(s))),
            knowledge: None,
        };
        Harness {
            service: TurnService::new(deps, config),
            chat,
            identity,
            llm,
            agent,
            user,
        }
    }

    fn harness(llm: MockLlm, speech: Option<MockSpeech>) -> Harness {
        harness_with(llm, speech, CompanionConfig::default())
    }

    async fn run_turn(h: &Harness, content: &str) -> (TurnOutcome, Vec<TurnEvent>) {
        let turn = h
            .service
            .begin_stream(TurnRequest::user(h.agent, h.user, content))
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::channel(512);
        let outcome = turn.run(tx, CancellationToken::new()).await;
        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        (outcome, events)
    }

    fn names(events: &[TurnEvent]) -> Vec<&'static str> {
        events.iter().map(|e| e.name()).collect()
    }

    fn done_deltas(events: &[TurnEvent]) -> Vec<&AssistantDelta> {
        events
            .iter()
            .filter_map(|e| match e {
                TurnEvent::AssistantDelta(d) if d.done == Some(true) => Some(d),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_first_turn_event_order() {
        let h = harness(MockLlm::streaming(&["Hello", " there", "!"]), None);
        let (outcome, events) = run_turn(&h, "Hello").await;
        assert_eq!(outcome.status, TurnStatus::Completed);

        let names = names(&events);
        assert_eq!(names[0], "user_message");
        assert_eq!(names[1], "assistant_placeholder");
        let last_delta = names.iter().rposition(|n| *n == "assistant_delta").unwrap();
        let message = names.iter().position(|n| *n == "assistant_message").unwrap();
        assert!(last_delta < message);
        assert_eq!(names.last(), Some(&"done"));
        assert_eq!(done_deltas(&events).len(), 1);

        let conv = h.chat.conversation_for(&h.agent, &h.user).unwrap();
        let msgs = h.chat.messages(&conv.id);
        assert_eq!(msgs[0].seq, 1);
        assert_eq!(msgs[0].content, "Hello");
        assert_eq!(msgs[1].content, "Hello there!");
    }

    #[tokio::test]
    async fn test_first_turn_prompt_carries_opening_hint() {
        let h = harness(MockLlm::streaming(&["Hi!"]), None);
        run_turn(&h, "Hello").await;
        let request = &h.llm.requests()[0];
        assert!(request.messages[0].content.contains("Greet the user warmly"));
        assert!(request.stream);
    }

    #[tokio::test]
    async fn test_final_content_matches_model_and_ledger_debited() {
        let h = harness(MockLlm::streaming(&["a", "b", "c"]), None);
        let (outcome, events) = run_turn(&h, "go").await;

        let stored = h.chat.get_message(&outcome.message_id).await.unwrap().unwrap();
        assert_eq!(stored.content, "abc");
        assert_eq!(stored.token_input, Some(40));
        assert_eq!(stored.token_output, Some(10));
        assert!(stored.latency_ms.is_some());
        assert_eq!(h.identity.balance(&h.user), 10_000 - 50);
        assert_eq!(h.identity.invalidations(&h.user), 1);

        let emitted = events
            .iter()
            .find_map(|e| match e {
                TurnEvent::AssistantMessage(m) => Some(m.content.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(emitted, "abc");
    }

    #[tokio::test]
    async fn test_seq_stays_gapless_over_turns() {
        let h = harness(MockLlm::streaming(&["ok"]), None);
        for i in 0..3 {
            run_turn(&h, &format!("turn {i}")).await;
        }
        let conv = h.chat.conversation_for(&h.agent, &h.user).unwrap();
        let seqs: Vec<i64> = h.chat.messages(&conv.id).iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_stream_failure_falls_back_to_batch() {
        let llm = MockLlm::streaming(&["unused"])
            .with_script(StreamScript::Fail)
            .with_complete(Some("Batch answer."));
        let h = harness(llm, None);
        let (outcome, events) = run_turn(&h, "Hello").await;

        assert_eq!(outcome.status, TurnStatus::Recovered);
        let deltas: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, TurnEvent::AssistantDelta(_)))
            .collect();
        assert_eq!(deltas.len(), 1);
        let done = done_deltas(&events);
        assert_eq!(done[0].full, "Batch answer.");
        assert_eq!(h.llm.complete_calls(), 1);

        let stored = h.chat.get_message(&outcome.message_id).await.unwrap().unwrap();
        assert_eq!(stored.content, "Batch answer.");
        assert_eq!(names(&events).last(), Some(&"done"));
    }

    #[tokio::test]
    async fn test_partial_stream_failure_replaces_text_with_batch() {
        let llm = MockLlm::streaming(&["unused"])
            .with_script(StreamScript::FailAfter(vec!["Hal".into()]))
            .with_complete(Some("Hello again."));
        let h = harness(llm, None);
        let (outcome, events) = run_turn(&h, "Hello").await;

        assert_eq!(done_deltas(&events).len(), 1);
        let stored = h.chat.get_message(&outcome.message_id).await.unwrap().unwrap();
        assert_eq!(stored.content, "Hello again.");
    }

    #[tokio::test]
    async fn test_fallback_failure_emits_error_and_records_it() {
        let llm = MockLlm::streaming(&["unused"])
            .with_script(StreamScript::Fail)
            .with_complete(None);
        let h = harness(llm, None);
        let (outcome, events) = run_turn(&h, "Hello").await;

        assert_eq!(outcome.status, TurnStatus::Failed);
        let names = names(&events);
        assert_eq!(names.last(), Some(&"error"));
        assert!(!names.contains(&"done"));
        assert!(!names.contains(&"assistant_message"));

        let stored = h.chat.get_message(&outcome.message_id).await.unwrap().unwrap();
        assert_eq!(stored.err_code.as_deref(), Some("llm_provider"));
        assert_eq!(h.identity.balance(&h.user), 10_000);
    }

    #[tokio::test]
    async fn test_no_speech_provider_leaves_no_speech_status() {
        let h = harness(MockLlm::streaming(&["Fine."]), None);
        let (outcome, events) = run_turn(&h, "Hello").await;
        assert!(outcome.speech_task.is_none());
        assert!(!names(&events).iter().any(|n| n.starts_with("speech_")));
        let stored = h.chat.get_message(&outcome.message_id).await.unwrap().unwrap();
        assert!(!stored.extras.contains_key(MessageExtras::SPEECH_STATUS));
        assert!(stored.extras.contains_key(MessageExtras::EMOTION));
    }

    #[tokio::test]
    async fn test_streaming_speech_relays_chunks_and_persists_audio() {
        let speech = MockSpeech::new(true);
        let spy = speech.clone();
        let h = harness(MockLlm::streaming(&["Hi", " you"]), Some(speech));
        let (outcome, events) = run_turn(&h, "Hello").await;

        let names = names(&events);
        assert!(names.contains(&"speech_stream_started"));
        assert!(names.contains(&"speech_stream_chunk"));
        let completed = names.iter().position(|n| *n == "speech_stream_completed").unwrap();
        let message = names.iter().position(|n| *n == "assistant_message").unwrap();
        assert!(message < completed);
        assert_eq!(names.last(), Some(&"done"));
        assert_eq!(spy.streamed_text(), "Hi you");
        assert!(outcome.speech_task.is_none());

        let stored = h.chat.get_message(&outcome.message_id).await.unwrap().unwrap();
        assert_eq!(stored.extras.speech_status(), Some(SpeechStatus::Completed));
        let speech = stored.extras.get(MessageExtras::SPEECH).unwrap();
        assert_eq!(speech["voice_id"], "rachel");
        assert_eq!(speech["byte_len"], 6);
    }

    #[tokio::test]
    async fn test_silent_speech_stream_degrades_to_async() {
        let speech = MockSpeech::new(true).silent();
        let spy = speech.clone();
        let h = harness(MockLlm::streaming(&["Hi"]), Some(speech));
        let (outcome, events) = run_turn(&h, "Hello").await;

        assert!(names(&events).contains(&"speech_stream_failed"));
        assert_eq!(names(&events).last(), Some(&"done"));
        let task = outcome.speech_task.unwrap();
        tokio::time::timeout(SPEECH_TASK_GRACE, task).await.unwrap().unwrap();
        assert_eq!(spy.synth_calls(), 1);

        let stored = h.chat.get_message(&outcome.message_id).await.unwrap().unwrap();
        assert_eq!(stored.extras.speech_status(), Some(SpeechStatus::Completed));
    }

    fn speech_failed_error(events: &[TurnEvent]) -> Option<String> {
        events.iter().find_map(|e| match e {
            TurnEvent::SpeechStreamFailed(f) => Some(f.error.clone()),
            _ => None,
        })
    }

    /// Forwards events and fires `cancel` once the named event goes out.
    struct CancelAfter {
        tx: mpsc::Sender<TurnEvent>,
        cancel: CancellationToken,
        event: &'static str,
    }

    impl EventSink for CancelAfter {
        async fn emit(&mut self, event: TurnEvent) -> Result<(), SinkClosed> {
            let fire = event.name() == self.event;
            let sent = self
                .tx
                .send(event)
                .await
                .map_err(|_| SinkClosed);
            if fire {
                self.cancel.cancel();
            }
            sent
        }
    }

    #[tokio::test]
    async fn test_speech_backend_dropping_input_reports_failure_then_async() {
        let speech = MockSpeech::new(true).rejecting_input();
        let spy = speech.clone();
        let h = harness(MockLlm::streaming(&["Hi", " there"]), Some(speech));
        let (outcome, events) = run_turn(&h, "Hello").await;

        let names = names(&events);
        let started = names.iter().position(|n| *n == "speech_stream_started").unwrap();
        let failed = names.iter().position(|n| *n == "speech_stream_failed").unwrap();
        let message = names.iter().position(|n| *n == "assistant_message").unwrap();
        assert!(started < failed && failed < message);
        assert!(!names.contains(&"speech_stream_completed"));
        assert_eq!(names.last(), Some(&"done"));
        assert_eq!(speech_failed_error(&events).as_deref(), Some("speech session closed"));

        let patches = h.chat.extras_patches(&outcome.message_id);
        let error_at = patches
            .iter()
            .position(|p| p.get(MessageExtras::SPEECH_ERROR).is_some())
            .unwrap();
        assert_eq!(patches[error_at].speech_status(), Some(SpeechStatus::Error));
        assert_eq!(
            patches[error_at].get(MessageExtras::SPEECH_ERROR),
            Some(&serde_json::json!("speech session closed"))
        );
        let queued_at = patches
            .iter()
            .position(|p| p.speech_status() == Some(SpeechStatus::Queued))
            .unwrap();
        assert!(error_at < queued_at);

        let task = outcome.speech_task.unwrap();
        tokio::time::timeout(SPEECH_TASK_GRACE, task).await.unwrap().unwrap();
        assert_eq!(spy.synth_calls(), 1);
        let stored = h.chat.get_message(&outcome.message_id).await.unwrap().unwrap();
        assert_eq!(stored.extras.speech_status(), Some(SpeechStatus::Completed));
    }

    #[tokio::test]
    async fn test_recovered_reply_does_not_reuse_spoken_session() {
        let llm = MockLlm::streaming(&["unused"])
            .with_script(StreamScript::FailAfter(vec!["Hal".into()]))
            .with_complete(Some("Hello again."));
        let speech = MockSpeech::new(true);
        let spy = speech.clone();
        let h = harness(llm, Some(speech));
        let (outcome, events) = run_turn(&h, "Hello").await;

        assert_eq!(outcome.status, TurnStatus::Recovered);
        let names = names(&events);
        assert!(names.contains(&"speech_stream_failed"));
        assert!(!names.contains(&"speech_stream_completed"));
        assert_eq!(names.last(), Some(&"done"));

        let patches = h.chat.extras_patches(&outcome.message_id);
        assert!(
            patches
                .iter()
                .any(|p| p.get(MessageExtras::SPEECH_ERROR).is_some())
        );

        let task = outcome.speech_task.unwrap();
        tokio::time::timeout(SPEECH_TASK_GRACE, task).await.unwrap().unwrap();
        assert_eq!(spy.synth_calls(), 1);
        let stored = h.chat.get_message(&outcome.message_id).await.unwrap().unwrap();
        assert_eq!(stored.content, "Hello again.");
        assert_eq!(stored.extras.speech_status(), Some(SpeechStatus::Completed));
        let speech = stored.extras.get(MessageExtras::SPEECH).unwrap();
        assert_eq!(speech["byte_len"], "Hello again.".len());
    }

    #[tokio::test]
    async fn test_ledger_failure_clears_streaming_status() {
        let h = harness(MockLlm::streaming(&["Hi"]), Some(MockSpeech::new(true)));
        h.identity.fail_debits();
        let (outcome, events) = run_turn(&h, "Hello").await;

        assert_eq!(outcome.status, TurnStatus::Failed);
        let names = names(&events);
        assert_eq!(names.last(), Some(&"error"));
        assert!(!names.contains(&"speech_stream_completed"));

        let stored = h.chat.get_message(&outcome.message_id).await.unwrap().unwrap();
        assert_eq!(stored.extras.speech_status(), Some(SpeechStatus::Error));
        let error = stored.extras.get(MessageExtras::SPEECH_ERROR).unwrap();
        assert!(error.as_str().unwrap().contains("mock debit failure"));
    }

    #[tokio::test]
    async fn test_cancel_after_reply_marks_speech_cancelled() {
        let h = harness(MockLlm::streaming(&["Hi", " you"]), Some(MockSpeech::new(true)));
        let turn = h
            .service
            .begin_stream(TurnRequest::user(h.agent, h.user, "Hello"))
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::channel(512);
        let cancel = CancellationToken::new();
        let sink = CancelAfter {
            tx,
            cancel: cancel.clone(),
            event: "assistant_message",
        };
        let outcome = turn.run(sink, cancel).await;

        assert_eq!(outcome.status, TurnStatus::Cancelled);
        let mut names = Vec::new();
        while let Some(e) = rx.recv().await {
            names.push(e.name());
        }
        assert!(names.contains(&"assistant_message"));
        assert!(!names.contains(&"done"));

        let stored = h.chat.get_message(&outcome.message_id).await.unwrap().unwrap();
        assert_eq!(stored.content, "Hi you");
        assert_eq!(stored.extras.speech_status(), Some(SpeechStatus::Error));
        assert_eq!(
            stored.extras.get(MessageExtras::SPEECH_ERROR),
            Some(&serde_json::json!("cancelled"))
        );
    }

    #[tokio::test]
    async fn test_cancel_during_generation_marks_open_session() {
        let h = harness(MockLlm::streaming(&["one"]), Some(MockSpeech::new(true)));
        let turn = h
            .service
            .begin_stream(TurnRequest::user(h.agent, h.user, "Hello"))
            .await
            .unwrap();
        let (tx, _rx) = mpsc::channel(512);
        let cancel = CancellationToken::new();
        let sink = CancelAfter {
            tx,
            cancel: cancel.clone(),
            event: "speech_stream_started",
        };
        let outcome = turn.run(sink, cancel).await;

        assert_eq!(outcome.status, TurnStatus::Cancelled);
        let stored = h.chat.get_message(&outcome.message_id).await.unwrap().unwrap();
        assert_eq!(stored.err_code.as_deref(), Some("cancelled"));
        assert_eq!(stored.extras.speech_status(), Some(SpeechStatus::Error));
    }

    #[tokio::test]
    async fn test_non_streaming_provider_answers_in_one_piece() {
        let llm = MockLlm::streaming(&["unused"])
            .without_streaming()
            .with_complete(Some("Whole reply."));
        let speech = MockSpeech::new(true);
        let spy = speech.clone();
        let h = harness(llm, Some(speech));
        let (outcome, events) = run_turn(&h, "Hello").await;

        assert_eq!(outcome.status, TurnStatus::Completed);
        assert_eq!(h.llm.stream_calls(), 0);
        assert_eq!(h.llm.complete_calls(), 1);
        assert!(!h.llm.requests()[0].stream);

        let deltas: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, TurnEvent::AssistantDelta(_)))
            .collect();
        assert_eq!(deltas.len(), 1);
        assert_eq!(done_deltas(&events)[0].full, "Whole reply.");

        let names = names(&events);
        assert!(names.contains(&"speech_stream_completed"));
        assert_eq!(names.last(), Some(&"done"));
        assert_eq!(spy.streamed_text(), "Whole reply.");

        let stored = h.chat.get_message(&outcome.message_id).await.unwrap().unwrap();
        assert_eq!(stored.content, "Whole reply.");
        assert_eq!(stored.extras.speech_status(), Some(SpeechStatus::Completed));
    }

    #[tokio::test]
    async fn test_batch_voice_queues_async_speech() {
        let speech = MockSpeech::new(false);
        let spy = speech.clone();
        let h = harness(MockLlm::streaming(&["Good morning."]), Some(speech));
        let (outcome, events) = run_turn(&h, "Hello").await;

        assert!(!names(&events).iter().any(|n| n.starts_with("speech_")));
        let task = outcome.speech_task.unwrap();
        tokio::time::timeout(SPEECH_TASK_GRACE, task).await.unwrap().unwrap();
        assert_eq!(spy.synth_calls(), 1);

        let stored = h.chat.get_message(&outcome.message_id).await.unwrap().unwrap();
        assert_eq!(stored.extras.speech_status(), Some(SpeechStatus::Completed));
        assert!(stored.extras.contains_key(MessageExtras::EMOTION));
        assert!(stored.extras.contains_key(MessageExtras::SPEECH_PREFERENCES));
    }

    #[tokio::test]
    async fn test_speech_preferences_remembered_for_next_turn() {
        let h = harness(MockLlm::streaming(&["ok"]), Some(MockSpeech::new(false)));
        let mut request = TurnRequest::user(h.agent, h.user, "Hello");
        request.speech = SpeechPreferences {
            voice_id: Some("rachel".into()),
            speed: Some(1.2),
            ..Default::default()
        };
        let turn = h.service.begin_stream(request).await.unwrap();
        let (tx, _rx) = mpsc::channel(512);
        let first = turn.run(tx, CancellationToken::new()).await;
        if let Some(task) = first.speech_task {
            task.await.unwrap();
        }

        let (outcome, _) = run_turn(&h, "Again").await;
        if let Some(task) = outcome.speech_task {
            task.await.unwrap();
        }
        let stored = h.chat.get_message(&outcome.message_id).await.unwrap().unwrap();
        let prefs = stored.extras.get(MessageExtras::SPEECH_PREFERENCES).unwrap();
        assert_eq!(prefs["voice_id"], "rachel");
        assert_eq!(prefs["speed"], 1.2);
    }

    #[tokio::test]
    async fn test_summary_written_once_threshold_reached() {
        let mut config = CompanionConfig::default();
        config.conversation.summary_trigger = 4;
        let llm = MockLlm::streaming(&["Sure."]).with_complete(Some("User is studying French."));
        let h = harness_with(llm, None, config);

        run_turn(&h, "first").await;
        let conv = h.chat.conversation_for(&h.agent, &h.user).unwrap();
        assert!(conv.summary.is_none());

        run_turn(&h, "second").await;
        let conv = h.chat.conversation_for(&h.agent, &h.user).unwrap();
        assert_eq!(conv.summary.as_deref(), Some("User is studying French."));
        assert_eq!(conv.summary_through_seq, Some(4));

        run_turn(&h, "third").await;
        let request = h.llm.requests().into_iter().rev().find(|r| r.stream).unwrap();
        assert!(
            request
                .messages
                .iter()
                .any(|m| m.content.starts_with("Summary of the conversation so far:"))
        );
    }

    #[tokio::test]
    async fn test_zero_balance_rejected_before_any_write() {
        let h = harness(MockLlm::streaming(&["x"]), None);
        let broke = h.identity.add_user(0);
        let err = h
            .service
            .begin_stream(TurnRequest::user(h.agent, broke, "Hello"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TurnError::InsufficientBalance { .. }));
        assert!(h.chat.conversation_for(&h.agent, &broke).is_none());
        assert!(h.chat.all_messages().is_empty());
    }

    #[tokio::test]
    async fn test_placeholder_failure_aborts_before_stream() {
        let h = harness(MockLlm::streaming(&["x"]), None);
        h.chat.fail_assistant_append();
        let err = h
            .service
            .begin_stream(TurnRequest::user(h.agent, h.user, "Hello"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TurnError::Repository(_)));
        assert_eq!(h.llm.stream_calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_persona_is_not_found() {
        let chat = InMemoryChatRepository::new();
        let identity = MockIdentity::new();
        let user = identity.add_user(10);
        let deps = TurnDeps {
            chat: Arc::new(chat.clone()),
            profiles: Arc::new(InMemoryProfileRepository::new()),
            llm: Arc::new(BoxLlmProvider::new(MockLlm::streaming(&["x"]))),
            personas: Arc::new(BoxPersonaProvider::new(MockPersona::missing())),
            identity: Arc::new(BoxIdentityProvider::new(identity)),
            speech: None,
            knowledge: None,
        };
        let service = TurnService::new(deps, CompanionConfig::default());
        let err = service
            .begin_stream(TurnRequest::user(Uuid::now_v7(), user, "Hello"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TurnError::Persona(_)));
    }

    #[tokio::test]
    async fn test_cancel_keeps_partial_content() {
        let h = harness(MockLlm::streaming(&["one", "two"]), None);
        let turn = h
            .service
            .begin_stream(TurnRequest::user(h.agent, h.user, "Hello"))
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::channel(512);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = turn.run(tx, cancel).await;

        assert_eq!(outcome.status, TurnStatus::Cancelled);
        let mut names = Vec::new();
        while let Some(e) = rx.recv().await {
            names.push(e.name());
        }
        assert!(!names.contains(&"done"));
        let stored = h.chat.get_message(&outcome.message_id).await.unwrap().unwrap();
        assert_eq!(stored.err_code.as_deref(), Some("cancelled"));
        assert_eq!(h.identity.balance(&h.user), 10_000);
    }

    #[tokio::test]
    async fn test_non_user_role_cannot_stream() {
        let h = harness(MockLlm::streaming(&["x"]), None);
        let mut request = TurnRequest::user(h.agent, h.user, "note");
        request.role = companion_types::chat::MessageRole::Assistant;
        let err = h.service.begin_stream(request).await.err().unwrap();
        assert!(matches!(err, TurnError::Validation(_)));
    }
}
