//! In-memory repositories and scripted collaborators for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::{Map, Value};
use uuid::Uuid;

use companion_types::chat::{
    ChatMessage, Conversation, MessageCompletion, MessageExtras, MessageRole, NewMessage,
    UserAgentMemory,
};
use companion_types::error::{LedgerError, PersonaError, RepositoryError};
use companion_types::identity::UserAccount;
use companion_types::knowledge::{KnowledgeChunk, KnowledgeError};
use companion_types::llm::{
    CompletionRequest, CompletionResponse, LlmError, ProviderCapabilities, StopReason,
    StreamEvent, Usage,
};
use companion_types::persona::{Persona, PersonaChatConfig};
use companion_types::speech::{
    AudioChunk, SpeechError, SpeechParams, SynthesizedAudio, VoiceInfo, VoiceProvider,
};

use crate::chat::repository::ChatRepository;
use crate::knowledge::KnowledgeProvider;
use crate::ledger::identity::IdentityProvider;
use crate::llm::provider::{LlmEventStream, LlmProvider};
use crate::memory::store::ProfileRepository;
use crate::persona::PersonaProvider;
use crate::speech::provider::SpeechProvider;
use crate::speech::session::{SpeechInput, SpeechStreamHandle};

// ---------------------------------------------------------------------------
// Chat repository
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ChatState {
    conversations: HashMap<Uuid, Conversation>,
    messages: Vec<ChatMessage>,
    extras_patches: Vec<(Uuid, MessageExtras)>,
    fail_assistant_append: bool,
}

#[derive(Clone, Default)]
pub struct InMemoryChatRepository {
    state: Arc<Mutex<ChatState>>,
}

impl InMemoryChatRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make assistant placeholder creation fail.
    pub fn fail_assistant_append(&self) {
        self.state.lock().unwrap().fail_assistant_append = true;
    }

    pub fn messages(&self, conversation_id: &Uuid) -> Vec<ChatMessage> {
        let state = self.state.lock().unwrap();
        let mut msgs: Vec<_> = state
            .messages
            .iter()
            .filter(|m| m.conversation_id == *conversation_id)
            .cloned()
            .collect();
        msgs.sort_by_key(|m| m.seq);
        msgs
    }

    /// Every extras patch merged into `message_id`, oldest first.
    pub fn extras_patches(&self, message_id: &Uuid) -> Vec<MessageExtras> {
        self.state
            .lock()
            .unwrap()
            .extras_patches
            .iter()
            .filter(|(id, _)| id == message_id)
            .map(|(_, patch)| patch.clone())
            .collect()
    }

    pub fn all_messages(&self) -> Vec<ChatMessage> {
        self.state.lock().unwrap().messages.clone()
    }

    pub fn conversation(&self, id: &Uuid) -> Option<Conversation> {
        self.state.lock().unwrap().conversations.get(id).cloned()
    }

    pub fn conversation_for(&self, agent_id: &Uuid, user_id: &Uuid) -> Option<Conversation> {
        self.state
            .lock()
            .unwrap()
            .conversations
            .values()
            .find(|c| c.agent_id == *agent_id && c.user_id == *user_id)
            .cloned()
    }

    /// Seed `n` alternating user/assistant messages.
    pub fn seed_turns(&self, conversation: &Conversation, n: usize) {
        let mut state = self.state.lock().unwrap();
        let start = state
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation.id)
            .map(|m| m.seq)
            .max()
            .unwrap_or(0);
        for i in 0..n {
            let role = if i % 2 == 0 {
                MessageRole::User
            } else {
                MessageRole::Assistant
            };
            let now = Utc::now();
            state.messages.push(ChatMessage {
                id: Uuid::now_v7(),
                conversation_id: conversation.id,
                seq: start + i as i64 + 1,
                role,
                content: format!("{role} line {}", start + i as i64 + 1),
                parent_message_id: None,
                latency_ms: None,
                token_input: None,
                token_output: None,
                err_code: None,
                err_msg: None,
                extras: MessageExtras::default(),
                created_at: now,
                updated_at: now,
            });
        }
    }
}

impl ChatRepository for InMemoryChatRepository {
    async fn find_conversation(
        &self,
        agent_id: &Uuid,
        user_id: &Uuid,
    ) -> Result<Option<Conversation>, RepositoryError> {
        Ok(self.conversation_for(agent_id, user_id))
    }

    async fn get_or_create_conversation(
        &self,
        agent_id: &Uuid,
        user_id: &Uuid,
    ) -> Result<Conversation, RepositoryError> {
        if let Some(conv) = self.conversation_for(agent_id, user_id) {
            return Ok(conv);
        }
        let conv = Conversation::new(*agent_id, *user_id);
        self.state
            .lock()
            .unwrap()
            .conversations
            .insert(conv.id, conv.clone());
        Ok(conv)
    }

    async fn get_conversation(
        &self,
        conversation_id: &Uuid,
    ) -> Result<Option<Conversation>, RepositoryError> {
        Ok(self.conversation(conversation_id))
    }

    async fn append_message(
        &self,
        conversation: &Conversation,
        message: NewMessage,
    ) -> Result<ChatMessage, RepositoryError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_assistant_append && message.role == MessageRole::Assistant {
            return Err(RepositoryError::Query("disk full".into()));
        }
        let seq = state
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation.id)
            .map(|m| m.seq)
            .max()
            .unwrap_or(0)
            + 1;
        let now = Utc::now();
        let msg = ChatMessage {
            id: Uuid::now_v7(),
            conversation_id: conversation.id,
            seq,
            role: message.role,
            content: message.content,
            parent_message_id: message.parent_message_id,
            latency_ms: None,
            token_input: None,
            token_output: None,
            err_code: None,
            err_msg: None,
            extras: message.extras,
            created_at: now,
            updated_at: now,
        };
        state.messages.push(msg.clone());
        let conv = state
            .conversations
            .get_mut(&conversation.id)
            .ok_or(RepositoryError::NotFound)?;
        conv.last_msg_at = now;
        Ok(msg)
    }

    async fn update_message_content(
        &self,
        message_id: &Uuid,
        content: &str,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let msg = state
            .messages
            .iter_mut()
            .find(|m| m.id == *message_id)
            .ok_or(RepositoryError::NotFound)?;
        msg.content = content.to_string();
        msg.updated_at = Utc::now();
        Ok(())
    }

    async fn finalize_message(
        &self,
        _conversation: &Conversation,
        message_id: &Uuid,
        completion: &MessageCompletion,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let msg = state
            .messages
            .iter_mut()
            .find(|m| m.id == *message_id)
            .ok_or(RepositoryError::NotFound)?;
        msg.content = completion.content.clone();
        msg.latency_ms = completion.latency_ms;
        msg.token_input = completion.token_input;
        msg.token_output = completion.token_output;
        msg.err_code = completion.err_code.clone();
        msg.err_msg = completion.err_msg.clone();
        msg.updated_at = Utc::now();
        Ok(())
    }

    async fn merge_message_extras(
        &self,
        message_id: &Uuid,
        patch: &MessageExtras,
    ) -> Result<MessageExtras, RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let msg = state
            .messages
            .iter_mut()
            .find(|m| m.id == *message_id)
            .ok_or(RepositoryError::NotFound)?;
        msg.extras.merge(patch);
        let merged = msg.extras.clone();
        state.extras_patches.push((*message_id, patch.clone()));
        Ok(merged)
    }

    async fn get_message(&self, message_id: &Uuid) -> Result<Option<ChatMessage>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state.messages.iter().find(|m| m.id == *message_id).cloned())
    }

    async fn recent_messages(
        &self,
        conversation: &Conversation,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, RepositoryError> {
        let msgs = self.messages(&conversation.id);
        let skip = msgs.len().saturating_sub(limit);
        Ok(msgs.into_iter().skip(skip).collect())
    }

    async fn count_messages(&self, conversation_id: &Uuid) -> Result<i64, RepositoryError> {
        Ok(self.messages(conversation_id).len() as i64)
    }

    async fn latest_seq(&self, conversation_id: &Uuid) -> Result<Option<i64>, RepositoryError> {
        Ok(self.messages(conversation_id).last().map(|m| m.seq))
    }

    async fn has_assistant_reply(&self, conversation_id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self
            .messages(conversation_id)
            .iter()
            .any(|m| m.role == MessageRole::Assistant && !m.content.is_empty()))
    }

    async fn add_conversation_tokens(
        &self,
        conversation_id: &Uuid,
        input: i64,
        output: i64,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let conv = state
            .conversations
            .get_mut(conversation_id)
            .ok_or(RepositoryError::NotFound)?;
        conv.token_input_sum += input.max(0);
        conv.token_output_sum += output.max(0);
        Ok(())
    }

    async fn save_summary(
        &self,
        conversation_id: &Uuid,
        summary: &str,
        through_seq: i64,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let conv = state
            .conversations
            .get_mut(conversation_id)
            .ok_or(RepositoryError::NotFound)?;
        conv.summary = Some(summary.to_string());
        conv.summary_updated_at = Some(Utc::now());
        conv.summary_through_seq = Some(through_seq);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Profile repository
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct InMemoryProfileRepository {
    rows: Arc<Mutex<HashMap<(Uuid, Uuid), UserAgentMemory>>>,
}

impl InMemoryProfileRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, memory: UserAgentMemory) {
        self.rows
            .lock()
            .unwrap()
            .insert((memory.agent_id, memory.user_id), memory);
    }

    pub fn get(&self, agent_id: &Uuid, user_id: &Uuid) -> Option<UserAgentMemory> {
        self.rows.lock().unwrap().get(&(*agent_id, *user_id)).cloned()
    }
}

impl ProfileRepository for InMemoryProfileRepository {
    async fn get_memory(
        &self,
        agent_id: &Uuid,
        user_id: &Uuid,
    ) -> Result<Option<UserAgentMemory>, RepositoryError> {
        Ok(self.get(agent_id, user_id))
    }

    async fn upsert_preferences(
        &self,
        agent_id: &Uuid,
        user_id: &Uuid,
        preferences: &Map<String, Value>,
    ) -> Result<UserAgentMemory, RepositoryError> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .entry((*agent_id, *user_id))
            .or_insert_with(|| UserAgentMemory::empty(*agent_id, *user_id));
        for (k, v) in preferences {
            row.preferences.insert(k.clone(), v.clone());
        }
        Ok(row.clone())
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct MockIdentity {
    users: Arc<Mutex<HashMap<Uuid, (i64, usize)>>>,
    fail_debits: Arc<AtomicBool>,
}

impl MockIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, balance: i64) -> Uuid {
        let id = Uuid::now_v7();
        self.users.lock().unwrap().insert(id, (balance, 0));
        id
    }

    pub fn balance(&self, user_id: &Uuid) -> i64 {
        self.users.lock().unwrap().get(user_id).map(|u| u.0).unwrap_or(-1)
    }

    /// Make every later debit fail with a storage error.
    pub fn fail_debits(&self) {
        self.fail_debits.store(true, Ordering::SeqCst);
    }

    pub fn invalidations(&self, user_id: &Uuid) -> usize {
        self.users.lock().unwrap().get(user_id).map(|u| u.1).unwrap_or(0)
    }
}

impl IdentityProvider for MockIdentity {
    async fn get_user(&self, user_id: &Uuid) -> Result<UserAccount, LedgerError> {
        let users = self.users.lock().unwrap();
        let (balance, _) = users.get(user_id).ok_or(LedgerError::UserNotFound)?;
        Ok(UserAccount {
            id: *user_id,
            display_name: None,
            balance: *balance,
        })
    }

    async fn debit(&self, user_id: &Uuid, amount: i64) -> Result<i64, LedgerError> {
        if self.fail_debits.load(Ordering::SeqCst) {
            return Err(LedgerError::Storage("mock debit failure".into()));
        }
        let mut users = self.users.lock().unwrap();
        let entry = users.get_mut(user_id).ok_or(LedgerError::UserNotFound)?;
        entry.0 = if entry.0 >= amount { entry.0 - amount } else { 0 };
        Ok(entry.0)
    }

    fn invalidate_cache(&self, user_id: &Uuid) {
        if let Some(entry) = self.users.lock().unwrap().get_mut(user_id) {
            entry.1 += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// LLM
// ---------------------------------------------------------------------------

/// How the mock answers a streaming request.
#[derive(Clone)]
pub enum StreamScript {
    Deltas(Vec<String>),
    /// Error before any text.
    Fail,
    /// Emit these deltas, then error.
    FailAfter(Vec<String>),
}

#[derive(Clone)]
pub struct MockLlm {
    capabilities: ProviderCapabilities,
    script: StreamScript,
    complete_text: Option<String>,
    usage: Option<Usage>,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
    stream_calls: Arc<AtomicUsize>,
    complete_calls: Arc<AtomicUsize>,
}

impl MockLlm {
    pub fn streaming(deltas: &[&str]) -> Self {
        let text: String = deltas.concat();
        Self {
            capabilities: ProviderCapabilities {
                streaming: true,
                max_context_tokens: 128_000,
                max_output_tokens: 4_096,
            },
            script: StreamScript::Deltas(deltas.iter().map(|s| s.to_string()).collect()),
            complete_text: Some(text),
            usage: Some(Usage {
                input_tokens: 40,
                output_tokens: 10,
            }),
            requests: Arc::default(),
            stream_calls: Arc::default(),
            complete_calls: Arc::default(),
        }
    }

    pub fn with_script(mut self, script: StreamScript) -> Self {
        self.script = script;
        self
    }

    /// `None` makes `complete` fail.
    pub fn with_complete(mut self, text: Option<&str>) -> Self {
        self.complete_text = text.map(str::to_string);
        self
    }

    /// Advertise a provider that can only answer in one piece.
    pub fn without_streaming(mut self) -> Self {
        self.capabilities.streaming = false;
        self
    }

    pub fn with_usage(mut self, usage: Option<Usage>) -> Self {
        self.usage = usage;
        self
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    pub fn complete_calls(&self) -> usize {
        self.complete_calls.load(Ordering::SeqCst)
    }
}

impl LlmProvider for MockLlm {
    fn name(&self) -> &str {
        "mock"
    }

    fn capabilities(&self) -> &ProviderCapabilities {
        &self.capabilities
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        match &self.complete_text {
            Some(text) => Ok(CompletionResponse {
                id: "mock-complete".into(),
                content: text.clone(),
                model: request.model.clone(),
                stop_reason: StopReason::EndTurn,
                usage: self.usage,
            }),
            None => Err(LlmError::Provider {
                message: "mock complete failure".into(),
            }),
        }
    }

    fn stream(&self, request: CompletionRequest) -> LlmEventStream {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        let script = self.script.clone();
        let usage = self.usage;
        Box::pin(async_stream::stream! {
            yield Ok(StreamEvent::Connected);
            match script {
                StreamScript::Deltas(deltas) => {
                    for d in deltas {
                        yield Ok(StreamEvent::TextDelta { text: d });
                    }
                    yield Ok(StreamEvent::MessageDelta { stop_reason: StopReason::EndTurn });
                    if let Some(u) = usage {
                        yield Ok(StreamEvent::Usage(u));
                    }
                    yield Ok(StreamEvent::Done);
                }
                StreamScript::Fail => {
                    yield Err(LlmError::Stream("mock stream failure".into()));
                }
                StreamScript::FailAfter(deltas) => {
                    for d in deltas {
                        yield Ok(StreamEvent::TextDelta { text: d });
                    }
                    yield Err(LlmError::Stream("mock stream broke".into()));
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Speech
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MockSpeech {
    voices: Vec<VoiceInfo>,
    default_voice: Option<String>,
    streaming: bool,
    fail_synthesis: bool,
    /// Stream session yields no audio.
    silent_stream: bool,
    /// Stream session drops its input queue as soon as it opens.
    rejects_input: bool,
    synth_calls: Arc<AtomicUsize>,
    streamed_text: Arc<Mutex<String>>,
}

impl MockSpeech {
    pub fn new(streaming: bool) -> Self {
        Self {
            voices: vec![
                VoiceInfo {
                    id: "aria".into(),
                    provider: VoiceProvider::Azure,
                    format: "mp3".into(),
                },
                VoiceInfo {
                    id: "rachel".into(),
                    provider: VoiceProvider::ElevenLabs,
                    format: "mp3".into(),
                },
            ],
            default_voice: Some(if streaming { "rachel" } else { "aria" }.into()),
            streaming,
            fail_synthesis: false,
            silent_stream: false,
            rejects_input: false,
            synth_calls: Arc::default(),
            streamed_text: Arc::default(),
        }
    }

    pub fn failing(mut self) -> Self {
        self.fail_synthesis = true;
        self
    }

    pub fn silent(mut self) -> Self {
        self.silent_stream = true;
        self
    }

    pub fn rejecting_input(mut self) -> Self {
        self.rejects_input = true;
        self
    }

    pub fn synth_calls(&self) -> usize {
        self.synth_calls.load(Ordering::SeqCst)
    }

    pub fn streamed_text(&self) -> String {
        self.streamed_text.lock().unwrap().clone()
    }
}

impl SpeechProvider for MockSpeech {
    fn name(&self) -> &str {
        "mock-speech"
    }

    async fn list_voices(&self) -> Result<Vec<VoiceInfo>, SpeechError> {
        Ok(self.voices.clone())
    }

    fn default_voice_id(&self) -> Option<String> {
        self.default_voice.clone()
    }

    fn supports_streaming(&self, provider: VoiceProvider) -> bool {
        self.streaming && provider == VoiceProvider::ElevenLabs
    }

    async fn synthesize(
        &self,
        text: &str,
        params: &SpeechParams,
    ) -> Result<SynthesizedAudio, SpeechError> {
        self.synth_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_synthesis {
            return Err(SpeechError::Provider("mock synthesis failure".into()));
        }
        Ok(SynthesizedAudio {
            audio: text.as_bytes().to_vec(),
            format: "mp3".into(),
            sample_rate: 24_000,
            voice_id: params.voice_id.clone(),
            provider: params.provider,
        })
    }

    async fn open_stream(&self, _params: &SpeechParams) -> Result<SpeechStreamHandle, SpeechError> {
        let (handle, mut backend) = SpeechStreamHandle::channel(8, "mp3", 24_000);
        if self.rejects_input {
            drop(backend);
            return Ok(handle);
        }
        let silent = self.silent_stream;
        let streamed = self.streamed_text.clone();
        tokio::spawn(async move {
            let mut sequence = 0u32;
            while let Some(input) = backend.input.recv().await {
                match input {
                    SpeechInput::Text(text) => {
                        streamed.lock().unwrap().push_str(&text);
                        if silent {
                            continue;
                        }
                        let chunk = AudioChunk {
                            sequence,
                            data: text.into_bytes(),
                        };
                        sequence += 1;
                        if backend.chunks.send(Ok(chunk)).await.is_err() {
                            return;
                        }
                    }
                    SpeechInput::Finalize => return,
                }
            }
        });
        Ok(handle)
    }
}

// ---------------------------------------------------------------------------
// Persona & knowledge
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MockPersona {
    pub persona: Option<Persona>,
    pub chat_config: Option<PersonaChatConfig>,
}

impl MockPersona {
    pub fn new(agent_id: Uuid) -> Self {
        Self {
            persona: Some(Persona {
                id: agent_id,
                name: "Mira".into(),
                description: "A cheerful study buddy.".into(),
                system_prompt_override: None,
                language_default: Some("English".into()),
                first_turn_hint: Some("Greet the user warmly and ask their name.".into()),
                voice_id: None,
                voice_provider: None,
            }),
            chat_config: None,
        }
    }

    pub fn missing() -> Self {
        Self {
            persona: None,
            chat_config: None,
        }
    }
}

impl PersonaProvider for MockPersona {
    async fn get_persona(&self, _agent_id: &Uuid) -> Result<Persona, PersonaError> {
        self.persona.clone().ok_or(PersonaError::NotFound)
    }

    async fn get_chat_config(
        &self,
        _agent_id: &Uuid,
    ) -> Result<Option<PersonaChatConfig>, PersonaError> {
        Ok(self.chat_config.clone())
    }
}

#[derive(Clone)]
pub struct MockKnowledge {
    pub chunks: Option<Vec<KnowledgeChunk>>,
}

impl KnowledgeProvider for MockKnowledge {
    async fn query_top_chunks(
        &self,
        _agent_id: &Uuid,
        _query: &str,
        limit: usize,
    ) -> Result<Vec<KnowledgeChunk>, KnowledgeError> {
        match &self.chunks {
            Some(chunks) => Ok(chunks.iter().take(limit).cloned().collect()),
            None => Err(KnowledgeError::Unavailable),
        }
    }
}
