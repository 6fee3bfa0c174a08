//! CachedChatRepository -- read-through cache decorator over a ChatRepository.

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use companion_types::chat::{ChatMessage, Conversation, MessageCompletion, MessageExtras, NewMessage};
use companion_types::error::RepositoryError;

use super::{CachedMessages, ConversationKey, RecentMessageCache};
use crate::chat::repository::ChatRepository;

/// Wraps a store with a recent-message cache.
///
/// `recent_messages` reads the cache first. Message creation, finalization
/// and extras merges invalidate the (agent, user) entry before returning.
pub struct CachedChatRepository<R: ChatRepository, K: RecentMessageCache> {
    inner: Arc<R>,
    cache: Arc<K>,
}

impl<R: ChatRepository, K: RecentMessageCache> CachedChatRepository<R, K> {
    pub fn new(inner: Arc<R>, cache: Arc<K>) -> Self {
        Self { inner, cache }
    }

    async fn invalidate(&self, conversation: &Conversation) {
        let key = ConversationKey::new(conversation.agent_id, conversation.user_id);
        if let Err(e) = self.cache.invalidate(&key).await {
            warn!(conversation_id = %conversation.id, error = %e, "cache invalidation failed");
        }
    }

    /// Invalidate the entry holding `message_id`, resolved through the store.
    async fn invalidate_for_message(&self, message_id: &Uuid) {
        let conversation = match self.inner.get_message(message_id).await {
            Ok(Some(message)) => self.inner.get_conversation(&message.conversation_id).await,
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        };
        match conversation {
            Ok(Some(conversation)) => self.invalidate(&conversation).await,
            Ok(None) => debug!(%message_id, "no conversation to invalidate"),
            Err(e) => warn!(%message_id, error = %e, "cache invalidation lookup failed"),
        }
    }
}

impl<R: ChatRepository, K: RecentMessageCache> ChatRepository for CachedChatRepository<R, K> {
    async fn find_conversation(
        &self,
        agent_id: &Uuid,
        user_id: &Uuid,
    ) -> Result<Option<Conversation>, RepositoryError> {
        self.inner.find_conversation(agent_id, user_id).await
    }

    async fn get_or_create_conversation(
        &self,
        agent_id: &Uuid,
        user_id: &Uuid,
    ) -> Result<Conversation, RepositoryError> {
        self.inner.get_or_create_conversation(agent_id, user_id).await
    }

    async fn get_conversation(
        &self,
        conversation_id: &Uuid,
    ) -> Result<Option<Conversation>, RepositoryError> {
        self.inner.get_conversation(conversation_id).await
    }

    async fn append_message(
        &self,
        conversation: &Conversation,
        message: NewMessage,
    ) -> Result<ChatMessage, RepositoryError> {
        let saved = self.inner.append_message(conversation, message).await?;
        self.invalidate(conversation).await;
        Ok(saved)
    }

    async fn update_message_content(
        &self,
        message_id: &Uuid,
        content: &str,
    ) -> Result<(), RepositoryError> {
        self.inner.update_message_content(message_id, content).await
    }

    async fn finalize_message(
        &self,
        conversation: &Conversation,
        message_id: &Uuid,
        completion: &MessageCompletion,
    ) -> Result<(), RepositoryError> {
        self.inner
            .finalize_message(conversation, message_id, completion)
            .await?;
        self.invalidate(conversation).await;
        Ok(())
    }

    async fn merge_message_extras(
        &self,
        message_id: &Uuid,
        patch: &MessageExtras,
    ) -> Result<MessageExtras, RepositoryError> {
        let merged = self.inner.merge_message_extras(message_id, patch).await?;
        self.invalidate_for_message(message_id).await;
        Ok(merged)
    }

    async fn get_message(&self, message_id: &Uuid) -> Result<Option<ChatMessage>, RepositoryError> {
        self.inner.get_message(message_id).await
    }

    async fn recent_messages(
        &self,
        conversation: &Conversation,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, RepositoryError> {
        let key = ConversationKey::new(conversation.agent_id, conversation.user_id);
        match self.cache.get(&key).await {
            Ok(Some(entry)) => {
                if let Some(messages) = entry.serve(limit) {
                    debug!(conversation_id = %conversation.id, limit, "recent messages cache hit");
                    return Ok(messages);
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(conversation_id = %conversation.id, error = %e, "cache read failed, using store");
            }
        }

        let messages = self.inner.recent_messages(conversation, limit).await?;
        let entry = CachedMessages {
            limit,
            messages: messages.clone(),
        };
        if let Err(e) = self.cache.put(&key, entry).await {
            warn!(conversation_id = %conversation.id, error = %e, "cache populate failed");
        }
        Ok(messages)
    }

    async fn count_messages(&self, conversation_id: &Uuid) -> Result<i64, RepositoryError> {
        self.inner.count_messages(conversation_id).await
    }

    async fn latest_seq(&self, conversation_id: &Uuid) -> Result<Option<i64>, RepositoryError> {
        self.inner.latest_seq(conversation_id).await
    }

    async fn has_assistant_reply(&self, conversation_id: &Uuid) -> Result<bool, RepositoryError> {
        self.inner.has_assistant_reply(conversation_id).await
    }

    async fn add_conversation_tokens(
        &self,
        conversation_id: &Uuid,
        input: i64,
        output: i64,
    ) -> Result<(), RepositoryError> {
        self.inner
            .add_conversation_tokens(conversation_id, input, output)
            .await
    }

    async fn save_summary(
        &self,
        conversation_id: &Uuid,
        summary: &str,
        through_seq: i64,
    ) -> Result<(), RepositoryError> {
        self.inner
            .save_summary(conversation_id, summary, through_seq)
            .await
    }
}
