//! Recent-message cache port and the read-through repository decorator.
//!
//! The cache is strictly best-effort: backend errors are logged and the
//! durable store answers instead.

pub mod repository;

pub use repository::CachedChatRepository;

use companion_types::chat::ChatMessage;
use companion_types::error::CacheError;
use uuid::Uuid;

/// Cache key: one entry per (agent, user) conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    pub agent_id: Uuid,
    pub user_id: Uuid,
}

impl ConversationKey {
    pub fn new(agent_id: Uuid, user_id: Uuid) -> Self {
        Self { agent_id, user_id }
    }
}

/// The last messages of a conversation as read from the store.
#[derive(Debug, Clone)]
pub struct CachedMessages {
    /// Limit the store was queried with.
    pub limit: usize,
    /// Oldest first.
    pub messages: Vec<ChatMessage>,
}

impl CachedMessages {
    /// Serve a read for `limit` messages if this entry holds enough.
    ///
    /// An entry shorter than its own limit holds the whole conversation and
    /// can answer any limit.
    pub fn serve(&self, limit: usize) -> Option<Vec<ChatMessage>> {
        if limit <= self.limit || self.messages.len() < self.limit {
            let skip = self.messages.len().saturating_sub(limit);
            Some(self.messages[skip..].to_vec())
        } else {
            None
        }
    }
}

/// Backend for the recent-message cache.
///
/// Implementations live in companion-infra (e.g., `InMemoryMessageCache`).
pub trait RecentMessageCache: Send + Sync {
    fn get(
        &self,
        key: &ConversationKey,
    ) -> impl std::future::Future<Output = Result<Option<CachedMessages>, CacheError>> + Send;

    fn put(
        &self,
        key: &ConversationKey,
        entry: CachedMessages,
    ) -> impl std::future::Future<Output = Result<(), CacheError>> + Send;

    fn invalidate(
        &self,
        key: &ConversationKey,
    ) -> impl std::future::Future<Output = Result<(), CacheError>> + Send;
}
