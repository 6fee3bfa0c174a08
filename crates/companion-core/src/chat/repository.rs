//! ChatRepository trait definition.
//!
//! Conversations, messages and their extras. Follows the RPITIT pattern
//! used by every repository port in this crate.

use companion_types::chat::{ChatMessage, Conversation, MessageCompletion, MessageExtras, NewMessage};
use companion_types::error::RepositoryError;
use uuid::Uuid;

/// Repository trait for conversation and message persistence.
///
/// Implementations live in companion-infra (e.g., `SqliteChatRepository`).
/// Message-writing methods take the owning [`Conversation`] so decorators
/// can key side effects on the (agent, user) pair.
pub trait ChatRepository: Send + Sync {
    /// Look up the conversation for an (agent, user) pair.
    fn find_conversation(
        &self,
        agent_id: &Uuid,
        user_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Conversation>, RepositoryError>> + Send;

    /// Return the (agent, user) conversation, creating it if absent.
    fn get_or_create_conversation(
        &self,
        agent_id: &Uuid,
        user_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Conversation, RepositoryError>> + Send;

    fn get_conversation(
        &self,
        conversation_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Conversation>, RepositoryError>> + Send;

    /// Insert a message at `max(seq) + 1` and advance the conversation's
    /// `last_msg_at`, both in one transaction.
    fn append_message(
        &self,
        conversation: &Conversation,
        message: NewMessage,
    ) -> impl std::future::Future<Output = Result<ChatMessage, RepositoryError>> + Send;

    /// Overwrite the content of a streaming assistant message.
    fn update_message_content(
        &self,
        message_id: &Uuid,
        content: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Write the settled columns of an assistant message.
    fn finalize_message(
        &self,
        conversation: &Conversation,
        message_id: &Uuid,
        completion: &MessageCompletion,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Read the stored extras, overlay `patch`, write back. One transaction.
    /// Returns the merged document.
    fn merge_message_extras(
        &self,
        message_id: &Uuid,
        patch: &MessageExtras,
    ) -> impl std::future::Future<Output = Result<MessageExtras, RepositoryError>> + Send;

    fn get_message(
        &self,
        message_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ChatMessage>, RepositoryError>> + Send;

    /// Up to `limit` most recent messages, oldest first.
    fn recent_messages(
        &self,
        conversation: &Conversation,
        limit: usize,
    ) -> impl std::future::Future<Output = Result<Vec<ChatMessage>, RepositoryError>> + Send;

    fn count_messages(
        &self,
        conversation_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<i64, RepositoryError>> + Send;

    /// Highest assigned `seq`, `None` for an empty conversation.
    fn latest_seq(
        &self,
        conversation_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<i64>, RepositoryError>> + Send;

    /// Whether an assistant message with non-empty content exists.
    fn has_assistant_reply(
        &self,
        conversation_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Add to the conversation's token sums. Negative deltas are ignored.
    fn add_conversation_tokens(
        &self,
        conversation_id: &Uuid,
        input: i64,
        output: i64,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn save_summary(
        &self,
        conversation_id: &Uuid,
        summary: &str,
        through_seq: i64,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
