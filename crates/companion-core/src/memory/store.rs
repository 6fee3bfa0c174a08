//! ProfileRepository trait definition.

use serde_json::{Map, Value};
use uuid::Uuid;

use companion_types::chat::UserAgentMemory;
use companion_types::error::RepositoryError;

/// Persistence for the per (agent, user) memory row.
///
/// Implementations live in companion-infra (e.g., `SqliteProfileRepository`).
pub trait ProfileRepository: Send + Sync {
    fn get_memory(
        &self,
        agent_id: &Uuid,
        user_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<UserAgentMemory>, RepositoryError>> + Send;

    /// Merge `preferences` into the stored preference document, creating the
    /// row if needed. Returns the updated row.
    fn upsert_preferences(
        &self,
        agent_id: &Uuid,
        user_id: &Uuid,
        preferences: &Map<String, Value>,
    ) -> impl std::future::Future<Output = Result<UserAgentMemory, RepositoryError>> + Send;
}
