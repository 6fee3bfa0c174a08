use thiserror::Error;

use crate::knowledge::KnowledgeError;
use crate::llm::LlmError;

/// Errors from repository operations (used by trait definitions in companion-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors from the identity collaborator and token ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("user not found")]
    UserNotFound,

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<RepositoryError> for LedgerError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound => LedgerError::UserNotFound,
            other => LedgerError::Storage(other.to_string()),
        }
    }
}

/// Errors from the persona collaborator.
#[derive(Debug, Error)]
pub enum PersonaError {
    #[error("persona not found")]
    NotFound,

    #[error("persona provider unavailable: {0}")]
    Unavailable(String),
}

/// Errors from a recent-message cache backend. Never surfaced to callers.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("cache entry corrupt: {0}")]
    Corrupt(String),
}

/// Terminal outcome of a conversation turn.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("insufficient token balance ({balance})")]
    InsufficientBalance { balance: i64 },

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Persona(#[from] PersonaError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Knowledge(#[from] KnowledgeError),

    #[error("turn cancelled")]
    Cancelled,
}
