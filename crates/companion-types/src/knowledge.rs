//! Knowledge-base chunks used as optional context enrichment.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeChunk {
    pub text: String,
    pub score: f32,
    pub source: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum KnowledgeError {
    #[error("knowledge provider unavailable")]
    Unavailable,

    #[error("knowledge query failed: {0}")]
    Query(String),
}
