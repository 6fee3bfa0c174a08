//! Optional knowledge-base enrichment port.

use std::future::Future;
use std::pin::Pin;

use uuid::Uuid;

use companion_types::knowledge::{KnowledgeChunk, KnowledgeError};

/// Number of chunks folded into a turn's context.
pub const KNOWLEDGE_CHUNK_LIMIT: usize = 3;

pub trait KnowledgeProvider: Send + Sync {
    fn query_top_chunks(
        &self,
        agent_id: &Uuid,
        query: &str,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<KnowledgeChunk>, KnowledgeError>> + Send;
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait KnowledgeProviderDyn: Send + Sync {
    fn query_top_chunks_boxed<'a>(
        &'a self,
        agent_id: &'a Uuid,
        query: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<KnowledgeChunk>, KnowledgeError>>;
}

impl<T: KnowledgeProvider> KnowledgeProviderDyn for T {
    fn query_top_chunks_boxed<'a>(
        &'a self,
        agent_id: &'a Uuid,
        query: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<KnowledgeChunk>, KnowledgeError>> {
        Box::pin(self.query_top_chunks(agent_id, query, limit))
    }
}

/// Type-erased knowledge provider.
pub struct BoxKnowledgeProvider {
    inner: Box<dyn KnowledgeProviderDyn + Send + Sync>,
}

impl BoxKnowledgeProvider {
    pub fn new<T: KnowledgeProvider + 'static>(provider: T) -> Self {
        Self {
            inner: Box::new(provider),
        }
    }

    pub async fn query_top_chunks(
        &self,
        agent_id: &Uuid,
        query: &str,
        limit: usize,
    ) -> Result<Vec<KnowledgeChunk>, KnowledgeError> {
        self.inner.query_top_chunks_boxed(agent_id, query, limit).await
    }
}
