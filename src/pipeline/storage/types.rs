use async_trait::async_trait;

use super::StorageError;
use crate::models::KnowledgeChunk;

/// Text → fixed-dimension vector. Implementations are loaded once and shared
/// read-only, so `embed` takes `&self` and must be deterministic.
pub trait EmbeddingModel: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>, StorageError>;
    fn dimension(&self) -> usize;
}

/// A knowledge chunk paired with its cosine similarity to the query.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: KnowledgeChunk,
    pub score: f32,
}

/// Read-only similarity search over pre-built knowledge chunks.
#[async_trait]
pub trait KnowledgeIndex: Send + Sync {
    /// Up to `k` chunks, highest similarity first, ties in insertion order.
    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredChunk>, StorageError>;

    fn dimension(&self) -> usize;

    async fn chunk_count(&self) -> Result<usize, StorageError>;
}
