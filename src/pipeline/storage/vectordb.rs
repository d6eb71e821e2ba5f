use async_trait::async_trait;

use super::types::{KnowledgeIndex, ScoredChunk};
use super::StorageError;
use crate::db::SqliteStore;
use crate::models::KnowledgeChunk;

/// Cosine similarity. Mismatched lengths, zero vectors and non-finite
/// results all score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let score = dot / (norm_a.sqrt() * norm_b.sqrt());
    if score.is_finite() {
        score
    } else {
        0.0
    }
}

/// Top `k` chunks by descending similarity. The sort is stable, so equal
/// scores keep the order the chunks were indexed in.
pub fn rank_by_similarity(query: &[f32], chunks: &[KnowledgeChunk], k: usize) -> Vec<ScoredChunk> {
    let mut scored: Vec<(usize, f32)> = chunks
        .iter()
        .enumerate()
        .map(|(i, c)| (i, cosine_similarity(query, &c.embedding)))
        .collect();

    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.truncate(k);

    scored
        .into_iter()
        .map(|(i, score)| ScoredChunk {
            chunk: chunks[i].clone(),
            score,
        })
        .collect()
}

/// Brute-force cosine index held in memory. Immutable after construction,
/// so concurrent searches need no locking.
pub struct InMemoryKnowledgeIndex {
    dimension: usize,
    chunks: Vec<KnowledgeChunk>,
}

impl InMemoryKnowledgeIndex {
    /// Every chunk must carry an embedding of `dimension` floats.
    pub fn new(dimension: usize, chunks: Vec<KnowledgeChunk>) -> Result<Self, StorageError> {
        if let Some(bad) = chunks.iter().find(|c| c.embedding.len() != dimension) {
            return Err(StorageError::DimensionMismatch {
                expected: dimension,
                actual: bad.embedding.len(),
            });
        }
        Ok(Self { dimension, chunks })
    }

    pub fn empty(dimension: usize) -> Self {
        Self {
            dimension,
            chunks: Vec::new(),
        }
    }

    /// Load every stored chunk in insertion order. A chunk whose embedding
    /// dimension differs from the query model's is a fatal configuration error.
    pub fn load_from_store(store: &SqliteStore, dimension: usize) -> Result<Self, StorageError> {
        let chunks = store.load_knowledge_chunks()?;
        let index = Self::new(dimension, chunks)?;
        tracing::info!(chunks = index.chunks.len(), dimension, "Knowledge index loaded");
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

#[async_trait]
impl KnowledgeIndex for InMemoryKnowledgeIndex {
    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredChunk>, StorageError> {
        if query.len() != self.dimension {
            return Err(StorageError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        Ok(rank_by_similarity(query, &self.chunks, k))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn chunk_count(&self) -> Result<usize, StorageError> {
        Ok(self.chunks.len())
    }
}

/// Index that is never reachable. Used in tests of the degraded path.
pub struct UnreachableIndex {
    pub dimension: usize,
}

#[async_trait]
impl KnowledgeIndex for UnreachableIndex {
    async fn search(&self, _query: &[f32], _k: usize) -> Result<Vec<ScoredChunk>, StorageError> {
        Err(StorageError::IndexUnavailable("connection refused".into()))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn chunk_count(&self) -> Result<usize, StorageError> {
        Err(StorageError::IndexUnavailable("connection refused".into()))
    }
}
