use std::sync::Arc;
use std::time::Duration;

use super::types::RetrievalResult;
use crate::config::RetryPolicy;
use crate::pipeline::storage::{KnowledgeIndex, StorageError};

/// Queries the knowledge index with a timeout and bounded retry.
///
/// Never fails a chat turn: an unreachable, slow or broken index yields an
/// empty, `degraded` result and the answer is grounded on the report and
/// history alone.
pub struct Retriever {
    index: Arc<dyn KnowledgeIndex>,
    timeout: Duration,
    retry: RetryPolicy,
    max_k: usize,
}

impl Retriever {
    pub fn new(index: Arc<dyn KnowledgeIndex>, timeout: Duration, retry: RetryPolicy, max_k: usize) -> Self {
        Self {
            index,
            timeout,
            retry,
            max_k: max_k.max(1),
        }
    }

    pub fn clamp_k(&self, k: usize) -> usize {
        k.clamp(1, self.max_k)
    }

    pub fn index(&self) -> &Arc<dyn KnowledgeIndex> {
        &self.index
    }

    pub async fn retrieve(&self, query: &[f32], k: usize) -> RetrievalResult {
        let k = self.clamp_k(k);
        let attempts = self.retry.max_attempts.max(1);

        let mut attempt = 1;
        loop {
            let outcome = match tokio::time::timeout(self.timeout, self.index.search(query, k)).await {
                Ok(result) => result,
                Err(_) => Err(StorageError::Timeout(self.timeout)),
            };

            match outcome {
                Ok(chunks) => {
                    tracing::debug!(k, hits = chunks.len(), "Knowledge retrieved");
                    return RetrievalResult {
                        chunks,
                        degraded: false,
                    };
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::debug!(attempt, error = %e, "Retrieval failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Retrieval degraded to empty result");
                    return RetrievalResult::degraded();
                }
            }
        }
    }
}
