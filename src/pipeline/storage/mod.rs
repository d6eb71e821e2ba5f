pub mod types;
pub mod embedder;
pub mod vectordb;

pub use embedder::*;
pub use types::*;
pub use vectordb::*;

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::db::DatabaseError;

/// Dimension of all-MiniLM-L6-v2 sentence embeddings. Knowledge chunks and
/// query vectors must share it.
pub const EMBEDDING_DIM: usize = 384;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Embedding model not found: {0}")]
    ModelNotFound(PathBuf),

    #[error("Embedding model initialization: {0}")]
    ModelInit(String),

    #[error("Tokenization error: {0}")]
    Tokenization(String),

    #[error("Embedding generation failed: {0}")]
    Embedding(String),

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Knowledge index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Worker task failed: {0}")]
    Worker(String),
}

impl StorageError {
    /// Failures worth retrying with backoff. Missing models and dimension
    /// mismatches are configuration problems and never clear up on their own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Embedding(_) | Self::IndexUnavailable(_) | Self::Timeout(_) | Self::Worker(_)
        )
    }
}
