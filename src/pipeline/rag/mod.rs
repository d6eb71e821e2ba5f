pub mod types;
pub mod retrieval;
pub mod context;
pub mod prompt;
pub mod ollama;
pub mod generation;
pub mod conversation;
pub mod orchestrator;

pub use types::*;

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::db::DatabaseError;
use crate::pipeline::safety::SafetyError;
use crate::pipeline::storage::StorageError;

#[derive(Error, Debug)]
pub enum RagError {
    #[error("Model endpoint connection failed: {0}")]
    ModelConnection(String),

    #[error("Model not available on endpoint: {0}")]
    ModelUnavailable(String),

    #[error("Model endpoint returned {status}: {body}")]
    ModelResponse { status: u16, body: String },

    #[error("Streaming error: {0}")]
    StreamingError(String),

    #[error("Response parsing error: {0}")]
    ResponseParsing(String),

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Invalid query: {0}")]
    InvalidQuery(#[from] SafetyError),

    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("Session {0} already has a generation in flight")]
    SessionBusy(Uuid),

    #[error("Document not found: {0}")]
    DocumentNotFound(Uuid),
}
