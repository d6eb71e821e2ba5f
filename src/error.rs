//! Errors surfaced by the core, with stable machine-readable codes.

use serde::Serialize;
use uuid::Uuid;

use crate::config::ConfigError;
use crate::db::DatabaseError;
use crate::pipeline::extraction::metrics::VocabularyError;
use crate::pipeline::rag::RagError;
use crate::pipeline::storage::StorageError;

/// Structured error body for whatever transport sits in front of the core.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ExtractionFailed,
    PayloadTooLarge,
    EmbeddingUnavailable,
    TemporarilyUnavailable,
    GenerationFailed,
    SessionNotFound,
    SessionBusy,
    DocumentNotFound,
    InvalidInput,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExtractionFailed => "EXTRACTION_FAILED",
            Self::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            Self::EmbeddingUnavailable => "EMBEDDING_UNAVAILABLE",
            Self::TemporarilyUnavailable => "TEMPORARILY_UNAVAILABLE",
            Self::GenerationFailed => "GENERATION_FAILED",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::SessionBusy => "SESSION_BUSY",
            Self::DocumentNotFound => "DOCUMENT_NOT_FOUND",
            Self::InvalidInput => "INVALID_INPUT",
            Self::Internal => "INTERNAL",
        }
    }

    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TemporarilyUnavailable | Self::SessionBusy | Self::GenerationFailed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Extraction failed for document {document_id}: {reason}")]
    ExtractionFailed { document_id: Uuid, reason: String },

    #[error("Upload of {size} bytes exceeds the limit of {limit} bytes")]
    PayloadTooLarge { size: u64, limit: u64 },

    #[error("Embedding model unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Temporarily unavailable: {0}")]
    TemporarilyUnavailable(String),

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("Session busy: {0}")]
    SessionBusy(Uuid),

    #[error("Document not found: {0}")]
    DocumentNotFound(Uuid),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ExtractionFailed { .. } => ErrorKind::ExtractionFailed,
            Self::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            Self::EmbeddingUnavailable(_) => ErrorKind::EmbeddingUnavailable,
            Self::TemporarilyUnavailable(_) => ErrorKind::TemporarilyUnavailable,
            Self::GenerationFailed(_) => ErrorKind::GenerationFailed,
            Self::SessionNotFound(_) => ErrorKind::SessionNotFound,
            Self::SessionBusy(_) => ErrorKind::SessionBusy,
            Self::DocumentNotFound(_) => ErrorKind::DocumentNotFound,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// User-facing message. Library and upstream detail stays in the logs.
    pub fn message(&self) -> String {
        match self {
            Self::ExtractionFailed { reason, .. } => format!("Could not read the report: {reason}"),
            Self::PayloadTooLarge { limit, .. } => {
                format!("File is too large (limit {} MB)", limit / (1024 * 1024))
            }
            Self::EmbeddingUnavailable(_) => "The language model is not available".to_string(),
            Self::TemporarilyUnavailable(_) => "Service temporarily unavailable, please retry".to_string(),
            Self::GenerationFailed(_) => "Could not generate an answer, please try again".to_string(),
            Self::SessionNotFound(_) => "Conversation not found".to_string(),
            Self::SessionBusy(_) => "An answer is still being generated for this conversation".to_string(),
            Self::DocumentNotFound(_) => "Report not found".to_string(),
            Self::InvalidInput(detail) => detail.clone(),
            Self::Internal(detail) => {
                tracing::error!(detail, "Core internal error");
                "An internal error occurred".to_string()
            }
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            error: ErrorDetail {
                code: self.kind().as_str(),
                message: self.message(),
            },
        }
    }
}

impl From<DatabaseError> for CoreError {
    fn from(err: DatabaseError) -> Self {
        CoreError::Internal(err.to_string())
    }
}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Database(e) => e.into(),
            StorageError::ModelNotFound(_)
            | StorageError::ModelInit(_)
            | StorageError::DimensionMismatch { .. } => CoreError::EmbeddingUnavailable(err.to_string()),
            e if e.is_transient() => CoreError::TemporarilyUnavailable(e.to_string()),
            e => CoreError::Internal(e.to_string()),
        }
    }
}

impl From<RagError> for CoreError {
    fn from(err: RagError) -> Self {
        match err {
            RagError::SessionNotFound(id) => CoreError::SessionNotFound(id),
            RagError::SessionBusy(id) => CoreError::SessionBusy(id),
            RagError::DocumentNotFound(id) => CoreError::DocumentNotFound(id),
            RagError::InvalidQuery(e) => CoreError::InvalidInput(e.to_string()),
            RagError::Storage(e) => e.into(),
            RagError::Database(e) => e.into(),
            e @ (RagError::ModelConnection(_)
            | RagError::ModelUnavailable(_)
            | RagError::ModelResponse { .. }
            | RagError::StreamingError(_)
            | RagError::ResponseParsing(_)
            | RagError::GenerationFailed(_)
            | RagError::Timeout(_)) => CoreError::GenerationFailed(e.to_string()),
        }
    }
}

impl From<ConfigError> for CoreError {
    fn from(err: ConfigError) -> Self {
        CoreError::InvalidInput(err.to_string())
    }
}

impl From<VocabularyError> for CoreError {
    fn from(err: VocabularyError) -> Self {
        CoreError::Internal(err.to_string())
    }
}
