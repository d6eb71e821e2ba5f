pub mod sqlite;
pub mod repository;
pub mod store;

pub use sqlite::*;
pub use store::SqliteStore;

use thiserror::Error;
use uuid::Uuid;

use crate::models::{ConversationSession, Document, NewTurn, Turn};

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Invalid enum value for {field}: {value}")]
    InvalidEnum { field: String, value: String },

    #[error("Migration failed at version {version}: {reason}")]
    MigrationFailed { version: i64, reason: String },

    #[error("Constraint violated: {0}")]
    ConstraintViolation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,
}

impl DatabaseError {
    pub fn not_found(entity_type: &str, id: &Uuid) -> Self {
        Self::NotFound {
            entity_type: entity_type.to_string(),
            id: id.to_string(),
        }
    }
}

/// Durable storage for report metadata and metrics.
pub trait DocumentStore: Send + Sync {
    /// Insert or update. Rows already in a terminal status are never rewritten.
    fn save_document(&self, doc: &Document) -> Result<(), DatabaseError>;

    fn load_document(&self, id: &Uuid) -> Result<Option<Document>, DatabaseError>;

    /// Newest first.
    fn list_documents(&self, owner_id: &str) -> Result<Vec<Document>, DatabaseError>;

    fn delete_document(&self, id: &Uuid) -> Result<bool, DatabaseError>;

    /// Cheap liveness probe used by the health report.
    fn ping(&self) -> Result<(), DatabaseError> {
        Ok(())
    }
}

/// Durable storage for sessions and their append-only turn log.
pub trait ConversationStore: Send + Sync {
    fn create_session(&self, session: &ConversationSession) -> Result<(), DatabaseError>;

    /// Active sessions only; deleted sessions load as `None`.
    fn load_session(&self, id: &Uuid) -> Result<Option<ConversationSession>, DatabaseError>;

    /// Active sessions of `owner_id`, most recently updated first.
    fn list_sessions(&self, owner_id: &str) -> Result<Vec<ConversationSession>, DatabaseError>;

    fn set_session_title(&self, id: &Uuid, title: &str) -> Result<(), DatabaseError>;

    /// Appends after the current last turn and returns the stored turn with its `seq`.
    fn append_turn(&self, session_id: &Uuid, turn: NewTurn) -> Result<Turn, DatabaseError>;

    /// Turns in append order.
    fn load_history(&self, session_id: &Uuid) -> Result<Vec<Turn>, DatabaseError>;

    /// Marks the session deleted and drops its turns. Returns false if it was not active.
    fn delete_session(&self, id: &Uuid) -> Result<bool, DatabaseError>;
}
