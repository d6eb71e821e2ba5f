use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use uuid::Uuid;

use super::repository;
use super::sqlite::{open_database, open_memory_database};
use super::{ConversationStore, DatabaseError, DocumentStore};
use crate::models::{ConversationSession, Document, KnowledgeChunk, NewTurn, Turn};

/// SQLite-backed implementation of both storage interfaces.
///
/// Every call takes the connection lock for its whole duration; the work
/// under the lock is a handful of indexed statements.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        Ok(Self::from_connection(open_database(path)?))
    }

    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        Ok(Self::from_connection(open_memory_database()?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DatabaseError> {
        self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)
    }

    pub fn insert_knowledge_chunk(&self, chunk: &KnowledgeChunk) -> Result<(), DatabaseError> {
        repository::insert_knowledge_chunk(&*self.conn()?, chunk)
    }

    pub fn load_knowledge_chunks(&self) -> Result<Vec<KnowledgeChunk>, DatabaseError> {
        repository::load_knowledge_chunks(&*self.conn()?)
    }

    pub fn count_knowledge_chunks(&self) -> Result<usize, DatabaseError> {
        repository::count_knowledge_chunks(&*self.conn()?)
    }
}

impl DocumentStore for SqliteStore {
    fn save_document(&self, doc: &Document) -> Result<(), DatabaseError> {
        repository::upsert_document(&*self.conn()?, doc)
    }

    fn load_document(&self, id: &Uuid) -> Result<Option<Document>, DatabaseError> {
        repository::get_document(&*self.conn()?, id)
    }

    fn list_documents(&self, owner_id: &str) -> Result<Vec<Document>, DatabaseError> {
        repository::list_documents_by_owner(&*self.conn()?, owner_id)
    }

    fn delete_document(&self, id: &Uuid) -> Result<bool, DatabaseError> {
        repository::delete_document(&*self.conn()?, id)
    }

    fn ping(&self) -> Result<(), DatabaseError> {
        self.conn()?.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}

impl ConversationStore for SqliteStore {
    fn create_session(&self, session: &ConversationSession) -> Result<(), DatabaseError> {
        repository::insert_session(&*self.conn()?, session)
    }

    fn load_session(&self, id: &Uuid) -> Result<Option<ConversationSession>, DatabaseError> {
        repository::get_active_session(&*self.conn()?, id)
    }

    fn list_sessions(&self, owner_id: &str) -> Result<Vec<ConversationSession>, DatabaseError> {
        repository::list_sessions_by_owner(&*self.conn()?, owner_id)
    }

    fn set_session_title(&self, id: &Uuid, title: &str) -> Result<(), DatabaseError> {
        repository::update_session_title(&*self.conn()?, id, title)
    }

    fn append_turn(&self, session_id: &Uuid, turn: NewTurn) -> Result<Turn, DatabaseError> {
        repository::insert_turn(&*self.conn()?, session_id, turn)
    }

    fn load_history(&self, session_id: &Uuid) -> Result<Vec<Turn>, DatabaseError> {
        repository::get_turns(&*self.conn()?, session_id)
    }

    fn delete_session(&self, id: &Uuid) -> Result<bool, DatabaseError> {
        repository::delete_session(&*self.conn()?, id)
    }
}
