use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use super::RagError;
use crate::db::{ConversationStore, DatabaseError, DocumentStore};
use crate::models::enums::TurnRole;
use crate::models::{ConversationSession, Document, NewTurn, Turn};

const TITLE_CHARS: usize = 50;

/// Session title from the first user message: its first 50 chars, with an
/// ellipsis when cut.
pub fn derive_title(first_message: &str) -> String {
    let trimmed = first_message.trim();
    let mut title: String = trimmed.chars().take(TITLE_CHARS).collect();
    if trimmed.chars().count() > TITLE_CHARS {
        title.push_str("...");
    }
    title
}

/// Marks one session as having a generation in flight. Released on drop.
#[derive(Debug)]
pub struct SessionPermit {
    session_id: Uuid,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

impl SessionPermit {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        // A poisoned set still holds valid ids.
        let mut set = match self.in_flight.lock() {
            Ok(set) => set,
            Err(poisoned) => poisoned.into_inner(),
        };
        set.remove(&self.session_id);
    }
}

/// Per-user session lifecycle, append-only history and the
/// one-generation-per-session rule.
///
/// Sessions of another owner behave exactly like missing ones.
pub struct SessionCoordinator {
    sessions: Arc<dyn ConversationStore>,
    documents: Arc<dyn DocumentStore>,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

impl SessionCoordinator {
    pub fn new(sessions: Arc<dyn ConversationStore>, documents: Arc<dyn DocumentStore>) -> Self {
        Self {
            sessions,
            documents,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Start a session, optionally about one of the owner's documents.
    pub fn create(&self, owner_id: &str, document_id: Option<Uuid>) -> Result<ConversationSession, RagError> {
        if let Some(doc_id) = document_id {
            self.owned_document(owner_id, &doc_id)?;
        }
        let session = ConversationSession::new(owner_id, document_id);
        self.sessions.create_session(&session)?;
        tracing::info!(session_id = %session.id, has_document = document_id.is_some(), "Session created");
        Ok(session)
    }

    pub fn get(&self, owner_id: &str, session_id: &Uuid) -> Result<ConversationSession, RagError> {
        self.sessions
            .load_session(session_id)?
            .filter(|s| s.owner_id == owner_id)
            .ok_or(RagError::SessionNotFound(*session_id))
    }

    /// Newest first.
    pub fn list(&self, owner_id: &str) -> Result<Vec<ConversationSession>, RagError> {
        Ok(self.sessions.list_sessions(owner_id)?)
    }

    pub fn history(&self, owner_id: &str, session_id: &Uuid) -> Result<Vec<Turn>, RagError> {
        self.get(owner_id, session_id)?;
        Ok(self.sessions.load_history(session_id)?)
    }

    /// Append a turn. The first user turn also names the session.
    pub fn append(&self, owner_id: &str, session_id: &Uuid, turn: NewTurn) -> Result<Turn, RagError> {
        let session = self.get(owner_id, session_id)?;
        let needs_title = session.title.is_none() && turn.role == TurnRole::User;
        let title_source = needs_title.then(|| derive_title(&turn.content));

        let appended = self.sessions.append_turn(session_id, turn).map_err(|e| match e {
            DatabaseError::NotFound { .. } => RagError::SessionNotFound(*session_id),
            other => RagError::Database(other),
        })?;

        if let Some(title) = title_source.filter(|t| !t.is_empty()) {
            if let Err(e) = self.sessions.set_session_title(session_id, &title) {
                tracing::warn!(session_id = %session_id, error = %e, "Could not set session title");
            }
        }
        Ok(appended)
    }

    pub fn delete(&self, owner_id: &str, session_id: &Uuid) -> Result<(), RagError> {
        self.get(owner_id, session_id)?;
        if !self.sessions.delete_session(session_id)? {
            return Err(RagError::SessionNotFound(*session_id));
        }
        tracing::info!(session_id = %session_id, "Session deleted");
        Ok(())
    }

    /// Claim the session for one generation. A second claim while the first
    /// permit is alive fails with `SessionBusy`.
    pub fn try_begin(&self, session_id: &Uuid) -> Result<SessionPermit, RagError> {
        let mut set = self
            .in_flight
            .lock()
            .map_err(|_| RagError::Database(DatabaseError::LockPoisoned))?;
        if !set.insert(*session_id) {
            return Err(RagError::SessionBusy(*session_id));
        }
        Ok(SessionPermit {
            session_id: *session_id,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    pub fn is_busy(&self, session_id: &Uuid) -> bool {
        self.in_flight
            .lock()
            .map(|set| set.contains(session_id))
            .unwrap_or(false)
    }

    /// The session's document, if it still exists and belongs to the owner.
    pub fn session_document(&self, session: &ConversationSession) -> Result<Option<Document>, RagError> {
        let Some(doc_id) = session.document_id else {
            return Ok(None);
        };
        Ok(self
            .documents
            .load_document(&doc_id)?
            .filter(|d| d.owner_id == session.owner_id))
    }

    fn owned_document(&self, owner_id: &str, id: &Uuid) -> Result<Document, RagError> {
        self.documents
            .load_document(id)?
            .filter(|d| d.owner_id == owner_id)
            .ok_or(RagError::DocumentNotFound(*id))
    }
}
