use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{SessionState, TurnRole};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSession {
    pub id: Uuid,
    pub owner_id: String,
    pub title: Option<String>,
    /// Report the conversation is about, if any.
    pub document_id: Option<Uuid>,
    pub state: SessionState,
    pub created_at: NaiveDateTime,
    /// Bumped on every appended turn; drives newest-first listing.
    pub updated_at: NaiveDateTime,
}

impl ConversationSession {
    pub fn new(owner_id: &str, document_id: Option<Uuid>) -> Self {
        let now = chrono::Local::now().naive_local();
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            title: None,
            document_id,
            state: SessionState::Active,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One appended message. `seq` is assigned by the store and starts at 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub session_id: Uuid,
    pub seq: u32,
    pub role: TurnRole,
    pub content: String,
    /// Set on assistant turns whose stream ended with a truncation marker.
    pub truncated: bool,
    pub created_at: NaiveDateTime,
}

/// A turn before the store has ordered it.
#[derive(Debug, Clone)]
pub struct NewTurn {
    pub role: TurnRole,
    pub content: String,
    pub truncated: bool,
}

impl NewTurn {
    pub fn user(content: &str) -> Self {
        Self {
            role: TurnRole::User,
            content: content.to_string(),
            truncated: false,
        }
    }

    pub fn assistant(content: &str, truncated: bool) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.to_string(),
            truncated,
        }
    }
}
