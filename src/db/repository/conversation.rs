use std::str::FromStr;

use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::{now, parse_uuid};
use crate::db::DatabaseError;
use crate::models::enums::{SessionState, TurnRole};
use crate::models::{ConversationSession, NewTurn, Turn};

pub fn insert_session(conn: &Connection, session: &ConversationSession) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO sessions (id, owner_id, title, document_id, state, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            session.id.to_string(),
            session.owner_id,
            session.title,
            session.document_id.map(|d| d.to_string()),
            session.state.as_str(),
            session.created_at,
            session.updated_at,
        ],
    )?;
    Ok(())
}

pub fn get_active_session(
    conn: &Connection,
    id: &Uuid,
) -> Result<Option<ConversationSession>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT id, owner_id, title, document_id, state, created_at, updated_at
             FROM sessions WHERE id = ?1 AND state = 'active'",
            params![id.to_string()],
            read_session_row,
        )
        .optional()?;

    row.map(session_from_row).transpose()
}

/// Active sessions of `owner_id`, most recently updated first.
pub fn list_sessions_by_owner(
    conn: &Connection,
    owner_id: &str,
) -> Result<Vec<ConversationSession>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, owner_id, title, document_id, state, created_at, updated_at
         FROM sessions WHERE owner_id = ?1 AND state = 'active'
         ORDER BY updated_at DESC, rowid DESC",
    )?;

    let rows = stmt.query_map(params![owner_id], read_session_row)?;

    let mut sessions = Vec::new();
    for row in rows {
        sessions.push(session_from_row(row?)?);
    }
    Ok(sessions)
}

pub fn update_session_title(conn: &Connection, id: &Uuid, title: &str) -> Result<(), DatabaseError> {
    let affected = conn.execute(
        "UPDATE sessions SET title = ?1 WHERE id = ?2 AND state = 'active'",
        params![title, id.to_string()],
    )?;
    if affected == 0 {
        return Err(DatabaseError::not_found("session", id));
    }
    Ok(())
}

/// Append a turn with the next sequence number.
///
/// Callers hold the connection lock for the whole call, so the
/// read-max-then-insert pair cannot interleave with another append.
/// The `(session_id, seq)` primary key rejects it if it ever did.
pub fn insert_turn(conn: &Connection, session_id: &Uuid, turn: NewTurn) -> Result<Turn, DatabaseError> {
    let sid = session_id.to_string();

    let active: Option<String> = conn
        .query_row(
            "SELECT state FROM sessions WHERE id = ?1",
            params![sid],
            |row| row.get(0),
        )
        .optional()?;
    match active.as_deref() {
        Some("active") => {}
        _ => return Err(DatabaseError::not_found("session", session_id)),
    }

    let last: i64 = conn.query_row(
        "SELECT COALESCE(MAX(seq), 0) FROM turns WHERE session_id = ?1",
        params![sid],
        |row| row.get(0),
    )?;
    let seq = last + 1;
    let created_at = now();

    conn.execute(
        "INSERT INTO turns (session_id, seq, role, content, truncated, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![sid, seq, turn.role.as_str(), turn.content, turn.truncated, created_at],
    )?;
    conn.execute(
        "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
        params![created_at, sid],
    )?;

    Ok(Turn {
        session_id: *session_id,
        seq: seq as u32,
        role: turn.role,
        content: turn.content,
        truncated: turn.truncated,
        created_at,
    })
}

pub fn get_turns(conn: &Connection, session_id: &Uuid) -> Result<Vec<Turn>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT session_id, seq, role, content, truncated, created_at
         FROM turns WHERE session_id = ?1 ORDER BY seq ASC",
    )?;

    let rows = stmt.query_map(params![session_id.to_string()], |row| {
        Ok(TurnRow {
            session_id: row.get(0)?,
            seq: row.get(1)?,
            role: row.get(2)?,
            content: row.get(3)?,
            truncated: row.get(4)?,
            created_at: row.get(5)?,
        })
    })?;

    let mut turns = Vec::new();
    for row in rows {
        turns.push(turn_from_row(row?)?);
    }
    Ok(turns)
}

/// Soft-delete the session and drop its turns in one transaction.
pub fn delete_session(conn: &Connection, id: &Uuid) -> Result<bool, DatabaseError> {
    let tx = conn.unchecked_transaction()?;
    let affected = tx.execute(
        "UPDATE sessions SET state = 'deleted', updated_at = ?1 WHERE id = ?2 AND state = 'active'",
        params![now(), id.to_string()],
    )?;
    if affected > 0 {
        tx.execute(
            "DELETE FROM turns WHERE session_id = ?1",
            params![id.to_string()],
        )?;
    }
    tx.commit()?;
    Ok(affected > 0)
}

struct SessionRow {
    id: String,
    owner_id: String,
    title: Option<String>,
    document_id: Option<String>,
    state: String,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
}

fn read_session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        title: row.get(2)?,
        document_id: row.get(3)?,
        state: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn session_from_row(row: SessionRow) -> Result<ConversationSession, DatabaseError> {
    Ok(ConversationSession {
        id: parse_uuid("sessions.id", &row.id)?,
        owner_id: row.owner_id,
        title: row.title,
        document_id: row
            .document_id
            .as_deref()
            .map(|d| parse_uuid("sessions.document_id", d))
            .transpose()?,
        state: SessionState::from_str(&row.state)?,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

struct TurnRow {
    session_id: String,
    seq: i64,
    role: String,
    content: String,
    truncated: bool,
    created_at: NaiveDateTime,
}

fn turn_from_row(row: TurnRow) -> Result<Turn, DatabaseError> {
    Ok(Turn {
        session_id: parse_uuid("turns.session_id", &row.session_id)?,
        seq: row.seq as u32,
        role: TurnRole::from_str(&row.role)?,
        content: row.content,
        truncated: row.truncated,
        created_at: row.created_at,
    })
}
