use std::str::FromStr;

use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::knowledge::{blob_to_vec, vec_to_blob};
use super::parse_uuid;
use crate::db::DatabaseError;
use crate::models::enums::{ExtractionMethod, ExtractionStatus};
use crate::models::{Document, MetricMap};

const DOCUMENT_COLUMNS: &str = "id, owner_id, file_name, mime_type, size_bytes, content_sha256, \
     status, extraction_method, raw_text, metrics_json, failure_reason, embedding, created_at, \
     completed_at";

/// Insert or update a document row.
///
/// A row whose stored status is already `done` or `failed` is frozen:
/// any further write is a `ConstraintViolation`.
pub fn upsert_document(conn: &Connection, doc: &Document) -> Result<(), DatabaseError> {
    let stored: Option<String> = conn
        .query_row(
            "SELECT status FROM documents WHERE id = ?1",
            params![doc.id.to_string()],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(status) = stored {
        if ExtractionStatus::from_str(&status)?.is_terminal() {
            return Err(DatabaseError::ConstraintViolation(format!(
                "document {} is already {status}",
                doc.id
            )));
        }
    }

    let metrics_json = serde_json::to_string(&doc.metrics)?;
    conn.execute(
        "INSERT INTO documents (id, owner_id, file_name, mime_type, size_bytes, content_sha256,
             status, extraction_method, raw_text, metrics_json, failure_reason, embedding,
             created_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
         ON CONFLICT(id) DO UPDATE SET
             status = excluded.status,
             extraction_method = excluded.extraction_method,
             raw_text = excluded.raw_text,
             metrics_json = excluded.metrics_json,
             failure_reason = excluded.failure_reason,
             embedding = excluded.embedding,
             completed_at = excluded.completed_at",
        params![
            doc.id.to_string(),
            doc.owner_id,
            doc.file_name,
            doc.mime_type,
            doc.size_bytes as i64,
            doc.content_sha256,
            doc.status.as_str(),
            doc.extraction_method.map(|m| m.as_str()),
            doc.raw_text,
            metrics_json,
            doc.failure_reason,
            doc.embedding.as_deref().map(vec_to_blob),
            doc.created_at,
            doc.completed_at,
        ],
    )?;
    Ok(())
}

pub fn get_document(conn: &Connection, id: &Uuid) -> Result<Option<Document>, DatabaseError> {
    let row = conn
        .query_row(
            &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?1"),
            params![id.to_string()],
            read_document_row,
        )
        .optional()?;

    row.map(document_from_row).transpose()
}

/// Documents owned by `owner_id`, newest first.
pub fn list_documents_by_owner(
    conn: &Connection,
    owner_id: &str,
) -> Result<Vec<Document>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE owner_id = ?1
         ORDER BY created_at DESC, rowid DESC"
    ))?;

    let rows = stmt.query_map(params![owner_id], read_document_row)?;

    let mut documents = Vec::new();
    for row in rows {
        documents.push(document_from_row(row?)?);
    }
    Ok(documents)
}

pub fn delete_document(conn: &Connection, id: &Uuid) -> Result<bool, DatabaseError> {
    let affected = conn.execute(
        "DELETE FROM documents WHERE id = ?1",
        params![id.to_string()],
    )?;
    Ok(affected > 0)
}

struct DocumentRow {
    id: String,
    owner_id: String,
    file_name: String,
    mime_type: String,
    size_bytes: i64,
    content_sha256: String,
    status: String,
    extraction_method: Option<String>,
    raw_text: Option<String>,
    metrics_json: String,
    failure_reason: Option<String>,
    embedding: Option<Vec<u8>>,
    created_at: NaiveDateTime,
    completed_at: Option<NaiveDateTime>,
}

fn read_document_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DocumentRow> {
    Ok(DocumentRow {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        file_name: row.get(2)?,
        mime_type: row.get(3)?,
        size_bytes: row.get(4)?,
        content_sha256: row.get(5)?,
        status: row.get(6)?,
        extraction_method: row.get(7)?,
        raw_text: row.get(8)?,
        metrics_json: row.get(9)?,
        failure_reason: row.get(10)?,
        embedding: row.get(11)?,
        created_at: row.get(12)?,
        completed_at: row.get(13)?,
    })
}

fn document_from_row(row: DocumentRow) -> Result<Document, DatabaseError> {
    let metrics: MetricMap = serde_json::from_str(&row.metrics_json)?;
    Ok(Document {
        id: parse_uuid("documents.id", &row.id)?,
        owner_id: row.owner_id,
        file_name: row.file_name,
        mime_type: row.mime_type,
        size_bytes: row.size_bytes.max(0) as u64,
        content_sha256: row.content_sha256,
        status: ExtractionStatus::from_str(&row.status)?,
        extraction_method: row
            .extraction_method
            .as_deref()
            .map(ExtractionMethod::from_str)
            .transpose()?,
        raw_text: row.raw_text,
        metrics,
        failure_reason: row.failure_reason,
        embedding: row.embedding.as_deref().map(blob_to_vec),
        created_at: row.created_at,
        completed_at: row.completed_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::open_memory_database;
    use crate::models::MetricValue;

    fn pending(owner: &str) -> Document {
        Document::pending(owner, "lab.pdf", "application/pdf", 42, "deadbeef".into())
    }

    #[test]
    fn insert_and_get() {
        let conn = open_memory_database().unwrap();
        let doc = pending("alice");
        upsert_document(&conn, &doc).unwrap();

        let loaded = get_document(&conn, &doc.id).unwrap().unwrap();
        assert_eq!(loaded.owner_id, "alice");
        assert_eq!(loaded.status, ExtractionStatus::Pending);
        assert_eq!(loaded.size_bytes, 42);
        assert!(loaded.embedding.is_none());
    }

    #[test]
    fn get_missing_returns_none() {
        let conn = open_memory_database().unwrap();
        assert!(get_document(&conn, &Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn transition_to_done_persists_metrics_and_embedding() {
        let conn = open_memory_database().unwrap();
        let mut doc = pending("alice");
        upsert_document(&conn, &doc).unwrap();

        doc.status = ExtractionStatus::Done;
        doc.extraction_method = Some(ExtractionMethod::PdfText);
        doc.raw_text = Some("Glucose: 95 mg/dL".into());
        doc.metrics
            .insert("glucose".into(), MetricValue::new("95", "mg/dL"));
        doc.embedding = Some(vec![0.25, -0.5, 1.0]);
        upsert_document(&conn, &doc).unwrap();

        let loaded = get_document(&conn, &doc.id).unwrap().unwrap();
        assert_eq!(loaded.status, ExtractionStatus::Done);
        assert_eq!(loaded.extraction_method, Some(ExtractionMethod::PdfText));
        assert_eq!(loaded.metrics["glucose"].to_string(), "95 mg/dL");
        assert_eq!(loaded.embedding, Some(vec![0.25, -0.5, 1.0]));
    }

    #[test]
    fn terminal_document_is_frozen() {
        let conn = open_memory_database().unwrap();
        let mut doc = pending("alice");
        doc.status = ExtractionStatus::Done;
        upsert_document(&conn, &doc).unwrap();

        doc.metrics.insert("pulse".into(), MetricValue::new("70", "bpm"));
        let err = upsert_document(&conn, &doc).unwrap_err();
        assert!(matches!(err, DatabaseError::ConstraintViolation(_)));

        let loaded = get_document(&conn, &doc.id).unwrap().unwrap();
        assert!(loaded.metrics.is_empty());
    }

    #[test]
    fn list_is_per_owner_newest_first() {
        let conn = open_memory_database().unwrap();
        let first = pending("alice");
        let mut second = pending("alice");
        second.created_at = first.created_at + chrono::Duration::seconds(5);
        let other = pending("bob");
        for d in [&first, &second, &other] {
            upsert_document(&conn, d).unwrap();
        }

        let listed = list_documents_by_owner(&conn, "alice").unwrap();
        let ids: Vec<Uuid> = listed.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }

    #[test]
    fn delete_reports_whether_row_existed() {
        let conn = open_memory_database().unwrap();
        let doc = pending("alice");
        upsert_document(&conn, &doc).unwrap();
        assert!(delete_document(&conn, &doc.id).unwrap());
        assert!(!delete_document(&conn, &doc.id).unwrap());
    }
}
