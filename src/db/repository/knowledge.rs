use rusqlite::{params, Connection};

use super::parse_uuid;
use crate::db::DatabaseError;
use crate::models::KnowledgeChunk;

/// Embeddings are stored as little-endian `f32` bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn insert_knowledge_chunk(conn: &Connection, chunk: &KnowledgeChunk) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO knowledge_chunks (id, text, embedding, tags) VALUES (?1, ?2, ?3, ?4)",
        params![
            chunk.id.to_string(),
            chunk.text,
            vec_to_blob(&chunk.embedding),
            serde_json::to_string(&chunk.tags)?,
        ],
    )?;
    Ok(())
}

/// All chunks in insertion order.
pub fn load_knowledge_chunks(conn: &Connection) -> Result<Vec<KnowledgeChunk>, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT id, text, embedding, tags FROM knowledge_chunks ORDER BY rowid ASC")?;

    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Vec<u8>>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;

    let mut chunks = Vec::new();
    for row in rows {
        let (id, text, blob, tags) = row?;
        chunks.push(KnowledgeChunk {
            id: parse_uuid("knowledge_chunks.id", &id)?,
            text,
            embedding: blob_to_vec(&blob),
            tags: serde_json::from_str(&tags)?,
        });
    }
    Ok(chunks)
}

pub fn count_knowledge_chunks(conn: &Connection) -> Result<usize, DatabaseError> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM knowledge_chunks", [], |row| row.get(0))?;
    Ok(count.max(0) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::open_memory_database;

    #[test]
    fn blob_conversion_preserves_values() {
        let v = vec![1.0f32, -0.5, 0.0, f32::MIN_POSITIVE];
        assert_eq!(blob_to_vec(&vec_to_blob(&v)), v);
    }

    #[test]
    fn trailing_partial_bytes_are_ignored() {
        let mut blob = vec_to_blob(&[2.0]);
        blob.push(0xFF);
        assert_eq!(blob_to_vec(&blob), vec![2.0]);
    }

    #[test]
    fn chunks_load_in_insertion_order() {
        let conn = open_memory_database().unwrap();
        let texts = ["zeta", "alpha", "mid"];
        for t in texts {
            insert_knowledge_chunk(&conn, &KnowledgeChunk::new(t, vec![1.0, 0.0], &["lab"])).unwrap();
        }

        let loaded = load_knowledge_chunks(&conn).unwrap();
        let got: Vec<&str> = loaded.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(got, texts);
        assert_eq!(loaded[0].tags, vec!["lab".to_string()]);
        assert_eq!(count_knowledge_chunks(&conn).unwrap(), 3);
    }
}
