use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A pre-embedded unit of the medical knowledge base.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeChunk {
    pub id: Uuid,
    pub text: String,
    pub embedding: Vec<f32>,
    pub tags: Vec<String>,
}

impl KnowledgeChunk {
    pub fn new(text: &str, embedding: Vec<f32>, tags: &[&str]) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.to_string(),
            embedding,
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }
}
