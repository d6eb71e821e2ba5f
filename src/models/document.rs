use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{ExtractionMethod, ExtractionStatus};

/// A parsed clinical measurement, e.g. `95 mg/dL` or `120/80 mmHg`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricValue {
    pub value: String,
    pub unit: String,
}

impl MetricValue {
    pub fn new(value: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            unit: unit.into(),
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.unit.is_empty() {
            f.write_str(&self.value)
        } else {
            write!(f, "{} {}", self.value, self.unit)
        }
    }
}

/// Metric key → value. Keys are unique; ordering is by key only.
pub type MetricMap = BTreeMap<String, MetricValue>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub owner_id: String,
    pub file_name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    /// SHA-256 of the uploaded bytes; the reference to the raw content.
    pub content_sha256: String,
    pub status: ExtractionStatus,
    pub extraction_method: Option<ExtractionMethod>,
    pub raw_text: Option<String>,
    pub metrics: MetricMap,
    pub failure_reason: Option<String>,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    pub created_at: NaiveDateTime,
    pub completed_at: Option<NaiveDateTime>,
}

impl Document {
    /// A freshly uploaded document, not yet picked up by the extractor.
    pub fn pending(
        owner_id: &str,
        file_name: &str,
        mime_type: &str,
        size_bytes: u64,
        content_sha256: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            file_name: file_name.to_string(),
            mime_type: mime_type.to_string(),
            size_bytes,
            content_sha256,
            status: ExtractionStatus::Pending,
            extraction_method: None,
            raw_text: None,
            metrics: MetricMap::new(),
            failure_reason: None,
            embedding: None,
            created_at: chrono::Local::now().naive_local(),
            completed_at: None,
        }
    }

    /// Metrics rendered as display strings (`"glucose" → "95 mg/dL"`).
    pub fn parsed_metrics(&self) -> BTreeMap<String, String> {
        self.metrics
            .iter()
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect()
    }

    pub fn is_done(&self) -> bool {
        self.status == ExtractionStatus::Done
    }
}
