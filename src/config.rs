use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::pipeline::safety::MAX_QUERY_LENGTH;
use crate::pipeline::stream_guard::StreamGuardConfig;

pub use crate::pipeline::storage::EMBEDDING_DIM;

/// Application-level constants
pub const APP_NAME: &str = "Medico";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_MODEL_ENDPOINT: &str = "http://localhost:11434";
pub const DEFAULT_MODEL_NAME: &str = "llama3.3";

/// Log filter used when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    if cfg!(debug_assertions) {
        "info,medico_lib=debug"
    } else {
        "info"
    }
}

/// Application data directory (`<data dir>/Medico`), falling back to the
/// home directory and then the working directory.
pub fn app_data_dir() -> PathBuf {
    dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

pub fn database_path() -> PathBuf {
    app_data_dir().join("medico.db")
}

/// Models directory (ONNX embeddings, tessdata)
pub fn models_dir() -> PathBuf {
    app_data_dir().join("models")
}

/// Embedding model directory (all-MiniLM-L6-v2)
pub fn embedding_model_dir() -> PathBuf {
    models_dir().join("all-MiniLM-L6-v2")
}

pub fn tessdata_dir() -> PathBuf {
    models_dir().join("tessdata")
}

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid configuration for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Bounded exponential backoff for transient, idempotent calls.
#[derive(Debug, Clone, Serialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): base, 2×base, 4×base… capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

/// Every tunable of the core pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct CoreConfig {
    pub database_path: PathBuf,

    // Extraction
    pub max_upload_bytes: u64,
    pub extraction_timeout: Duration,
    pub extraction_workers: usize,
    pub ocr_render_dpi: u32,
    pub tessdata_dir: PathBuf,
    pub ocr_language: String,

    // Embedding
    pub embedding_char_budget: usize,
    pub embedding_retry: RetryPolicy,

    // Retrieval
    pub retrieval_timeout: Duration,
    pub retrieval_top_k: usize,
    pub retrieval_max_k: usize,
    pub retrieval_retry: RetryPolicy,
    /// Weight of the active report's embedding when blended into the query vector.
    pub report_query_bias: f32,

    // Context
    pub context_char_budget: usize,
    pub history_turns: usize,

    // Generation
    pub model_endpoint: String,
    pub model_name: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub connect_timeout: Duration,
    pub first_fragment_timeout: Duration,
    pub stall_timeout: Duration,
    pub stream_guard: StreamGuardConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            database_path: database_path(),
            max_upload_bytes: 10 * 1024 * 1024,
            extraction_timeout: Duration::from_secs(120),
            extraction_workers: 2,
            ocr_render_dpi: 300,
            tessdata_dir: tessdata_dir(),
            ocr_language: "eng".to_string(),
            embedding_char_budget: 2_000,
            embedding_retry: RetryPolicy::default(),
            retrieval_timeout: Duration::from_secs(3),
            retrieval_top_k: 3,
            retrieval_max_k: 10,
            retrieval_retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_millis(500),
            },
            report_query_bias: 0.3,
            context_char_budget: 12_000,
            history_turns: 10,
            model_endpoint: DEFAULT_MODEL_ENDPOINT.to_string(),
            model_name: DEFAULT_MODEL_NAME.to_string(),
            temperature: 0.7,
            max_tokens: 2048,
            connect_timeout: Duration::from_secs(10),
            first_fragment_timeout: Duration::from_secs(60),
            stall_timeout: Duration::from_secs(30),
            stream_guard: StreamGuardConfig::default(),
        }
    }
}

fn apply<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<T>() {
            Ok(v) => *target = v,
            Err(_) => tracing::warn!(key, "Ignoring unparsable configuration value"),
        }
    }
}

fn apply_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut Duration) {
    let mut secs = target.as_secs_f64();
    apply(lookup, key, &mut secs);
    match Duration::try_from_secs_f64(secs) {
        Ok(duration) => *target = duration,
        Err(_) => tracing::warn!(key, "Ignoring out-of-range duration"),
    }
}

impl CoreConfig {
    /// Defaults overridden by `MEDICO_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut c = Self::default();
        let l = &lookup;

        apply(l, "MEDICO_DB_PATH", &mut c.database_path);
        apply(l, "MEDICO_MAX_UPLOAD_BYTES", &mut c.max_upload_bytes);
        apply_secs(l, "MEDICO_EXTRACTION_TIMEOUT_SECS", &mut c.extraction_timeout);
        apply(l, "MEDICO_EXTRACTION_WORKERS", &mut c.extraction_workers);
        apply(l, "MEDICO_OCR_DPI", &mut c.ocr_render_dpi);
        apply(l, "MEDICO_TESSDATA_DIR", &mut c.tessdata_dir);
        apply(l, "MEDICO_OCR_LANGUAGE", &mut c.ocr_language);
        apply(l, "MEDICO_EMBEDDING_CHAR_BUDGET", &mut c.embedding_char_budget);
        apply(l, "MEDICO_EMBEDDING_RETRIES", &mut c.embedding_retry.max_attempts);
        apply_secs(l, "MEDICO_RETRIEVAL_TIMEOUT_SECS", &mut c.retrieval_timeout);
        apply(l, "MEDICO_TOP_K", &mut c.retrieval_top_k);
        apply(l, "MEDICO_MAX_K", &mut c.retrieval_max_k);
        apply(l, "MEDICO_REPORT_QUERY_BIAS", &mut c.report_query_bias);
        apply(l, "MEDICO_CONTEXT_CHARS", &mut c.context_char_budget);
        apply(l, "MEDICO_HISTORY_TURNS", &mut c.history_turns);
        apply(l, "MEDICO_MODEL_URL", &mut c.model_endpoint);
        apply(l, "MEDICO_MODEL", &mut c.model_name);
        apply(l, "MEDICO_TEMPERATURE", &mut c.temperature);
        apply(l, "MEDICO_MAX_TOKENS", &mut c.max_tokens);
        apply_secs(l, "MEDICO_CONNECT_TIMEOUT_SECS", &mut c.connect_timeout);
        apply_secs(l, "MEDICO_FIRST_FRAGMENT_TIMEOUT_SECS", &mut c.first_fragment_timeout);
        apply_secs(l, "MEDICO_STALL_TIMEOUT_SECS", &mut c.stall_timeout);
        apply(l, "MEDICO_MAX_FRAGMENTS", &mut c.stream_guard.max_total_fragments);

        c
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_upload_bytes == 0 {
            return Err(invalid("max_upload_bytes", "must be greater than zero"));
        }
        if self.extraction_workers == 0 {
            return Err(invalid("extraction_workers", "must be greater than zero"));
        }
        if self.extraction_timeout.is_zero() {
            return Err(invalid("extraction_timeout", "must be greater than zero"));
        }
        if self.embedding_char_budget == 0 {
            return Err(invalid("embedding_char_budget", "must be greater than zero"));
        }
        if self.embedding_retry.max_attempts == 0 || self.retrieval_retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must allow at least one attempt"));
        }
        if self.retrieval_max_k == 0 {
            return Err(invalid("retrieval_max_k", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.report_query_bias) {
            return Err(invalid("report_query_bias", "must be within [0, 1]"));
        }
        // The whole sanitized query is always reserved inside the budget.
        if self.context_char_budget < MAX_QUERY_LENGTH * 2 {
            return Err(invalid(
                "context_char_budget",
                format!("must be at least {}", MAX_QUERY_LENGTH * 2),
            ));
        }
        if self.model_endpoint.trim().is_empty() || self.model_name.trim().is_empty() {
            return Err(invalid("model", "endpoint and name are required"));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(invalid("temperature", "must be a non-negative number"));
        }
        if self.stall_timeout.is_zero() || self.first_fragment_timeout.is_zero() {
            return Err(invalid("stall_timeout", "must be greater than zero"));
        }
        Ok(())
    }
}
