use std::fmt;

use serde::Serialize;

use crate::pipeline::storage::ScoredChunk;

/// Knowledge retrieved for one query. Lives for a single chat turn.
#[derive(Debug, Clone, Default)]
pub struct RetrievalResult {
    /// Highest similarity first.
    pub chunks: Vec<ScoredChunk>,
    /// Set when the index failed or timed out and the result is empty by
    /// necessity rather than by relevance.
    pub degraded: bool,
}

impl RetrievalResult {
    pub fn degraded() -> Self {
        Self {
            chunks: Vec::new(),
            degraded: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: PromptRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn char_len(&self) -> usize {
        self.content.chars().count()
    }
}

/// Bounded chat payload: one system message (instructions plus grounding
/// sections), prior turns, then the current query as the last user message.
#[derive(Debug, Clone)]
pub struct PromptContext {
    pub messages: Vec<PromptMessage>,
    /// Sum of message content lengths, in chars. Never above `budget`
    /// unless the query alone is.
    pub total_chars: usize,
    pub budget: usize,
    pub instructions_truncated: bool,
    pub history_turns: usize,
    pub metrics_included: usize,
    pub knowledge_included: usize,
}

impl PromptContext {
    pub fn query(&self) -> Option<&str> {
        self.messages
            .last()
            .filter(|m| m.role == PromptRole::User)
            .map(|m| m.content.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncationReason {
    /// The consumer went away or cancelled.
    Cancelled,
    /// The model endpoint failed after at least one fragment.
    UpstreamError,
    /// No fragment arrived within the stall timeout.
    Stalled,
    /// The stream guard detected repetition or the fragment cap.
    Degenerate,
}

impl TruncationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::UpstreamError => "upstream_error",
            Self::Stalled => "stalled",
            Self::Degenerate => "degenerate",
        }
    }
}

impl fmt::Display for TruncationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a chat stream yields: fragments, then exactly one terminal event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Fragment { text: String },
    Complete { full_text: String },
    Truncated { reason: TruncationReason, partial_text: String },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Fragment { .. })
    }
}
