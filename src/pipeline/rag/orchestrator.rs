use std::sync::Arc;

use uuid::Uuid;

use super::context::ContextAssembler;
use super::conversation::{SessionCoordinator, SessionPermit};
use super::generation::{AnswerGenerator, AnswerStream};
use super::retrieval::Retriever;
use super::types::StreamEvent;
use super::RagError;
use crate::cancellation::CancellationToken;
use crate::models::NewTurn;
use crate::pipeline::safety::sanitize_query;
use crate::pipeline::storage::{blend_embeddings, EmbeddingService};

/// One chat turn end to end.
///
/// Coordinates: sanitize → claim session → embed → retrieve → assemble →
/// generate → persist.
pub struct ChatPipeline {
    sessions: Arc<SessionCoordinator>,
    embedder: EmbeddingService,
    retriever: Retriever,
    assembler: ContextAssembler,
    generator: AnswerGenerator,
    top_k: usize,
    report_query_bias: f32,
}

impl ChatPipeline {
    pub fn new(
        sessions: Arc<SessionCoordinator>,
        embedder: EmbeddingService,
        retriever: Retriever,
        assembler: ContextAssembler,
        generator: AnswerGenerator,
    ) -> Self {
        Self {
            sessions,
            embedder,
            retriever,
            assembler,
            generator,
            top_k: 3,
            report_query_bias: 0.0,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// Weight of the session report's embedding in the retrieval query.
    pub fn with_report_query_bias(mut self, weight: f32) -> Self {
        self.report_query_bias = weight;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionCoordinator> {
        &self.sessions
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    pub fn generator(&self) -> &AnswerGenerator {
        &self.generator
    }

    /// Start answering `raw_query` in a session.
    ///
    /// Returns once the model produced its first fragment. The session stays
    /// busy until the returned stream is finished or dropped. A failure before
    /// the first fragment leaves the history untouched.
    pub async fn send(
        &self,
        owner_id: &str,
        session_id: &Uuid,
        raw_query: &str,
        cancel: CancellationToken,
    ) -> Result<ChatStream, RagError> {
        let query = sanitize_query(raw_query)?;
        if query.was_modified() {
            tracing::debug!(session_id = %session_id, modifications = ?query.modifications, "Query sanitized");
        }

        let session = self.sessions.get(owner_id, session_id)?;
        let permit = self.sessions.try_begin(session_id)?;

        let history = self.sessions.history(owner_id, session_id)?;
        let report = self.sessions.session_document(&session)?;

        let mut query_vector = self.embedder.embed(&query.text).await?;
        if let Some(report_vector) = report.as_ref().and_then(|d| d.embedding.as_deref()) {
            query_vector = blend_embeddings(&query_vector, report_vector, self.report_query_bias);
        }

        let retrieval = self.retriever.retrieve(&query_vector, self.top_k).await;
        let context = self
            .assembler
            .assemble(&retrieval, report.as_ref(), &history, &query.text);

        tracing::info!(
            session_id = %session_id,
            history_turns = context.history_turns,
            metrics = context.metrics_included,
            knowledge = context.knowledge_included,
            retrieval_degraded = retrieval.degraded,
            prompt_chars = context.total_chars,
            "Generating answer"
        );

        let answer = self.generator.generate(&context, cancel).await?;
        self.sessions
            .append(owner_id, session_id, NewTurn::user(&query.text))?;

        Ok(ChatStream {
            answer,
            sessions: Arc::clone(&self.sessions),
            owner_id: owner_id.to_string(),
            session_id: *session_id,
            retrieval_degraded: retrieval.degraded,
            knowledge_used: context.knowledge_included,
            recorded: false,
            _permit: permit,
        })
    }
}

/// A streaming answer bound to its session.
///
/// The assistant turn is appended when the terminal event is produced, or
/// as truncated if the stream is dropped before that.
pub struct ChatStream {
    answer: AnswerStream,
    sessions: Arc<SessionCoordinator>,
    owner_id: String,
    session_id: Uuid,
    retrieval_degraded: bool,
    knowledge_used: usize,
    recorded: bool,
    // Released after `Drop::drop` has recorded the turn.
    _permit: SessionPermit,
}

impl ChatStream {
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        let event = self.answer.next_event().await?;
        match &event {
            StreamEvent::Complete { full_text } => self.record(full_text, false),
            StreamEvent::Truncated { reason, partial_text } => {
                tracing::info!(session_id = %self.session_id, %reason, chars = partial_text.len(), "Answer truncated");
                self.record(partial_text, true);
            }
            StreamEvent::Fragment { .. } => {}
        }
        Some(event)
    }

    /// Drain the stream.
    pub async fn collect_events(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event().await {
            events.push(event);
        }
        events
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Whether retrieval fell back to an empty result for this answer.
    pub fn retrieval_degraded(&self) -> bool {
        self.retrieval_degraded
    }

    pub fn knowledge_used(&self) -> usize {
        self.knowledge_used
    }

    fn record(&mut self, text: &str, truncated: bool) {
        if self.recorded {
            return;
        }
        self.recorded = true;
        let turn = NewTurn::assistant(text, truncated);
        match self.sessions.append(&self.owner_id, &self.session_id, turn) {
            Ok(stored) => {
                tracing::debug!(session_id = %self.session_id, seq = stored.seq, truncated, "Assistant turn stored")
            }
            // Session deleted mid-stream.
            Err(RagError::SessionNotFound(_)) => {
                tracing::info!(session_id = %self.session_id, "Session gone, answer not stored")
            }
            Err(e) => tracing::error!(session_id = %self.session_id, error = %e, "Failed to store assistant turn"),
        }
    }
}

impl Drop for ChatStream {
    fn drop(&mut self) {
        if !self.recorded {
            let partial = self.answer.text().to_string();
            self.record(&partial, true);
        }
    }
}
