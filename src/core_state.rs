//! Process-wide state: every shared handle is built once here and never
//! mutated afterwards. Transports call the operations on `CoreState`.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::cancellation::CancellationToken;
use crate::config::{self, CoreConfig};
use crate::db::{DocumentStore, SqliteStore};
use crate::error::CoreError;
use crate::models::{ConversationSession, Document, Turn};
use crate::pipeline::extraction::pdfium::PdfiumRenderer;
use crate::pipeline::extraction::{
    default_ocr_engine, DocumentExtractor, MetricVocabulary, OcrEngine, PdfPageRenderer,
    PdfTextExtractor, VOCABULARY_VERSION,
};
use crate::pipeline::processor::{DocumentProcessor, ProcessingOutcome, ProcessorLimits, UploadRequest};
use crate::pipeline::rag::context::ContextAssembler;
use crate::pipeline::rag::conversation::SessionCoordinator;
use crate::pipeline::rag::generation::{AnswerGenerator, GenerationLimits};
use crate::pipeline::rag::ollama::{ModelClient, OllamaClient};
use crate::pipeline::rag::orchestrator::{ChatPipeline, ChatStream};
use crate::pipeline::rag::retrieval::Retriever;
use crate::pipeline::storage::{
    default_embedding_model, EmbeddingModel, EmbeddingService, InMemoryKnowledgeIndex, KnowledgeIndex,
    StorageError,
};

// ═══════════════════════════════════════════════════════════
// Health
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub status: HealthStatus,
    pub message: String,
}

impl ServiceHealth {
    fn healthy(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Healthy,
            message: message.into(),
        }
    }

    fn degraded(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub version: &'static str,
    pub database: ServiceHealth,
    pub model: ServiceHealth,
    pub knowledge_index: ServiceHealth,
}

// ═══════════════════════════════════════════════════════════
// Builder
// ═══════════════════════════════════════════════════════════

/// Wires the core from a config. Any collaborator left unset gets its
/// production implementation.
pub struct CoreStateBuilder {
    config: CoreConfig,
    store: Option<Arc<SqliteStore>>,
    embedding_model: Option<Arc<dyn EmbeddingModel>>,
    knowledge_index: Option<Arc<dyn KnowledgeIndex>>,
    model_client: Option<Arc<dyn ModelClient>>,
    ocr_engine: Option<Box<dyn OcrEngine>>,
    /// `Some(None)` disables page rendering.
    pdf_renderer: Option<Option<Box<dyn PdfPageRenderer>>>,
}

impl CoreStateBuilder {
    pub fn with_store(mut self, store: Arc<SqliteStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_embedding_model(mut self, model: Arc<dyn EmbeddingModel>) -> Self {
        self.embedding_model = Some(model);
        self
    }

    pub fn with_knowledge_index(mut self, index: Arc<dyn KnowledgeIndex>) -> Self {
        self.knowledge_index = Some(index);
        self
    }

    pub fn with_model_client(mut self, client: Arc<dyn ModelClient>) -> Self {
        self.model_client = Some(client);
        self
    }

    pub fn with_ocr_engine(mut self, engine: Box<dyn OcrEngine>) -> Self {
        self.ocr_engine = Some(engine);
        self
    }

    pub fn with_pdf_renderer(mut self, renderer: Box<dyn PdfPageRenderer>) -> Self {
        self.pdf_renderer = Some(Some(renderer));
        self
    }

    pub fn without_pdf_renderer(mut self) -> Self {
        self.pdf_renderer = Some(None);
        self
    }

    /// Build the state. Fails on invalid config, an inconsistent metric
    /// vocabulary, an unusable database, an unavailable embedding model or
    /// a knowledge index whose vectors differ in dimension from the model's.
    pub async fn build(self) -> Result<CoreState, CoreError> {
        let config = self.config;
        config.validate()?;

        let vocabulary = Arc::new(MetricVocabulary::new()?);
        tracing::info!(version = VOCABULARY_VERSION, metrics = vocabulary.len(), "Metric vocabulary loaded");

        let store = match self.store {
            Some(store) => store,
            None => {
                if let Some(parent) = config.database_path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| CoreError::Internal(e.to_string()))?;
                }
                Arc::new(SqliteStore::open(&config.database_path)?)
            }
        };

        let model = match self.embedding_model {
            Some(model) => model,
            None => default_embedding_model(&config::embedding_model_dir())?,
        };
        let embedder = EmbeddingService::new(model, config.embedding_char_budget, config.embedding_retry.clone());
        embedder.probe().await?;

        let index: Arc<dyn KnowledgeIndex> = match self.knowledge_index {
            Some(index) => index,
            None => Arc::new(InMemoryKnowledgeIndex::load_from_store(&store, embedder.dimension())?),
        };
        if index.dimension() != embedder.dimension() {
            return Err(StorageError::DimensionMismatch {
                expected: embedder.dimension(),
                actual: index.dimension(),
            }
            .into());
        }

        let client: Arc<dyn ModelClient> = match self.model_client {
            Some(client) => client,
            None => Arc::new(OllamaClient::from_config(&config)?),
        };

        let ocr = match self.ocr_engine {
            Some(engine) => engine,
            None => default_ocr_engine(&config.tessdata_dir, &config.ocr_language),
        };
        let renderer = match self.pdf_renderer {
            Some(choice) => choice,
            None => match PdfiumRenderer::new() {
                Ok(r) => Some(Box::new(r) as Box<dyn PdfPageRenderer>),
                Err(e) => {
                    tracing::info!(error = %e, "PDFium unavailable, scanned PDFs cannot be OCR'd");
                    None
                }
            },
        };
        let mut extractor = DocumentExtractor::new(Box::new(PdfTextExtractor), ocr, vocabulary);
        if let Some(renderer) = renderer {
            extractor = extractor.with_pdf_renderer(renderer, config.ocr_render_dpi);
        }

        let documents: Arc<dyn DocumentStore> = store.clone();
        let processor = DocumentProcessor::new(
            Arc::clone(&documents),
            Arc::new(extractor),
            embedder.clone(),
            ProcessorLimits::from_config(&config),
        );

        let sessions = Arc::new(SessionCoordinator::new(store.clone(), Arc::clone(&documents)));
        let retriever = Retriever::new(
            index,
            config.retrieval_timeout,
            config.retrieval_retry.clone(),
            config.retrieval_max_k,
        );
        let assembler = ContextAssembler::new(config.context_char_budget, config.history_turns);
        let generator = AnswerGenerator::new(client, GenerationLimits::from_config(&config));
        let chat = ChatPipeline::new(sessions, embedder, retriever, assembler, generator)
            .with_top_k(config.retrieval_top_k)
            .with_report_query_bias(config.report_query_bias);

        tracing::info!(model = %config.model_name, endpoint = %config.model_endpoint, "Core state ready");
        Ok(CoreState {
            config,
            documents,
            store,
            processor,
            chat,
        })
    }
}

// ═══════════════════════════════════════════════════════════
// CoreState
// ═══════════════════════════════════════════════════════════

/// Shared by every transport, usually behind an `Arc`.
pub struct CoreState {
    config: CoreConfig,
    documents: Arc<dyn DocumentStore>,
    store: Arc<SqliteStore>,
    processor: DocumentProcessor,
    chat: ChatPipeline,
}

impl CoreState {
    pub fn builder(config: CoreConfig) -> CoreStateBuilder {
        CoreStateBuilder {
            config,
            store: None,
            embedding_model: None,
            knowledge_index: None,
            model_client: None,
            ocr_engine: None,
            pdf_renderer: None,
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    // ── Reports ─────────────────────────────────────────────

    pub async fn upload_document(
        &self,
        owner_id: &str,
        file_name: &str,
        declared_mime: &str,
        bytes: Vec<u8>,
    ) -> Result<ProcessingOutcome, CoreError> {
        self.processor
            .process(UploadRequest {
                owner_id: owner_id.to_string(),
                file_name: file_name.to_string(),
                declared_mime: declared_mime.to_string(),
                bytes,
            })
            .await
    }

    pub fn get_document(&self, owner_id: &str, id: &Uuid) -> Result<Document, CoreError> {
        self.documents
            .load_document(id)?
            .filter(|d| d.owner_id == owner_id)
            .ok_or(CoreError::DocumentNotFound(*id))
    }

    pub fn list_documents(&self, owner_id: &str) -> Result<Vec<Document>, CoreError> {
        Ok(self.documents.list_documents(owner_id)?)
    }

    /// Sessions that reference the document keep working without its metrics.
    pub fn delete_document(&self, owner_id: &str, id: &Uuid) -> Result<(), CoreError> {
        self.get_document(owner_id, id)?;
        if !self.documents.delete_document(id)? {
            return Err(CoreError::DocumentNotFound(*id));
        }
        tracing::info!(document_id = %id, "Document deleted");
        Ok(())
    }

    // ── Sessions ────────────────────────────────────────────

    pub fn create_session(&self, owner_id: &str, document_id: Option<Uuid>) -> Result<ConversationSession, CoreError> {
        Ok(self.chat.sessions().create(owner_id, document_id)?)
    }

    pub fn get_session(&self, owner_id: &str, id: &Uuid) -> Result<ConversationSession, CoreError> {
        Ok(self.chat.sessions().get(owner_id, id)?)
    }

    pub fn list_sessions(&self, owner_id: &str) -> Result<Vec<ConversationSession>, CoreError> {
        Ok(self.chat.sessions().list(owner_id)?)
    }

    pub fn history(&self, owner_id: &str, session_id: &Uuid) -> Result<Vec<Turn>, CoreError> {
        Ok(self.chat.sessions().history(owner_id, session_id)?)
    }

    pub fn delete_session(&self, owner_id: &str, id: &Uuid) -> Result<(), CoreError> {
        Ok(self.chat.sessions().delete(owner_id, id)?)
    }

    /// Start a streaming answer. The caller signals disconnect through the
    /// handle paired with `cancel`.
    pub async fn send_message(
        &self,
        owner_id: &str,
        session_id: &Uuid,
        text: &str,
        cancel: CancellationToken,
    ) -> Result<ChatStream, CoreError> {
        Ok(self.chat.send(owner_id, session_id, text, cancel).await?)
    }

    // ── Health ──────────────────────────────────────────────

    pub async fn health(&self) -> HealthReport {
        let database = match self.documents.ping() {
            Ok(()) => ServiceHealth::healthy("Connected"),
            Err(e) => {
                tracing::warn!(error = %e, "Database health check failed");
                ServiceHealth::degraded("Connection failed")
            }
        };

        let client = self.chat.generator().client();
        let model = match client.health().await {
            Ok(()) => ServiceHealth::healthy(format!("Model {} available", client.model_name())),
            Err(e) => {
                tracing::warn!(error = %e, "Model health check failed");
                ServiceHealth::degraded(format!("Model {} unreachable", client.model_name()))
            }
        };

        let knowledge_index = match self.chat.retriever().index().chunk_count().await {
            Ok(0) => ServiceHealth::degraded("Index is empty"),
            Ok(n) => ServiceHealth::healthy(format!("{n} chunks")),
            Err(e) => {
                tracing::warn!(error = %e, "Knowledge index health check failed");
                ServiceHealth::degraded("Index unreachable")
            }
        };

        let all_healthy = [&database, &model, &knowledge_index]
            .iter()
            .all(|s| s.status == HealthStatus::Healthy);

        HealthReport {
            status: if all_healthy { HealthStatus::Healthy } else { HealthStatus::Degraded },
            version: config::APP_VERSION,
            database,
            model,
            knowledge_index,
        }
    }

    /// Knowledge chunks stored in the local database, for seeding tools.
    pub fn stored_knowledge_chunks(&self) -> Result<usize, CoreError> {
        Ok(self.store.count_knowledge_chunks()?)
    }
}
