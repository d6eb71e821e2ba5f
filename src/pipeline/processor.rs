//! Document processing: validate → persist → extract → embed → complete.
//!
//! Every upload that passes the size check ends in a terminal status
//! (`done` or `failed`) before `process` returns.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::config::CoreConfig;
use crate::db::{DatabaseError, DocumentStore};
use crate::error::CoreError;
use crate::models::enums::{ExtractionMethod, ExtractionStatus};
use crate::models::{Document, MetricMap};
use crate::pipeline::extraction::{
    content_digest, normalize_mime, sanitize_file_name, validate_upload, DocumentExtractor,
    ExtractionError, ExtractionResult,
};
use crate::pipeline::storage::EmbeddingService;

/// An upload handed to the core by the transport layer.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub owner_id: String,
    pub file_name: String,
    pub declared_mime: String,
    pub bytes: Vec<u8>,
}

/// Summary returned after a successful extraction.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingOutcome {
    pub document_id: Uuid,
    pub file_name: String,
    pub method: ExtractionMethod,
    pub metrics: MetricMap,
    pub text_chars: usize,
    /// False when the report embedding could not be computed; retrieval then
    /// runs without report bias.
    pub embedded: bool,
}

#[derive(Debug, Clone)]
pub struct ProcessorLimits {
    pub max_upload_bytes: u64,
    pub extraction_timeout: Duration,
    pub workers: usize,
}

impl ProcessorLimits {
    pub fn from_config(config: &CoreConfig) -> Self {
        Self {
            max_upload_bytes: config.max_upload_bytes,
            extraction_timeout: config.extraction_timeout,
            workers: config.extraction_workers,
        }
    }
}

/// Drives one upload through extraction on the blocking pool.
///
/// At most `workers` extractions run at once; the rest wait for a slot.
pub struct DocumentProcessor {
    store: Arc<dyn DocumentStore>,
    extractor: Arc<DocumentExtractor>,
    embedder: EmbeddingService,
    limits: ProcessorLimits,
    slots: Arc<Semaphore>,
}

impl DocumentProcessor {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        extractor: Arc<DocumentExtractor>,
        embedder: EmbeddingService,
        limits: ProcessorLimits,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(limits.workers.max(1)));
        Self {
            store,
            extractor,
            embedder,
            limits,
            slots,
        }
    }

    pub async fn process(&self, upload: UploadRequest) -> Result<ProcessingOutcome, CoreError> {
        let size = upload.bytes.len() as u64;
        if size > self.limits.max_upload_bytes {
            tracing::info!(size, limit = self.limits.max_upload_bytes, "Upload rejected: too large");
            return Err(CoreError::PayloadTooLarge {
                size,
                limit: self.limits.max_upload_bytes,
            });
        }

        let file_name = sanitize_file_name(&upload.file_name);
        let mime = normalize_mime(&upload.declared_mime);
        let mut doc = Document::pending(
            &upload.owner_id,
            &file_name,
            &mime,
            size,
            content_digest(&upload.bytes),
        );

        if let Err(e) = validate_upload(&upload.bytes, &mime) {
            return Err(self.fail(&mut doc, e));
        }

        if let Err(e) = self.store.save_document(&doc) {
            return Err(self.abandon(&mut doc, e));
        }
        doc.status = ExtractionStatus::Processing;
        if let Err(e) = self.store.save_document(&doc) {
            return Err(self.abandon(&mut doc, e));
        }
        tracing::info!(document_id = %doc.id, mime = %mime, size, "Extraction started");

        let result = match self.run_extraction(upload.bytes, mime).await {
            Ok(result) => result,
            Err(e) => return Err(self.fail(&mut doc, e)),
        };

        let embedded = self.attach_embedding(&mut doc, &result.raw_text).await;

        let text_chars = result.raw_text.chars().count();
        doc.status = ExtractionStatus::Done;
        doc.extraction_method = Some(result.method);
        doc.raw_text = Some(result.raw_text);
        doc.metrics = result.metrics;
        doc.completed_at = Some(chrono::Local::now().naive_local());
        if let Err(e) = self.store.save_document(&doc) {
            return Err(self.abandon(&mut doc, e));
        }

        tracing::info!(
            document_id = %doc.id,
            method = result.method.as_str(),
            metrics = doc.metrics.len(),
            text_chars,
            embedded,
            "Extraction complete"
        );

        Ok(ProcessingOutcome {
            document_id: doc.id,
            file_name: doc.file_name.clone(),
            method: result.method,
            metrics: doc.metrics.clone(),
            text_chars,
            embedded,
        })
    }

    async fn run_extraction(&self, bytes: Vec<u8>, mime: String) -> Result<ExtractionResult, ExtractionError> {
        let slot = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|e| ExtractionError::Worker(e.to_string()))?;

        let extractor = Arc::clone(&self.extractor);
        // The slot is released by the blocking job itself, so a timed-out
        // extraction keeps counting against the worker bound until it ends.
        let task = tokio::task::spawn_blocking(move || {
            let _slot = slot;
            extractor.extract(&bytes, &mime)
        });

        match tokio::time::timeout(self.limits.extraction_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(ExtractionError::Worker(join.to_string())),
            // The blocking job runs on in the background; its result is discarded.
            Err(_) => Err(ExtractionError::Timeout(self.limits.extraction_timeout)),
        }
    }

    async fn attach_embedding(&self, doc: &mut Document, text: &str) -> bool {
        match self.embedder.embed(text).await {
            Ok(vector) => {
                doc.embedding = Some(vector);
                true
            }
            Err(e) => {
                tracing::warn!(document_id = %doc.id, error = %e, "Report embedding failed, completing without it");
                false
            }
        }
    }

    /// A store write failed mid-pipeline. Make one best-effort attempt to
    /// leave the row `failed` rather than `pending` or `processing`.
    fn abandon(&self, doc: &mut Document, err: DatabaseError) -> CoreError {
        tracing::error!(document_id = %doc.id, status = doc.status.as_str(), error = %err, "Could not persist document");

        doc.status = ExtractionStatus::Failed;
        doc.failure_reason = Some("could not save the report".to_string());
        doc.metrics.clear();
        doc.raw_text = None;
        doc.embedding = None;
        doc.completed_at = Some(chrono::Local::now().naive_local());
        if let Err(e) = self.store.save_document(doc) {
            tracing::error!(document_id = %doc.id, error = %e, "Could not persist failed status");
        }
        CoreError::from(err)
    }

    /// Mark the document failed and build the surfaced error.
    fn fail(&self, doc: &mut Document, err: ExtractionError) -> CoreError {
        let reason = err.user_reason();
        tracing::warn!(document_id = %doc.id, error = %err, reason, "Extraction failed");

        doc.status = ExtractionStatus::Failed;
        doc.failure_reason = Some(reason.to_string());
        doc.completed_at = Some(chrono::Local::now().naive_local());
        if let Err(e) = self.store.save_document(doc) {
            tracing::error!(document_id = %doc.id, error = %e, "Could not persist failed status");
            return CoreError::from(e);
        }

        CoreError::ExtractionFailed {
            document_id: doc.id,
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::config::RetryPolicy;
    use crate::db::SqliteStore;
    use crate::error::ErrorKind;
    use crate::pipeline::extraction::ocr::MockOcrEngine;
    use crate::pipeline::extraction::pdf::{make_test_pdf, PdfTextExtractor};
    use crate::pipeline::extraction::{MetricVocabulary, OcrEngine, OcrPageResult, PdfExtractor};
    use crate::pipeline::storage::{FlakyEmbedder, HashEmbedder};

    fn limits() -> ProcessorLimits {
        ProcessorLimits {
            max_upload_bytes: 1024 * 1024,
            extraction_timeout: Duration::from_secs(10),
            workers: 2,
        }
    }

    fn embedder() -> EmbeddingService {
        EmbeddingService::new(Arc::new(HashEmbedder::new()), 2_000, RetryPolicy::default())
    }

    fn processor_with(ocr: Box<dyn OcrEngine>, embedder: EmbeddingService, limits: ProcessorLimits) -> (DocumentProcessor, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let extractor = DocumentExtractor::new(
            Box::new(PdfTextExtractor),
            ocr,
            Arc::new(MetricVocabulary::new().unwrap()),
        );
        (
            DocumentProcessor::new(store.clone(), Arc::new(extractor), embedder, limits),
            store,
        )
    }

    fn upload(name: &str, mime: &str, bytes: Vec<u8>) -> UploadRequest {
        UploadRequest {
            owner_id: "alice".into(),
            file_name: name.into(),
            declared_mime: mime.into(),
            bytes,
        }
    }

    #[tokio::test]
    async fn digital_pdf_reaches_done() {
        let (processor, store) = processor_with(Box::new(MockOcrEngine::new("", 0.0)), embedder(), limits());
        let pdf = make_test_pdf(&[&["Glucose: 95 mg/dL"]]);

        let outcome = processor.process(upload("labs.pdf", "application/pdf", pdf)).await.unwrap();
        assert_eq!(outcome.method, ExtractionMethod::PdfText);
        assert!(outcome.embedded);

        let doc = store.load_document(&outcome.document_id).unwrap().unwrap();
        assert_eq!(doc.status, ExtractionStatus::Done);
        assert_eq!(doc.parsed_metrics().get("glucose").map(String::as_str), Some("95 mg/dL"));
        assert!(doc.embedding.is_some());
        assert!(doc.completed_at.is_some());
    }

    #[tokio::test]
    async fn oversized_upload_persists_nothing() {
        let small = ProcessorLimits {
            max_upload_bytes: 8,
            ..limits()
        };
        let (processor, store) = processor_with(Box::new(MockOcrEngine::new("", 0.0)), embedder(), small);
        let err = processor
            .process(upload("big.pdf", "application/pdf", vec![b'%'; 9]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PayloadTooLarge);
        assert!(store.list_documents("alice").unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_image_is_failed_with_reason() {
        let (processor, store) = processor_with(Box::new(MockOcrEngine::new("x", 1.0)), embedder(), limits());
        let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        bytes.extend_from_slice(&[0u8; 32]);

        let err = processor.process(upload("scan.png", "image/png", bytes)).await.unwrap_err();
        let CoreError::ExtractionFailed { document_id, reason } = err else {
            panic!("expected ExtractionFailed");
        };
        assert_eq!(reason, "corrupt or unreadable image");

        let doc = store.load_document(&document_id).unwrap().unwrap();
        assert_eq!(doc.status, ExtractionStatus::Failed);
        assert_eq!(doc.failure_reason.as_deref(), Some("corrupt or unreadable image"));
        assert!(doc.metrics.is_empty());
    }

    #[tokio::test]
    async fn mismatched_type_is_recorded_as_failed() {
        let (processor, store) = processor_with(Box::new(MockOcrEngine::new("x", 1.0)), embedder(), limits());
        let pdf = make_test_pdf(&[&["Glucose: 95 mg/dL"]]);
        let err = processor.process(upload("labs.png", "image/png", pdf)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExtractionFailed);

        let docs = store.list_documents("alice").unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].status, ExtractionStatus::Failed);
        assert_eq!(docs[0].failure_reason.as_deref(), Some("unsupported format"));
    }

    #[tokio::test]
    async fn file_name_is_sanitized() {
        let (processor, store) = processor_with(Box::new(MockOcrEngine::new("", 0.0)), embedder(), limits());
        let pdf = make_test_pdf(&[&["Pulse: 64 bpm"]]);
        let outcome = processor
            .process(upload("../../etc/<labs>.pdf", "application/pdf", pdf))
            .await
            .unwrap();
        assert_eq!(outcome.file_name, "labs.pdf");
        let doc = store.load_document(&outcome.document_id).unwrap().unwrap();
        assert_eq!(doc.content_sha256.len(), 64);
    }

    #[tokio::test]
    async fn embedding_failure_still_completes() {
        let failing = EmbeddingService::new(
            Arc::new(FlakyEmbedder::new(usize::MAX)),
            2_000,
            RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
        );
        let (processor, store) = processor_with(Box::new(MockOcrEngine::new("", 0.0)), failing, limits());
        let pdf = make_test_pdf(&[&["HbA1c: 5.4 %"]]);

        let outcome = processor.process(upload("a1c.pdf", "application/pdf", pdf)).await.unwrap();
        assert!(!outcome.embedded);
        let doc = store.load_document(&outcome.document_id).unwrap().unwrap();
        assert_eq!(doc.status, ExtractionStatus::Done);
        assert!(doc.embedding.is_none());
    }

    struct SlowOcr;

    impl OcrEngine for SlowOcr {
        fn recognize(&self, _png_bytes: &[u8]) -> Result<OcrPageResult, ExtractionError> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(OcrPageResult {
                text: "Glucose 90 mg/dL".into(),
                confidence: 0.9,
            })
        }
    }

    struct EmptyPages;

    impl PdfExtractor for EmptyPages {
        fn extract_pages(&self, _pdf_bytes: &[u8]) -> Result<Vec<String>, ExtractionError> {
            Ok(vec![String::new()])
        }
    }

    #[tokio::test]
    async fn slow_extraction_times_out_as_failed() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let extractor = DocumentExtractor::new(
            Box::new(EmptyPages),
            Box::new(SlowOcr),
            Arc::new(MetricVocabulary::new().unwrap()),
        )
        .with_pdf_renderer(Box::new(crate::pipeline::extraction::pdfium::MockPdfPageRenderer::new(1)), 150);
        let tight = ProcessorLimits {
            extraction_timeout: Duration::from_millis(50),
            ..limits()
        };
        let processor = DocumentProcessor::new(store.clone(), Arc::new(extractor), embedder(), tight);

        let err = processor
            .process(upload("scan.pdf", "application/pdf", b"%PDF-1.7 stub".to_vec()))
            .await
            .unwrap_err();
        let CoreError::ExtractionFailed { document_id, reason } = err else {
            panic!("expected ExtractionFailed");
        };
        assert_eq!(reason, "extraction timed out");
        let doc = store.load_document(&document_id).unwrap().unwrap();
        assert_eq!(doc.status, ExtractionStatus::Failed);
    }

    struct CountingOcr {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl OcrEngine for CountingOcr {
        fn recognize(&self, _png_bytes: &[u8]) -> Result<OcrPageResult, ExtractionError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(150));
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(OcrPageResult {
                text: "Glucose 90 mg/dL".into(),
                confidence: 0.9,
            })
        }
    }

    #[tokio::test]
    async fn timed_out_extractions_still_hold_their_worker_slot() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let extractor = DocumentExtractor::new(
            Box::new(EmptyPages),
            Box::new(CountingOcr {
                active: Arc::clone(&active),
                peak: Arc::clone(&peak),
            }),
            Arc::new(MetricVocabulary::new().unwrap()),
        )
        .with_pdf_renderer(Box::new(crate::pipeline::extraction::pdfium::MockPdfPageRenderer::new(1)), 150);
        let single = ProcessorLimits {
            extraction_timeout: Duration::from_millis(30),
            workers: 1,
            ..limits()
        };
        let processor = DocumentProcessor::new(store, Arc::new(extractor), embedder(), single);

        let stub = || upload("scan.pdf", "application/pdf", b"%PDF-1.7 stub".to_vec());
        let (a, b, c) = tokio::join!(
            processor.process(stub()),
            processor.process(stub()),
            processor.process(stub())
        );
        for result in [a, b, c] {
            assert_eq!(result.unwrap_err().kind(), ErrorKind::ExtractionFailed);
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    /// Delegates to SQLite but fails the `n`th save (1-based).
    struct FailingSave {
        inner: Arc<SqliteStore>,
        fail_on: usize,
        saves: AtomicUsize,
    }

    impl DocumentStore for FailingSave {
        fn save_document(&self, doc: &Document) -> Result<(), DatabaseError> {
            if self.saves.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
                return Err(DatabaseError::LockPoisoned);
            }
            self.inner.save_document(doc)
        }

        fn load_document(&self, id: &Uuid) -> Result<Option<Document>, DatabaseError> {
            self.inner.load_document(id)
        }

        fn list_documents(&self, owner_id: &str) -> Result<Vec<Document>, DatabaseError> {
            self.inner.list_documents(owner_id)
        }

        fn delete_document(&self, id: &Uuid) -> Result<bool, DatabaseError> {
            self.inner.delete_document(id)
        }
    }

    async fn process_with_failing_save(fail_on: usize) -> (CoreError, Arc<SqliteStore>) {
        let inner = Arc::new(SqliteStore::open_in_memory().unwrap());
        let store = Arc::new(FailingSave {
            inner: inner.clone(),
            fail_on,
            saves: AtomicUsize::new(0),
        });
        let extractor = DocumentExtractor::new(
            Box::new(PdfTextExtractor),
            Box::new(MockOcrEngine::new("", 0.0)),
            Arc::new(MetricVocabulary::new().unwrap()),
        );
        let processor = DocumentProcessor::new(store, Arc::new(extractor), embedder(), limits());
        let pdf = make_test_pdf(&[&["Glucose: 95 mg/dL"]]);
        let err = processor
            .process(upload("labs.pdf", "application/pdf", pdf))
            .await
            .unwrap_err();
        (err, inner)
    }

    #[tokio::test]
    async fn store_failure_while_processing_ends_failed() {
        let (err, store) = process_with_failing_save(2).await;
        assert_eq!(err.kind(), ErrorKind::Internal);

        let docs = store.list_documents("alice").unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].status, ExtractionStatus::Failed);
    }

    #[tokio::test]
    async fn store_failure_at_completion_ends_failed_without_metrics() {
        let (err, store) = process_with_failing_save(3).await;
        assert_eq!(err.kind(), ErrorKind::Internal);

        let docs = store.list_documents("alice").unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].status, ExtractionStatus::Failed);
        assert!(docs[0].metrics.is_empty());
        assert_eq!(docs[0].failure_reason.as_deref(), Some("could not save the report"));
    }
}
