use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use super::types::EmbeddingModel;
use super::{StorageError, EMBEDDING_DIM};
use crate::config::RetryPolicy;

// ═══════════════════════════════════════════════════════════
// ONNX embedder, behind the `onnx-embeddings` feature
// ═══════════════════════════════════════════════════════════

#[cfg(feature = "onnx-embeddings")]
mod onnx {
    use super::{EmbeddingModel, StorageError, EMBEDDING_DIM};
    use ort::session::Session;
    use std::path::Path;
    use std::sync::Mutex;

    /// MiniLM was trained on 256-token inputs; its position table stops at 512.
    pub const MAX_TOKENS: usize = 256;

    fn truncation_params() -> tokenizers::TruncationParams {
        tokenizers::TruncationParams {
            max_length: MAX_TOKENS,
            ..Default::default()
        }
    }

    /// all-MiniLM-L6-v2 through ONNX Runtime.
    ///
    /// The model directory holds `model.onnx` and `tokenizer.json`.
    /// `Session::run` needs `&mut self`, hence the mutex.
    pub struct OnnxEmbedder {
        session: Mutex<Session>,
        tokenizer: tokenizers::Tokenizer,
    }

    impl OnnxEmbedder {
        pub fn load(model_dir: &Path) -> Result<Self, StorageError> {
            let model_path = model_dir.join("model.onnx");
            let tokenizer_path = model_dir.join("tokenizer.json");
            for path in [&model_path, &tokenizer_path] {
                if !path.exists() {
                    return Err(StorageError::ModelNotFound(path.clone()));
                }
            }

            let session = Session::builder()
                .and_then(|b| b.with_intra_threads(2))
                .and_then(|b| b.commit_from_file(&model_path))
                .map_err(|e: ort::Error| StorageError::ModelInit(format!("ONNX load failed: {e}")))?;

            let mut tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path)
                .map_err(|e| StorageError::ModelInit(format!("Tokenizer load failed: {e}")))?;
            tokenizer
                .with_truncation(Some(truncation_params()))
                .map_err(|e| StorageError::ModelInit(format!("Tokenizer truncation: {e}")))?;

            tracing::info!(dir = %model_dir.display(), "ONNX embedder loaded");
            Ok(Self {
                session: Mutex::new(session),
                tokenizer,
            })
        }

        /// Mean-pooled (attention-masked) and L2-normalized sentence vector.
        fn infer(&self, text: &str) -> Result<Vec<f32>, StorageError> {
            use ort::value::TensorRef;

            let encoding = self
                .tokenizer
                .encode(text, true)
                .map_err(|e| StorageError::Tokenization(e.to_string()))?;

            let to_i64 = |v: &[u32]| v.iter().map(|&x| x as i64).collect::<Vec<i64>>();
            let input_ids = to_i64(encoding.get_ids());
            let attention_mask = to_i64(encoding.get_attention_mask());
            let token_type_ids = to_i64(encoding.get_type_ids());
            let seq_len = input_ids.len();

            let shape_err = |e: ndarray::ShapeError| StorageError::Embedding(e.to_string());
            let ids = ndarray::Array2::from_shape_vec((1, seq_len), input_ids).map_err(shape_err)?;
            let mask = ndarray::Array2::from_shape_vec((1, seq_len), attention_mask.clone())
                .map_err(shape_err)?;
            let types = ndarray::Array2::from_shape_vec((1, seq_len), token_type_ids).map_err(shape_err)?;

            let tensor_err = |e: ort::Error| StorageError::Embedding(e.to_string());
            let ids = TensorRef::from_array_view(&ids).map_err(tensor_err)?;
            let mask_t = TensorRef::from_array_view(&mask).map_err(tensor_err)?;
            let types = TensorRef::from_array_view(&types).map_err(tensor_err)?;

            let mut session = self
                .session
                .lock()
                .map_err(|_| StorageError::Embedding("session lock poisoned".into()))?;
            let outputs = session
                .run(ort::inputs![ids, mask_t, types])
                .map_err(|e| StorageError::Embedding(format!("ONNX inference failed: {e}")))?;

            // [1, seq_len, EMBEDDING_DIM]
            let (shape, data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| StorageError::Embedding(format!("output extraction: {e}")))?;
            if shape.len() != 3 || shape[2] as usize != EMBEDDING_DIM {
                return Err(StorageError::Embedding(format!("unexpected output shape {shape:?}")));
            }

            let mut pooled = vec![0.0f32; EMBEDDING_DIM];
            let mut mask_sum = 0.0f32;
            for (token, &m) in attention_mask.iter().enumerate().take(seq_len) {
                let m = m as f32;
                mask_sum += m;
                let offset = token * EMBEDDING_DIM;
                for (dim, p) in pooled.iter_mut().enumerate() {
                    *p += data[offset + dim] * m;
                }
            }
            if mask_sum > 0.0 {
                pooled.iter_mut().for_each(|v| *v /= mask_sum);
            }
            super::l2_normalize(&mut pooled);
            Ok(pooled)
        }
    }

    impl EmbeddingModel for OnnxEmbedder {
        fn embed(&self, text: &str) -> Result<Vec<f32>, StorageError> {
            self.infer(text)
        }

        fn dimension(&self) -> usize {
            EMBEDDING_DIM
        }
    }

}

#[cfg(feature = "onnx-embeddings")]
pub use onnx::OnnxEmbedder;

// ═══════════════════════════════════════════════════════════
// Hashing embedder
// ═══════════════════════════════════════════════════════════

/// Signed feature hashing of lowercase word unigrams and bigrams.
///
/// Needs no model files, so it is the default in builds without
/// `onnx-embeddings` and in tests. Texts sharing vocabulary land close
/// together; it carries no deeper semantics.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new() -> Self {
        Self::with_dimension(EMBEDDING_DIM)
    }

    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn add_feature(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        let slot = (u64::from_le_bytes(head) % self.dimension as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[slot] += sign * weight;
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddingModel for HashEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, StorageError> {
        let mut vector = vec![0.0f32; self.dimension];
        let words: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();

        for word in &words {
            self.add_feature(&mut vector, word, 1.0);
        }
        for pair in words.windows(2) {
            self.add_feature(&mut vector, &format!("{} {}", pair[0], pair[1]), 0.5);
        }

        l2_normalize(&mut vector);
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

pub(crate) fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 && norm.is_finite() {
        vector.iter_mut().for_each(|v| *v /= norm);
    }
}

/// The best embedding model this build can offer.
///
/// With `onnx-embeddings`, a missing or broken model is an error: embedding
/// is required at startup.
pub fn default_embedding_model(model_dir: &std::path::Path) -> Result<Arc<dyn EmbeddingModel>, StorageError> {
    #[cfg(feature = "onnx-embeddings")]
    {
        Ok(Arc::new(OnnxEmbedder::load(model_dir)?))
    }
    #[cfg(not(feature = "onnx-embeddings"))]
    {
        tracing::info!(dir = %model_dir.display(), "Built without `onnx-embeddings`, using hashing embedder");
        Ok(Arc::new(HashEmbedder::new()))
    }
}

// ═══════════════════════════════════════════════════════════
// Embedding service
// ═══════════════════════════════════════════════════════════

/// Shared entry point for embedding: input budget, blocking-pool dispatch,
/// dimension check and bounded retry of transient failures.
#[derive(Clone)]
pub struct EmbeddingService {
    model: Arc<dyn EmbeddingModel>,
    char_budget: usize,
    retry: RetryPolicy,
}

impl EmbeddingService {
    pub fn new(model: Arc<dyn EmbeddingModel>, char_budget: usize, retry: RetryPolicy) -> Self {
        Self {
            model,
            char_budget: char_budget.max(1),
            retry,
        }
    }

    pub fn dimension(&self) -> usize {
        self.model.dimension()
    }

    /// One embedding call at startup. Any failure here is fatal to the caller.
    pub async fn probe(&self) -> Result<(), StorageError> {
        self.embed_once("startup probe".to_string()).await.map(|_| ())
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, StorageError> {
        let input: String = text.chars().take(self.char_budget).collect();
        let attempts = self.retry.max_attempts.max(1);

        let mut attempt = 1;
        loop {
            match self.embed_once(input.clone()).await {
                Ok(vector) => return Ok(vector),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "Embedding failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn embed_once(&self, text: String) -> Result<Vec<f32>, StorageError> {
        let model = Arc::clone(&self.model);
        let vector = tokio::task::spawn_blocking(move || model.embed(&text))
            .await
            .map_err(|e| StorageError::Worker(e.to_string()))??;

        let expected = self.model.dimension();
        if vector.len() != expected {
            return Err(StorageError::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }
        Ok(vector)
    }
}

/// Blend a query vector with a report vector: `(1 - weight) * query +
/// weight * report`, re-normalized. Returns the query unchanged when the
/// dimensions differ or the weight is zero.
pub fn blend_embeddings(query: &[f32], report: &[f32], weight: f32) -> Vec<f32> {
    if query.len() != report.len() || weight <= 0.0 {
        return query.to_vec();
    }
    let weight = weight.min(1.0);
    let mut blended: Vec<f32> = query
        .iter()
        .zip(report)
        .map(|(q, r)| (1.0 - weight) * q + weight * r)
        .collect();
    l2_normalize(&mut blended);
    blended
}

/// Test double that fails its first `failures` calls with a transient error.
pub struct FlakyEmbedder {
    inner: HashEmbedder,
    failures: usize,
    calls: AtomicUsize,
}

impl FlakyEmbedder {
    pub fn new(failures: usize) -> Self {
        Self {
            inner: HashEmbedder::new(),
            failures,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EmbeddingModel for FlakyEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, StorageError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(StorageError::Embedding(format!("simulated failure {}", call + 1)));
        }
        self.inner.embed(text)
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::pipeline::storage::vectordb::cosine_similarity;

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn hash_embed_is_deterministic_and_normalized() {
        let embedder = HashEmbedder::new();
        let a = embedder.embed("Fasting glucose 95 mg/dL").unwrap();
        let b = embedder.embed("Fasting glucose 95 mg/dL").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), EMBEDDING_DIM);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4, "norm = {norm}");
    }

    #[test]
    fn hash_embed_is_case_insensitive() {
        let embedder = HashEmbedder::new();
        assert_eq!(
            embedder.embed("GLUCOSE level").unwrap(),
            embedder.embed("glucose LEVEL").unwrap()
        );
    }

    #[test]
    fn shared_vocabulary_scores_higher() {
        let embedder = HashEmbedder::new();
        let query = embedder.embed("what does my glucose level mean").unwrap();
        let related = embedder.embed("a fasting glucose level below 100 mg/dL is normal").unwrap();
        let unrelated = embedder.embed("thyroid hormone regulates metabolism").unwrap();
        assert!(cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated));
    }

    #[test]
    fn empty_text_embeds_to_zero_vector() {
        let v = HashEmbedder::new().embed("  ").unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn blend_moves_query_toward_report() {
        let q = vec![1.0, 0.0];
        let r = vec![0.0, 1.0];
        let blended = blend_embeddings(&q, &r, 0.5);
        assert!((blended[0] - blended[1]).abs() < 1e-6);
        assert_eq!(blend_embeddings(&q, &r, 0.0), q);
        assert_eq!(blend_embeddings(&q, &[1.0], 0.5), q);
    }

    #[tokio::test]
    async fn service_truncates_to_budget() {
        let service = EmbeddingService::new(Arc::new(HashEmbedder::new()), 7, fast_retry(1));
        let long = service.embed("glucose hemoglobin cholesterol").await.unwrap();
        let short = service.embed("glucose").await.unwrap();
        assert_eq!(long, short);
    }

    #[tokio::test]
    async fn service_retries_transient_failures() {
        let flaky = Arc::new(FlakyEmbedder::new(2));
        let service = EmbeddingService::new(flaky.clone(), 2000, fast_retry(3));
        let v = service.embed("pulse 64").await.unwrap();
        assert_eq!(v.len(), EMBEDDING_DIM);
        assert_eq!(flaky.calls(), 3);
    }

    #[tokio::test]
    async fn service_gives_up_after_max_attempts() {
        let flaky = Arc::new(FlakyEmbedder::new(10));
        let service = EmbeddingService::new(flaky.clone(), 2000, fast_retry(3));
        let err = service.embed("pulse 64").await.unwrap_err();
        assert!(matches!(err, StorageError::Embedding(_)));
        assert_eq!(flaky.calls(), 3);
    }

    struct WrongDimension;

    impl EmbeddingModel for WrongDimension {
        fn embed(&self, _text: &str) -> Result<Vec<f32>, StorageError> {
            Ok(vec![0.5; 3])
        }
        fn dimension(&self) -> usize {
            EMBEDDING_DIM
        }
    }

    #[tokio::test]
    async fn dimension_mismatch_is_not_retried() {
        let service = EmbeddingService::new(Arc::new(WrongDimension), 2000, fast_retry(3));
        let err = service.probe().await.unwrap_err();
        assert!(matches!(err, StorageError::DimensionMismatch { expected: 384, actual: 3 }));
    }

    #[cfg(not(feature = "onnx-embeddings"))]
    #[test]
    fn default_model_without_onnx_is_hashing() {
        let model = default_embedding_model(std::path::Path::new("/nonexistent")).unwrap();
        assert_eq!(model.dimension(), EMBEDDING_DIM);
    }
}
