//! Streaming chat against an Ollama-compatible model endpoint.
//!
//! `/api/chat` with `stream: true` answers with newline-delimited JSON, one
//! object per fragment, the last one carrying `done: true`.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use super::types::PromptMessage;
use super::RagError;
use crate::config::CoreConfig;

/// Ordered text fragments from the model. Ends after the final fragment or
/// after the first error.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, RagError>> + Send>>;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

/// Longest upstream error body kept in an error.
const MAX_ERROR_BODY: usize = 512;

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Open a streaming chat. Connection and HTTP status failures surface
    /// here; failures after that arrive as stream items.
    async fn stream_chat(&self, messages: &[PromptMessage]) -> Result<FragmentStream, RagError>;

    /// Reachable and serving the configured model.
    async fn health(&self) -> Result<(), RagError>;

    fn model_name(&self) -> &str;
}

#[derive(Debug, Clone, Copy, Serialize)]
struct ChatOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [PromptMessage],
    stream: bool,
    options: ChatOptions,
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChatChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct ChatChunkMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagsModel>,
}

#[derive(Deserialize)]
struct TagsModel {
    name: String,
}

pub struct OllamaClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
    options: ChatOptions,
}

impl OllamaClient {
    /// No overall request timeout: streams are long-lived and guarded by the
    /// first-fragment and stall timeouts in the generator instead.
    pub fn new(
        base_url: &str,
        model: &str,
        connect_timeout: Duration,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<Self, RagError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| RagError::ModelConnection(format!("HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
            options: ChatOptions {
                temperature,
                num_predict: max_tokens,
            },
        })
    }

    pub fn from_config(config: &CoreConfig) -> Result<Self, RagError> {
        Self::new(
            &config.model_endpoint,
            &config.model_name,
            config.connect_timeout,
            config.temperature,
            config.max_tokens,
        )
    }

    fn map_send_error(&self, e: reqwest::Error) -> RagError {
        if e.is_connect() {
            RagError::ModelConnection(self.base_url.clone())
        } else if e.is_timeout() {
            RagError::ModelConnection(format!("{} timed out", self.base_url))
        } else {
            RagError::ModelConnection(e.to_string())
        }
    }

    async fn error_for_status(response: reqwest::Response) -> RagError {
        let status = response.status().as_u16();
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        RagError::ModelResponse { status, body }
    }
}

#[async_trait]
impl ModelClient for OllamaClient {
    async fn stream_chat(&self, messages: &[PromptMessage]) -> Result<FragmentStream, RagError> {
        let url = format!("{}/api/chat", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages,
            stream: true,
            options: self.options,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        if !response.status().is_success() {
            return Err(Self::error_for_status(response).await);
        }

        tracing::debug!(model = %self.model, messages = messages.len(), "Model stream opened");
        Ok(ndjson_fragments(response.bytes_stream()))
    }

    async fn health(&self) -> Result<(), RagError> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        if !response.status().is_success() {
            return Err(Self::error_for_status(response).await);
        }

        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| RagError::ResponseParsing(e.to_string()))?;
        if tags.models.iter().any(|m| m.name.starts_with(&self.model)) {
            Ok(())
        } else {
            Err(RagError::ModelUnavailable(self.model.clone()))
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

struct NdjsonState<S> {
    bytes: Pin<Box<S>>,
    buffer: Vec<u8>,
    pending: VecDeque<Result<String, RagError>>,
    finished: bool,
}

impl<S> NdjsonState<S> {
    fn drain_lines(&mut self) {
        while !self.finished {
            let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') else {
                break;
            };
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.parse_line(&line[..pos]);
        }
    }

    fn parse_line(&mut self, line: &[u8]) {
        if line.iter().all(u8::is_ascii_whitespace) {
            return;
        }
        match serde_json::from_slice::<ChatChunk>(line) {
            Ok(chunk) => {
                if let Some(error) = chunk.error {
                    self.pending.push_back(Err(RagError::StreamingError(error)));
                    self.finished = true;
                    return;
                }
                if let Some(text) = chunk.message.map(|m| m.content).filter(|t| !t.is_empty()) {
                    self.pending.push_back(Ok(text));
                }
                if chunk.done {
                    self.finished = true;
                }
            }
            Err(e) => {
                self.pending.push_back(Err(RagError::ResponseParsing(e.to_string())));
                self.finished = true;
            }
        }
    }
}

/// Turn a byte stream of NDJSON chat chunks into a fragment stream. Chunk
/// boundaries need not align with lines.
pub fn ndjson_fragments<S, B, E>(bytes: S) -> FragmentStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = NdjsonState {
        bytes: Box::pin(bytes),
        buffer: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    Box::pin(futures_util::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            if st.finished {
                return None;
            }
            match st.bytes.next().await {
                Some(Ok(chunk)) => {
                    st.buffer.extend_from_slice(chunk.as_ref());
                    st.drain_lines();
                }
                Some(Err(e)) => {
                    st.pending.push_back(Err(RagError::StreamingError(e.to_string())));
                    st.finished = true;
                }
                None => {
                    let rest = std::mem::take(&mut st.buffer);
                    st.parse_line(&rest);
                    if !st.finished {
                        // Body ended without the `done` marker.
                        st.pending.push_back(Err(RagError::StreamingError(
                            "stream ended before completion".into(),
                        )));
                    }
                    st.finished = true;
                }
            }
        }
    }))
}

// ═══════════════════════════════════════════════════════════
// Mock model client
// ═══════════════════════════════════════════════════════════

#[derive(Clone)]
struct MockScript {
    fragments: Vec<String>,
    fail_at: Option<usize>,
    hang_after: Option<usize>,
    delay: Duration,
}

/// Scripted model for tests: yields the configured fragments, optionally
/// failing or hanging at a given position.
pub struct MockModelClient {
    script: MockScript,
    fail_on_connect: bool,
    healthy: bool,
    produced: Arc<AtomicUsize>,
    last_prompt: Mutex<Option<Vec<PromptMessage>>>,
}

impl MockModelClient {
    pub fn new(fragments: &[&str]) -> Self {
        Self {
            script: MockScript {
                fragments: fragments.iter().map(|f| f.to_string()).collect(),
                fail_at: None,
                hang_after: None,
                delay: Duration::ZERO,
            },
            fail_on_connect: false,
            healthy: true,
            produced: Arc::new(AtomicUsize::new(0)),
            last_prompt: Mutex::new(None),
        }
    }

    /// Yield an upstream error in place of fragment `index`.
    pub fn fail_at(mut self, index: usize) -> Self {
        self.script.fail_at = Some(index);
        self
    }

    /// Stop producing (without ending) after `count` fragments.
    pub fn hang_after(mut self, count: usize) -> Self {
        self.script.hang_after = Some(count);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.script.delay = delay;
        self
    }

    pub fn failing_connect(mut self) -> Self {
        self.fail_on_connect = true;
        self.healthy = false;
        self
    }

    /// Fragments actually handed out so far, across all streams.
    pub fn produced(&self) -> usize {
        self.produced.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<Vec<PromptMessage>> {
        self.last_prompt.lock().ok().and_then(|p| p.clone())
    }
}

#[async_trait]
impl ModelClient for MockModelClient {
    async fn stream_chat(&self, messages: &[PromptMessage]) -> Result<FragmentStream, RagError> {
        if let Ok(mut last) = self.last_prompt.lock() {
            *last = Some(messages.to_vec());
        }
        if self.fail_on_connect {
            return Err(RagError::ModelConnection("mock endpoint refused".into()));
        }

        let produced = Arc::clone(&self.produced);
        let stream = futures_util::stream::unfold(
            (0usize, self.script.clone(), false),
            move |(index, script, failed)| {
                let produced = Arc::clone(&produced);
                async move {
                    if failed {
                        return None;
                    }
                    if script.hang_after == Some(index) {
                        std::future::pending::<()>().await;
                    }
                    if !script.delay.is_zero() {
                        tokio::time::sleep(script.delay).await;
                    }
                    if script.fail_at == Some(index) {
                        let err = RagError::StreamingError("simulated upstream failure".into());
                        return Some((Err(err), (index, script, true)));
                    }
                    let fragment = script.fragments.get(index)?.clone();
                    produced.fetch_add(1, Ordering::SeqCst);
                    Some((Ok(fragment), (index + 1, script, false)))
                }
            },
        );
        Ok(Box::pin(stream))
    }

    async fn health(&self) -> Result<(), RagError> {
        if self.healthy {
            Ok(())
        } else {
            Err(RagError::ModelConnection("mock endpoint refused".into()))
        }
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}
