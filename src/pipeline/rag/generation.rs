use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;

use super::ollama::{FragmentStream, ModelClient};
use super::types::{PromptContext, StreamEvent, TruncationReason};
use super::RagError;
use crate::cancellation::CancellationToken;
use crate::config::CoreConfig;
use crate::pipeline::stream_guard::{StreamGuard, StreamGuardConfig};

#[derive(Debug, Clone)]
pub struct GenerationLimits {
    /// How long to wait for the model's first fragment.
    pub first_fragment_timeout: Duration,
    /// Longest gap between two fragments once streaming.
    pub stall_timeout: Duration,
    pub guard: StreamGuardConfig,
}

impl GenerationLimits {
    pub fn from_config(config: &CoreConfig) -> Self {
        Self {
            first_fragment_timeout: config.first_fragment_timeout,
            stall_timeout: config.stall_timeout,
            guard: config.stream_guard.clone(),
        }
    }
}

impl Default for GenerationLimits {
    fn default() -> Self {
        Self {
            first_fragment_timeout: Duration::from_secs(60),
            stall_timeout: Duration::from_secs(30),
            guard: StreamGuardConfig::default(),
        }
    }
}

/// Streams an answer from the model for an assembled prompt.
pub struct AnswerGenerator {
    client: Arc<dyn ModelClient>,
    limits: GenerationLimits,
}

impl AnswerGenerator {
    pub fn new(client: Arc<dyn ModelClient>, limits: GenerationLimits) -> Self {
        Self { client, limits }
    }

    pub fn client(&self) -> &Arc<dyn ModelClient> {
        &self.client
    }

    /// Open the model stream and wait for its first fragment.
    ///
    /// Anything that goes wrong before that fragment (connection refused,
    /// HTTP error, empty answer, first-fragment timeout, cancellation) is
    /// `GenerationFailed`. Once this returns `Ok`, every failure becomes a
    /// truncation event on the returned stream instead.
    pub async fn generate(
        &self,
        context: &PromptContext,
        cancel: CancellationToken,
    ) -> Result<AnswerStream, RagError> {
        let mut fragments = self
            .client
            .stream_chat(&context.messages)
            .await
            .map_err(|e| RagError::GenerationFailed(e.to_string()))?;

        let first = loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                next = tokio::time::timeout(self.limits.first_fragment_timeout, fragments.next()) => Some(next),
            };
            match step {
                None => return Err(RagError::GenerationFailed("cancelled before the first fragment".into())),
                Some(Err(_)) => {
                    return Err(RagError::GenerationFailed(format!(
                        "no output within {:?}",
                        self.limits.first_fragment_timeout
                    )))
                }
                Some(Ok(None)) => return Err(RagError::GenerationFailed("model returned an empty answer".into())),
                Some(Ok(Some(Err(e)))) => return Err(RagError::GenerationFailed(e.to_string())),
                Some(Ok(Some(Ok(text)))) if text.is_empty() => continue,
                Some(Ok(Some(Ok(text)))) => break text,
            }
        };

        tracing::debug!(model = self.client.model_name(), "First fragment received");
        Ok(AnswerStream {
            fragments: Some(fragments),
            pending_first: Some(first),
            text: String::new(),
            guard: StreamGuard::new(self.limits.guard.clone()),
            stall_timeout: self.limits.stall_timeout,
            cancel,
            finished: false,
        })
    }
}

enum Step {
    Cancelled,
    Next(Result<Option<Result<String, RagError>>, tokio::time::error::Elapsed>),
}

/// A started answer. Yields `Fragment` events followed by exactly one
/// terminal event, then `None` forever. Not restartable.
///
/// The upstream connection is dropped as soon as a terminal event is
/// produced, or when the stream itself is dropped.
pub struct AnswerStream {
    fragments: Option<FragmentStream>,
    pending_first: Option<String>,
    text: String,
    guard: StreamGuard,
    stall_timeout: Duration,
    cancel: CancellationToken,
    finished: bool,
}

impl AnswerStream {
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        loop {
            if self.finished {
                return None;
            }
            if self.cancel.is_cancelled() {
                return Some(self.truncate(TruncationReason::Cancelled));
            }
            if let Some(first) = self.pending_first.take() {
                return Some(self.accept(first));
            }

            if self.fragments.is_none() {
                return Some(self.complete());
            }
            let step = match self.fragments.as_mut() {
                Some(fragments) => tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Step::Cancelled,
                    next = tokio::time::timeout(self.stall_timeout, fragments.next()) => Step::Next(next),
                },
                None => continue,
            };

            return Some(match step {
                Step::Cancelled => self.truncate(TruncationReason::Cancelled),
                Step::Next(Err(_)) => {
                    tracing::warn!(timeout = ?self.stall_timeout, "Model stream stalled");
                    self.truncate(TruncationReason::Stalled)
                }
                Step::Next(Ok(None)) => self.complete(),
                Step::Next(Ok(Some(Err(e)))) => {
                    tracing::warn!(error = %e, chars = self.text.len(), "Model stream failed mid-answer");
                    self.truncate(TruncationReason::UpstreamError)
                }
                Step::Next(Ok(Some(Ok(text)))) if text.is_empty() => continue,
                Step::Next(Ok(Some(Ok(text)))) => self.accept(text),
            });
        }
    }

    /// Text emitted so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn accept(&mut self, text: String) -> StreamEvent {
        if let Err(degeneration) = self.guard.check(&text) {
            tracing::warn!(%degeneration, fragments = self.guard.fragments_seen(), "Degenerate output, stopping");
            return self.truncate(TruncationReason::Degenerate);
        }
        self.text.push_str(&text);
        StreamEvent::Fragment { text }
    }

    fn complete(&mut self) -> StreamEvent {
        self.finished = true;
        self.fragments = None;
        StreamEvent::Complete {
            full_text: self.text.clone(),
        }
    }

    fn truncate(&mut self, reason: TruncationReason) -> StreamEvent {
        self.finished = true;
        self.fragments = None;
        StreamEvent::Truncated {
            reason,
            partial_text: self.text.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::cancellation_pair;
    use crate::pipeline::rag::ollama::MockModelClient;
    use crate::pipeline::rag::types::{PromptMessage, PromptRole};

    fn context() -> PromptContext {
        PromptContext {
            messages: vec![PromptMessage::new(PromptRole::User, "Is 95 mg/dL normal?")],
            total_chars: 19,
            budget: 1000,
            instructions_truncated: false,
            history_turns: 0,
            metrics_included: 0,
            knowledge_included: 0,
        }
    }

    fn limits() -> GenerationLimits {
        GenerationLimits {
            first_fragment_timeout: Duration::from_millis(200),
            stall_timeout: Duration::from_millis(100),
            guard: StreamGuardConfig::default(),
        }
    }

    fn generator(mock: MockModelClient) -> (AnswerGenerator, Arc<MockModelClient>) {
        let mock = Arc::new(mock);
        (AnswerGenerator::new(mock.clone(), limits()), mock)
    }

    async fn drain(stream: &mut AnswerStream) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = stream.next_event().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn full_answer_ends_with_complete() {
        let (generator, _) = generator(MockModelClient::new(&["Your ", "glucose ", "is normal."]));
        let mut stream = generator.generate(&context(), CancellationToken::never()).await.unwrap();
        let events = drain(&mut stream).await;

        assert_eq!(events.len(), 4);
        let joined: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Fragment { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Complete {
                full_text: joined.clone()
            })
        );
        assert_eq!(joined, "Your glucose is normal.");
        assert!(stream.next_event().await.is_none());
    }

    #[tokio::test]
    async fn failure_before_first_fragment_is_generation_failed() {
        let (generator, _) = generator(MockModelClient::new(&["never"]).fail_at(0));
        let err = generator.generate(&context(), CancellationToken::never()).await.err().unwrap();
        assert!(matches!(err, RagError::GenerationFailed(_)));
    }

    #[tokio::test]
    async fn connection_refused_is_generation_failed() {
        let (generator, _) = generator(MockModelClient::new(&["x"]).failing_connect());
        let err = generator.generate(&context(), CancellationToken::never()).await.err().unwrap();
        assert!(matches!(err, RagError::GenerationFailed(_)));
    }

    #[tokio::test]
    async fn empty_answer_is_generation_failed() {
        let (generator, _) = generator(MockModelClient::new(&[]));
        let err = generator.generate(&context(), CancellationToken::never()).await.err().unwrap();
        assert!(matches!(err, RagError::GenerationFailed(_)));
    }

    #[tokio::test]
    async fn silent_model_times_out_before_first_fragment() {
        let (generator, _) = generator(MockModelClient::new(&["late"]).hang_after(0));
        let err = generator.generate(&context(), CancellationToken::never()).await.err().unwrap();
        assert!(matches!(err, RagError::GenerationFailed(m) if m.starts_with("no output")));
    }

    #[tokio::test]
    async fn mid_stream_failure_keeps_partial_answer() {
        let (generator, _) = generator(MockModelClient::new(&["a", "b", "c", "d"]).fail_at(2));
        let mut stream = generator.generate(&context(), CancellationToken::never()).await.unwrap();
        let events = drain(&mut stream).await;
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Truncated {
                reason: TruncationReason::UpstreamError,
                partial_text: "ab".into()
            })
        );
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn stall_truncates() {
        let (generator, _) = generator(MockModelClient::new(&["a", "b", "c"]).hang_after(2));
        let mut stream = generator.generate(&context(), CancellationToken::never()).await.unwrap();
        let events = drain(&mut stream).await;
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Truncated { reason: TruncationReason::Stalled, partial_text }) if partial_text == "ab"
        ));
    }

    #[tokio::test]
    async fn cancellation_stops_production() {
        let fragments: Vec<String> = (0..50).map(|i| format!("w{i} ")).collect();
        let refs: Vec<&str> = fragments.iter().map(String::as_str).collect();
        let (generator, mock) =
            generator(MockModelClient::new(&refs).with_delay(Duration::from_millis(10)));
        let (handle, token) = cancellation_pair();

        let mut stream = generator.generate(&context(), token).await.unwrap();
        for _ in 0..3 {
            assert!(matches!(stream.next_event().await, Some(StreamEvent::Fragment { .. })));
        }
        handle.cancel();

        let event = stream.next_event().await.unwrap();
        assert!(matches!(
            event,
            StreamEvent::Truncated { reason: TruncationReason::Cancelled, ref partial_text } if partial_text == "w0 w1 w2 "
        ));
        assert!(stream.next_event().await.is_none());

        let produced = mock.produced();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(mock.produced(), produced);
        assert!(produced <= 4);
    }

    #[tokio::test]
    async fn repeated_fragment_is_degenerate() {
        let refs = vec!["la"; 30];
        let (generator, _) = generator(MockModelClient::new(&refs));
        let mut stream = generator.generate(&context(), CancellationToken::never()).await.unwrap();
        let events = drain(&mut stream).await;

        let fragments = events.iter().filter(|e| !e.is_terminal()).count();
        assert_eq!(fragments, 19);
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Truncated { reason: TruncationReason::Degenerate, .. })
        ));
    }
}
