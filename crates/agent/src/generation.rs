//! Generation gateway — the only path from the agent to a model.
//!
//! Two operations:
//! - `complete`: one-shot text, used for the session-opening greeting
//! - `stream_reply`: ordered fragments ending in exactly one terminal event
//!
//! A failed stream is reported once and never retried or resumed.
//! Cancelling a stream stops forwarding only; the provider call is left to
//! finish and whatever it still produces is drained and discarded.

use std::sync::Arc;

use tandem_core::{Message, Provider, ProviderRequest, StreamChunk, Usage};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Provider failures as seen by callers of the gateway.
pub use tandem_core::ProviderError as GenerationError;

/// One event of a streamed reply.
#[derive(Debug)]
pub enum GenerationEvent {
    /// Next piece of text, verbatim.
    Fragment(String),
    /// The reply finished.
    Done(Option<Usage>),
    /// The reply failed; no further events follow.
    Failed(GenerationError),
}

/// Wraps a provider with the model settings for this deployment.
pub struct GenerationGateway {
    provider: Arc<dyn Provider>,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
}

impl GenerationGateway {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: 0.7,
            max_tokens: None,
        }
    }

    /// Model settings from the application config.
    pub fn from_config(provider: Arc<dyn Provider>, config: &tandem_config::AppConfig) -> Self {
        let model = config
            .providers
            .get(&config.default_provider)
            .and_then(|p| p.default_model.clone())
            .unwrap_or_else(|| config.default_model.clone());

        Self::new(provider, model)
            .with_temperature(config.default_temperature)
            .with_max_tokens(config.default_max_tokens)
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request(&self, system: String, messages: Vec<Message>, stream: bool) -> ProviderRequest {
        ProviderRequest {
            model: self.model.clone(),
            system: Some(system),
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream,
        }
    }

    /// Complete text for a system prompt and ordered messages.
    pub async fn complete(
        &self,
        system: impl Into<String>,
        messages: Vec<Message>,
    ) -> Result<String, GenerationError> {
        let response = self
            .provider
            .complete(self.request(system.into(), messages, false))
            .await?;
        Ok(response.content)
    }

    /// Stream a reply. The receiver yields fragments followed by exactly
    /// one `Done` or `Failed`, unless `cancel` fires first, in which case
    /// the receiver simply closes.
    pub fn stream_reply(
        &self,
        system: impl Into<String>,
        messages: Vec<Message>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<GenerationEvent> {
        let (tx, rx) = mpsc::channel(64);
        let provider = self.provider.clone();
        let request = self.request(system.into(), messages, true);

        tokio::spawn(async move {
            // Not raced against `cancel`: dropping this future would abort
            // the provider request.
            let mut chunks = match provider.stream(request).await {
                Ok(chunks) => chunks,
                Err(e) => {
                    if !cancel.is_cancelled() {
                        let _ = tx.send(GenerationEvent::Failed(e)).await;
                    }
                    return;
                }
            };

            let mut usage = None;
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    chunk = chunks.recv() => Some(chunk),
                };

                let Some(chunk) = next else {
                    debug!("Stream cancelled, discarding remaining output");
                    while chunks.recv().await.is_some() {}
                    return;
                };

                match chunk {
                    Some(Ok(StreamChunk {
                        content,
                        done,
                        usage: chunk_usage,
                    })) => {
                        if chunk_usage.is_some() {
                            usage = chunk_usage;
                        }
                        if let Some(text) = content.filter(|t| !t.is_empty())
                            && tx.send(GenerationEvent::Fragment(text)).await.is_err()
                        {
                            // Nobody listening any more.
                            while chunks.recv().await.is_some() {}
                            return;
                        }
                        if done {
                            let _ = tx.send(GenerationEvent::Done(usage)).await;
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, kind = e.kind(), "Generation stream failed");
                        let _ = tx.send(GenerationEvent::Failed(e)).await;
                        return;
                    }
                    None => {
                        let _ = tx
                            .send(GenerationEvent::Failed(GenerationError::StreamInterrupted(
                                "provider stream closed before completion".into(),
                            )))
                            .await;
                        return;
                    }
                }
            }
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tandem_core::{ChunkReceiver, ProviderResponse};
    use tokio::sync::Notify;

    /// Emits a fixed list of chunk results.
    struct ScriptedProvider {
        script: Mutex<Vec<Result<StreamChunk, GenerationError>>>,
        last_request: Mutex<Option<ProviderRequest>>,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Result<StreamChunk, GenerationError>>) -> Self {
            Self {
                script: Mutex::new(script),
                last_request: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            request: ProviderRequest,
        ) -> Result<ProviderResponse, GenerationError> {
            *self.last_request.lock().unwrap() = Some(request.clone());
            Ok(ProviderResponse {
                content: "Hello there".into(),
                usage: None,
                model: request.model,
            })
        }

        async fn stream(&self, request: ProviderRequest) -> Result<ChunkReceiver, GenerationError> {
            *self.last_request.lock().unwrap() = Some(request);
            let script = std::mem::take(&mut *self.script.lock().unwrap());
            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                for item in script {
                    if tx.send(item).await.is_err() {
                        return;
                    }
                }
            });
            Ok(rx)
        }
    }

    async fn collect(mut rx: mpsc::Receiver<GenerationEvent>) -> Vec<GenerationEvent> {
        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        events
    }

    #[tokio::test]
    async fn fragments_then_done() {
        let usage = Usage {
            prompt_tokens: 5,
            completion_tokens: 3,
            total_tokens: 8,
        };
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(StreamChunk::text("Hel")),
            Ok(StreamChunk::text("")),
            Ok(StreamChunk::text("lo")),
            Ok(StreamChunk::done(Some(usage))),
        ]));
        let gateway = GenerationGateway::new(provider.clone(), "test-model").with_max_tokens(64);

        let events = collect(gateway.stream_reply(
            "system",
            vec![Message::user("hi")],
            CancellationToken::new(),
        ))
        .await;

        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], GenerationEvent::Fragment(t) if t == "Hel"));
        assert!(matches!(&events[1], GenerationEvent::Fragment(t) if t == "lo"));
        assert!(matches!(&events[2], GenerationEvent::Done(Some(u)) if u.total_tokens == 8));

        let request = provider.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(request.system.as_deref(), Some("system"));
        assert_eq!(request.max_tokens, Some(64));
        assert!(request.stream);
    }

    #[tokio::test]
    async fn provider_error_is_single_terminal_event() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(StreamChunk::text("partial")),
            Err(GenerationError::StreamInterrupted("reset".into())),
            Ok(StreamChunk::text("never forwarded")),
        ]));
        let gateway = GenerationGateway::new(provider, "m");

        let events = collect(gateway.stream_reply("s", vec![], CancellationToken::new())).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], GenerationEvent::Failed(GenerationError::StreamInterrupted(_))));
    }

    #[tokio::test]
    async fn stream_closed_without_done_is_a_failure() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(StreamChunk::text("cut"))]));
        let gateway = GenerationGateway::new(provider, "m");

        let events = collect(gateway.stream_reply("s", vec![], CancellationToken::new())).await;
        assert!(matches!(events.last(), Some(GenerationEvent::Failed(_))));
    }

    /// Holds the stream open until released, then reports whether the
    /// rest of the output was consumed.
    struct GatedProvider {
        release: Arc<Notify>,
        finished: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Provider for GatedProvider {
        fn name(&self) -> &str {
            "gated"
        }

        async fn complete(&self, _: ProviderRequest) -> Result<ProviderResponse, GenerationError> {
            Err(GenerationError::NotConfigured("stream only".into()))
        }

        async fn stream(&self, _: ProviderRequest) -> Result<ChunkReceiver, GenerationError> {
            let (tx, rx) = mpsc::channel(1);
            let release = self.release.clone();
            let finished = self.finished.clone();
            tokio::spawn(async move {
                let _ = tx.send(Ok(StreamChunk::text("first"))).await;
                release.notified().await;
                let _ = tx.send(Ok(StreamChunk::text("second"))).await;
                let _ = tx.send(Ok(StreamChunk::done(None))).await;
                finished.store(true, Ordering::SeqCst);
            });
            Ok(rx)
        }
    }

    #[tokio::test]
    async fn cancellation_stops_forwarding_but_provider_finishes() {
        let release = Arc::new(Notify::new());
        let finished = Arc::new(AtomicBool::new(false));
        let gateway = GenerationGateway::new(
            Arc::new(GatedProvider {
                release: release.clone(),
                finished: finished.clone(),
            }),
            "m",
        );

        let cancel = CancellationToken::new();
        let mut rx = gateway.stream_reply("s", vec![], cancel.clone());

        assert!(matches!(rx.recv().await, Some(GenerationEvent::Fragment(t)) if t == "first"));
        cancel.cancel();
        release.notify_one();

        assert!(rx.recv().await.is_none());
        for _ in 0..50 {
            if finished.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn complete_returns_text() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let gateway = GenerationGateway::new(provider, "m");
        let text = gateway
            .complete("greet", vec![Message::user("task")])
            .await
            .unwrap();
        assert_eq!(text, "Hello there");
    }

    #[test]
    fn from_config_prefers_provider_model() {
        let mut config = tandem_config::AppConfig::default();
        config.providers.insert(
            "anthropic".into(),
            tandem_config::ProviderConfig {
                default_model: Some("claude-haiku".into()),
                ..Default::default()
            },
        );
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let gateway = GenerationGateway::from_config(provider, &config);
        assert_eq!(gateway.model(), "claude-haiku");
        assert_eq!(gateway.max_tokens, Some(1024));
    }
}
