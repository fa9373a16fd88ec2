//! Model gateway: one call surface for chat, embeddings, and speech-to-
//! text, with per-dependency circuit breakers, retry, and a chat fallback
//! chain.
//!
//! Resilience layering per call: the breaker decides whether the
//! dependency may be tried at all, the retry policy absorbs transient
//! blips inside one dependency, and the fallback chain switches chat
//! traffic to a secondary model when the primary stays down. Policy
//! rejections and invalid requests short-circuit all three layers.

pub mod breaker;
pub mod provider;
pub mod retry;

pub use breaker::{CircuitBreaker, CircuitState, CircuitStateLabel};
pub use provider::{
    ChatProvider, EmbeddingProvider, HashEmbedder, MockChatProvider, MockTranscriber,
    OpenAiChatProvider, OpenAiEmbeddingProvider, OpenAiTranscriber, Transcriber,
};
pub use retry::{with_retry, RetryPolicy};

use crate::config::{ModelConfig, ResilienceConfig};
use crate::error::GatewayError;
use crate::types::{CompletionRequest, CompletionResponse, StreamEvent};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Health snapshot of one circuit-broken dependency.
#[derive(Debug, Clone, Serialize)]
pub struct DependencyHealth {
    pub name: String,
    pub state: CircuitStateLabel,
}

/// Health snapshot of the whole gateway.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayHealth {
    pub chat: Vec<DependencyHealth>,
    pub embeddings: DependencyHealth,
    pub transcription: DependencyHealth,
}

impl GatewayHealth {
    /// The gateway is degraded when every chat dependency is open.
    pub fn chat_available(&self) -> bool {
        self.chat
            .iter()
            .any(|d| d.state != CircuitStateLabel::Open)
    }
}

struct ChatEntry {
    provider: Arc<dyn ChatProvider>,
    breaker: Mutex<CircuitBreaker>,
}

/// Uniform call surface to model providers with resilience built in.
pub struct ModelGateway {
    chat_chain: Vec<ChatEntry>,
    embedder: Arc<dyn EmbeddingProvider>,
    embed_breaker: Mutex<CircuitBreaker>,
    transcriber: Arc<dyn Transcriber>,
    transcribe_breaker: Mutex<CircuitBreaker>,
    retry: RetryPolicy,
}

impl ModelGateway {
    /// Assemble a gateway from explicit providers. The first chat
    /// provider is the primary; the rest form the fallback chain.
    pub fn new(
        chat_providers: Vec<Arc<dyn ChatProvider>>,
        embedder: Arc<dyn EmbeddingProvider>,
        transcriber: Arc<dyn Transcriber>,
        resilience: &ResilienceConfig,
    ) -> Self {
        let make_breaker = |name: String| {
            CircuitBreaker::new(
                name,
                resilience.failure_threshold,
                Duration::from_secs(resilience.failure_window_secs),
                Duration::from_secs(resilience.open_timeout_secs),
            )
        };
        let chat_chain = chat_providers
            .into_iter()
            .map(|provider| {
                let name = format!("chat:{}", provider.model_name());
                ChatEntry {
                    provider,
                    breaker: Mutex::new(make_breaker(name)),
                }
            })
            .collect();

        Self {
            chat_chain,
            embedder,
            embed_breaker: Mutex::new(make_breaker("embeddings".to_string())),
            transcriber,
            transcribe_breaker: Mutex::new(make_breaker("transcription".to_string())),
            retry: RetryPolicy {
                max_attempts: resilience.retry_max_attempts,
                base: Duration::from_millis(resilience.retry_base_ms),
                cap: Duration::from_millis(resilience.retry_cap_ms),
                jitter: true,
            },
        }
    }

    /// Build the production gateway from configuration, resolving API
    /// keys from the environment.
    pub fn from_config(
        model: &ModelConfig,
        resilience: &ResilienceConfig,
    ) -> Result<Self, GatewayError> {
        let api_key = std::env::var(&model.api_key_env).map_err(|_| GatewayError::AuthFailed {
            provider: format!("env var '{}' not set", model.api_key_env),
        })?;
        let timeout = Duration::from_secs(model.request_timeout_secs);

        let mut chat_providers: Vec<Arc<dyn ChatProvider>> = vec![Arc::new(
            OpenAiChatProvider::new(&model.base_url, &api_key, &model.chat_model, timeout),
        )];
        if let Some(ref fallback_model) = model.fallback_chat_model {
            let fallback_url = model
                .fallback_base_url
                .clone()
                .unwrap_or_else(|| model.base_url.clone());
            let fallback_key = model
                .fallback_api_key_env
                .as_ref()
                .and_then(|env| std::env::var(env).ok())
                .unwrap_or_else(|| api_key.clone());
            chat_providers.push(Arc::new(OpenAiChatProvider::new(
                fallback_url,
                fallback_key,
                fallback_model,
                timeout,
            )));
        }

        let embedder = Arc::new(OpenAiEmbeddingProvider::new(
            &model.base_url,
            &api_key,
            &model.embedding_model,
            model.embedding_dimensions,
            timeout,
        ));
        let transcriber = Arc::new(OpenAiTranscriber::new(
            &model.base_url,
            &api_key,
            &model.transcription_model,
            timeout,
        ));

        Ok(Self::new(chat_providers, embedder, transcriber, resilience))
    }

    /// Buffered chat completion through the fallback chain.
    pub async fn chat(&self, request: CompletionRequest) -> Result<CompletionResponse, GatewayError> {
        let mut last_error: Option<GatewayError> = None;
        let mut min_retry_after = u64::MAX;

        for entry in &self.chat_chain {
            {
                let mut breaker = entry.breaker.lock().await;
                if !breaker.is_call_permitted() {
                    debug!(dependency = breaker.name(), "Skipping chat provider, circuit open");
                    min_retry_after = min_retry_after.min(breaker.retry_after_secs());
                    continue;
                }
            }

            let result = with_retry(&self.retry, || entry.provider.complete(request.clone())).await;
            match result {
                Ok(response) => {
                    entry.breaker.lock().await.record_success();
                    return Ok(response);
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        model = entry.provider.model_name(),
                        error = %e,
                        "Chat provider failed, advancing fallback chain"
                    );
                    entry.breaker.lock().await.record_failure();
                    last_error = Some(e);
                }
                Err(e) => {
                    // Policy rejections, auth, and invalid requests never
                    // advance the chain.
                    return Err(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(GatewayError::Unavailable {
                message: format!("all chat providers failed: {e}"),
            }),
            None => Err(GatewayError::CircuitOpen {
                dependency: "chat".to_string(),
                retry_after_secs: if min_retry_after == u64::MAX {
                    0
                } else {
                    min_retry_after
                },
            }),
        }
    }

    /// Streaming chat completion. Tokens are forwarded as they arrive;
    /// the fallback chain only advances while nothing has been emitted
    /// yet, so consumers never see a restarted answer.
    pub async fn chat_stream(
        &self,
        request: CompletionRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), GatewayError> {
        let mut last_error: Option<GatewayError> = None;
        let mut min_retry_after = u64::MAX;

        for entry in &self.chat_chain {
            {
                let mut breaker = entry.breaker.lock().await;
                if !breaker.is_call_permitted() {
                    min_retry_after = min_retry_after.min(breaker.retry_after_secs());
                    continue;
                }
            }

            let (itx, mut irx) = mpsc::channel::<StreamEvent>(64);
            let emitted = Arc::new(AtomicBool::new(false));
            let emitted_flag = emitted.clone();
            let out = tx.clone();
            let forward = tokio::spawn(async move {
                while let Some(event) = irx.recv().await {
                    if matches!(event, StreamEvent::Token(_)) {
                        emitted_flag.store(true, Ordering::SeqCst);
                    }
                    if out.send(event).await.is_err() {
                        break;
                    }
                }
            });

            let result = entry.provider.complete_streaming(request.clone(), itx).await;
            let _ = forward.await;

            match result {
                Ok(()) => {
                    entry.breaker.lock().await.record_success();
                    return Ok(());
                }
                Err(GatewayError::Cancelled) => {
                    return Err(GatewayError::Cancelled);
                }
                Err(e) if e.is_transient() && !emitted.load(Ordering::SeqCst) => {
                    warn!(
                        model = entry.provider.model_name(),
                        error = %e,
                        "Streaming provider failed before first token, trying fallback"
                    );
                    entry.breaker.lock().await.record_failure();
                    last_error = Some(e);
                }
                Err(e) => {
                    if e.is_transient() {
                        entry.breaker.lock().await.record_failure();
                    }
                    return Err(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(GatewayError::Unavailable {
                message: format!("all chat providers failed: {e}"),
            }),
            None => Err(GatewayError::CircuitOpen {
                dependency: "chat".to_string(),
                retry_after_secs: if min_retry_after == u64::MAX {
                    0
                } else {
                    min_retry_after
                },
            }),
        }
    }

    /// Embed a batch of texts.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, GatewayError> {
        {
            let mut breaker = self.embed_breaker.lock().await;
            if !breaker.is_call_permitted() {
                return Err(GatewayError::CircuitOpen {
                    dependency: "embeddings".to_string(),
                    retry_after_secs: breaker.retry_after_secs(),
                });
            }
        }
        let result = with_retry(&self.retry, || self.embedder.embed(texts)).await;
        let mut breaker = self.embed_breaker.lock().await;
        match result {
            Ok(vectors) => {
                breaker.record_success();
                Ok(vectors)
            }
            Err(e) => {
                if e.is_transient() {
                    breaker.record_failure();
                }
                Err(e)
            }
        }
    }

    /// Embed a single query text.
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>, GatewayError> {
        let texts = [text.to_string()];
        let mut vectors = self.embed(&texts).await?;
        vectors.pop().ok_or_else(|| GatewayError::ResponseParse {
            message: "embedding response was empty".to_string(),
        })
    }

    /// Transcribe audio/video bytes to text.
    pub async fn transcribe(&self, audio: Vec<u8>, filename: &str) -> Result<String, GatewayError> {
        {
            let mut breaker = self.transcribe_breaker.lock().await;
            if !breaker.is_call_permitted() {
                return Err(GatewayError::CircuitOpen {
                    dependency: "transcription".to_string(),
                    retry_after_secs: breaker.retry_after_secs(),
                });
            }
        }
        let result = with_retry(&self.retry, || {
            self.transcriber.transcribe(audio.clone(), filename)
        })
        .await;
        let mut breaker = self.transcribe_breaker.lock().await;
        match result {
            Ok(text) => {
                breaker.record_success();
                Ok(text)
            }
            Err(e) => {
                if e.is_transient() {
                    breaker.record_failure();
                }
                Err(e)
            }
        }
    }

    /// Dimensionality of the configured embedding model.
    pub fn embedding_dimensions(&self) -> usize {
        self.embedder.dimensions()
    }

    /// Current breaker states for health reporting.
    pub async fn health(&self) -> GatewayHealth {
        let mut chat = Vec::with_capacity(self.chat_chain.len());
        for entry in &self.chat_chain {
            let breaker = entry.breaker.lock().await;
            chat.push(DependencyHealth {
                name: breaker.name().to_string(),
                state: breaker.label(),
            });
        }
        let embeddings = {
            let breaker = self.embed_breaker.lock().await;
            DependencyHealth {
                name: breaker.name().to_string(),
                state: breaker.label(),
            }
        };
        let transcription = {
            let breaker = self.transcribe_breaker.lock().await;
            DependencyHealth {
                name: breaker.name().to_string(),
                state: breaker.label(),
            }
        };
        GatewayHealth {
            chat,
            embeddings,
            transcription,
        }
    }
}
