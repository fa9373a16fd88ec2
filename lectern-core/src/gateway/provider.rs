//! Model provider traits and OpenAI-compatible implementations.
//!
//! The gateway talks to chat, embedding, and speech-to-text backends
//! through these traits so resilience logic and tests stay independent of
//! any one vendor. The HTTP implementations target the OpenAI-compatible
//! API surface (OpenAI, Azure, vLLM, Ollama, and proxies for other
//! vendors' models).

use crate::error::GatewayError;
use crate::types::{ChatMessage, CompletionRequest, CompletionResponse, Role, StreamEvent, TokenUsage};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Trait for chat-completion providers, buffered and streaming.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Perform a full completion and return the response.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, GatewayError>;

    /// Perform a streaming completion, sending events to the channel.
    /// A closed channel means the consumer went away; implementations
    /// stop reading and return `Cancelled`.
    async fn complete_streaming(
        &self,
        request: CompletionRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), GatewayError>;

    /// Return the model name.
    fn model_name(&self) -> &str;
}

/// Trait for embedding providers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a batch of texts, preserving input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, GatewayError>;

    /// Return the dimensionality of produced embeddings.
    fn dimensions(&self) -> usize;
}

/// Trait for speech-to-text providers.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe an audio or video payload to plain text.
    async fn transcribe(&self, audio: Vec<u8>, filename: &str) -> Result<String, GatewayError>;
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        // Summary pseudo-messages travel as system content.
        Role::Summary => "system",
    }
}

fn messages_to_json(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|msg| {
            json!({
                "role": role_str(msg.role),
                "content": msg.content,
            })
        })
        .collect()
}

/// Map an HTTP error status to the gateway taxonomy.
fn map_http_error(status: reqwest::StatusCode, body: &str, provider: &str) -> GatewayError {
    match status.as_u16() {
        401 | 403 => GatewayError::AuthFailed {
            provider: provider.to_string(),
        },
        429 => {
            // Providers phrase retry-after as "... try again in Xs".
            let retry_secs = body
                .split("in ")
                .last()
                .and_then(|s| s.split(|c: char| !c.is_ascii_digit()).next())
                .and_then(|s| s.parse::<u64>().ok())
                .filter(|s| *s > 0)
                .unwrap_or(5);
            GatewayError::RateLimited {
                retry_after_secs: retry_secs,
            }
        }
        400 if body.contains("content_policy") || body.contains("content_filter") => {
            GatewayError::PolicyRejection {
                message: "provider refused the request".to_string(),
            }
        }
        s if s >= 500 => GatewayError::ApiRequest {
            message: format!("server error ({s})"),
        },
        s => GatewayError::InvalidRequest {
            message: format!("HTTP {s}"),
        },
    }
}

fn map_send_error(err: reqwest::Error, timeout_secs: u64) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout { timeout_secs }
    } else {
        GatewayError::Connection {
            message: err.to_string(),
        }
    }
}

/// OpenAI-compatible chat-completion provider.
pub struct OpenAiChatProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout_secs: u64,
}

impl OpenAiChatProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            timeout_secs: timeout.as_secs(),
        }
    }

    fn request_body(&self, request: &CompletionRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": messages_to_json(&request.messages),
            "temperature": request.temperature,
            "stream": stream,
        });
        if stream {
            body["stream_options"] = json!({ "include_usage": true });
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        body
    }

    /// Parse a single SSE data line. Returns the parsed JSON if valid.
    fn parse_sse_line(line: &str) -> Option<Value> {
        let data = line.strip_prefix("data: ")?;
        if data == "[DONE]" {
            return None;
        }
        serde_json::from_str(data).ok()
    }

    fn parse_usage(value: &Value) -> TokenUsage {
        TokenUsage {
            input_tokens: value
                .get("prompt_tokens")
                .and_then(|t| t.as_u64())
                .unwrap_or(0) as usize,
            output_tokens: value
                .get("completion_tokens")
                .and_then(|t| t.as_u64())
                .unwrap_or(0) as usize,
        }
    }
}

#[async_trait]
impl ChatProvider for OpenAiChatProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, GatewayError> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(url = %url, model = %self.model, "Sending completion request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(&request, false))
            .send()
            .await
            .map_err(|e| map_send_error(e, self.timeout_secs))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::Connection {
                message: format!("failed to read response body: {e}"),
            })?;

        if !status.is_success() {
            return Err(map_http_error(status, &body, &self.model));
        }

        let value: Value = serde_json::from_str(&body).map_err(|e| GatewayError::ResponseParse {
            message: format!("invalid JSON: {e}"),
        })?;

        let finish_reason = value["choices"][0]["finish_reason"].as_str().unwrap_or("");
        if finish_reason == "content_filter" {
            return Err(GatewayError::PolicyRejection {
                message: "provider filtered the response".to_string(),
            });
        }

        let content = value["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| GatewayError::ResponseParse {
                message: "response missing message content".to_string(),
            })?
            .to_string();

        let usage = value
            .get("usage")
            .map(Self::parse_usage)
            .unwrap_or_default();
        let model = value["model"].as_str().unwrap_or(&self.model).to_string();

        Ok(CompletionResponse {
            content,
            usage,
            model,
        })
    }

    async fn complete_streaming(
        &self,
        request: CompletionRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), GatewayError> {
        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(&request, true))
            .send()
            .await
            .map_err(|e| map_send_error(e, self.timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_http_error(status, &body, &self.model));
        }

        let mut usage = TokenUsage::default();
        let mut assembled = String::new();
        let mut buffer = String::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| GatewayError::Streaming {
                message: format!("stream read failed: {e}"),
            })?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_string();
                buffer.drain(..=pos);
                if line.is_empty() || line.starts_with(':') {
                    continue;
                }
                if line == "data: [DONE]" {
                    let _ = tx
                        .send(StreamEvent::Done {
                            text: assembled.clone(),
                            usage,
                        })
                        .await;
                    return Ok(());
                }
                let Some(data) = Self::parse_sse_line(&line) else {
                    continue;
                };
                if let Some(u) = data.get("usage") {
                    if !u.is_null() {
                        usage = Self::parse_usage(u);
                    }
                }
                if let Some(token) = data["choices"][0]["delta"]["content"].as_str() {
                    if !token.is_empty() {
                        assembled.push_str(token);
                        // A dropped receiver cancels the upstream stream:
                        // returning drops the response future.
                        if tx.send(StreamEvent::Token(token.to_string())).await.is_err() {
                            return Err(GatewayError::Cancelled);
                        }
                    }
                }
            }
        }

        // Provider closed the stream without a [DONE] sentinel.
        let _ = tx
            .send(StreamEvent::Done {
                text: assembled,
                usage,
            })
            .await;
        Ok(())
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// OpenAI-compatible embedding provider.
pub struct OpenAiEmbeddingProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    dimensions: usize,
    timeout_secs: u64,
}

impl OpenAiEmbeddingProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        dimensions: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            dimensions,
            timeout_secs: timeout.as_secs(),
        }
    }

    /// Parse the embedding response, re-sorting by the provider's index
    /// field so output order always matches input order.
    fn parse_embeddings(value: Value) -> Result<Vec<Vec<f32>>, GatewayError> {
        let data = value
            .get("data")
            .and_then(|v| v.as_array())
            .ok_or_else(|| GatewayError::ResponseParse {
                message: "embedding response missing data array".to_string(),
            })?;

        let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
        for (fallback_index, item) in data.iter().enumerate() {
            let index = item
                .get("index")
                .and_then(|v| v.as_u64())
                .map(|v| v as usize)
                .unwrap_or(fallback_index);
            let embedding = item
                .get("embedding")
                .and_then(|v| v.as_array())
                .ok_or_else(|| GatewayError::ResponseParse {
                    message: "embedding item missing embedding array".to_string(),
                })?;
            let mut vector = Vec::with_capacity(embedding.len());
            for value in embedding {
                let number = value.as_f64().ok_or_else(|| GatewayError::ResponseParse {
                    message: "embedding value must be numeric".to_string(),
                })?;
                vector.push(number as f32);
            }
            indexed.push((index, vector));
        }
        indexed.sort_by_key(|(index, _)| *index);
        Ok(indexed.into_iter().map(|(_, v)| v).collect())
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, GatewayError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/embeddings", self.base_url);
        let body = json!({
            "model": self.model,
            "input": texts,
            "dimensions": self.dimensions,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_send_error(e, self.timeout_secs))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::Connection {
                message: format!("failed to read response body: {e}"),
            })?;
        if !status.is_success() {
            return Err(map_http_error(status, &body, &self.model));
        }

        let value: Value = serde_json::from_str(&body).map_err(|e| GatewayError::ResponseParse {
            message: format!("invalid JSON: {e}"),
        })?;
        Self::parse_embeddings(value)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Whisper-style speech-to-text provider.
pub struct OpenAiTranscriber {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout_secs: u64,
}

impl OpenAiTranscriber {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            timeout_secs: timeout.as_secs(),
        }
    }
}

#[async_trait]
impl Transcriber for OpenAiTranscriber {
    async fn transcribe(&self, audio: Vec<u8>, filename: &str) -> Result<String, GatewayError> {
        let url = format!("{}/audio/transcriptions", self.base_url);
        let part = reqwest::multipart::Part::bytes(audio)
            .file_name(filename.to_string())
            .mime_str("application/octet-stream")
            .map_err(|e| GatewayError::InvalidRequest {
                message: format!("invalid multipart payload: {e}"),
            })?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("response_format", "text");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| map_send_error(e, self.timeout_secs))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::Connection {
                message: format!("failed to read response body: {e}"),
            })?;
        if !status.is_success() {
            return Err(map_http_error(status, &body, &self.model));
        }
        Ok(body)
    }
}

/// Deterministic hashed term-frequency embedder.
///
/// Always available without network access; used for tests and the
/// anonymous demo scope. L2-normalized output so cosine behaves like the
/// hosted models.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn hash_term(term: &str) -> usize {
        let mut hash: usize = 5381;
        for b in term.bytes() {
            hash = hash.wrapping_mul(33).wrapping_add(b as usize);
        }
        hash
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        let lowered = text.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        if words.is_empty() {
            return vector;
        }

        let mut tf: HashMap<&str, usize> = HashMap::new();
        for word in &words {
            *tf.entry(word).or_insert(0) += 1;
        }
        for (term, count) in &tf {
            let idx = Self::hash_term(term) % self.dimensions;
            vector[idx] += *count as f32;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, GatewayError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// A mock chat provider for tests: queue responses or scripted failures.
pub struct MockChatProvider {
    model: String,
    responses: std::sync::Mutex<Vec<Result<CompletionResponse, GatewayError>>>,
}

impl MockChatProvider {
    pub fn new() -> Self {
        Self {
            model: "mock-model".to_string(),
            responses: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn named(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            responses: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Queue a successful text response.
    pub fn queue_text(&self, text: &str) {
        self.responses
            .lock()
            .unwrap()
            .push(Ok(Self::text_response(text)));
    }

    /// Queue a failure for the next call.
    pub fn queue_error(&self, error: GatewayError) {
        self.responses.lock().unwrap().push(Err(error));
    }

    pub fn text_response(text: &str) -> CompletionResponse {
        CompletionResponse {
            content: text.to_string(),
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
            },
            model: "mock-model".to_string(),
        }
    }
}

impl Default for MockChatProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatProvider for MockChatProvider {
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, GatewayError> {
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(Self::text_response("mock reply"))
        } else {
            responses.remove(0)
        }
    }

    async fn complete_streaming(
        &self,
        request: CompletionRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), GatewayError> {
        let response = self.complete(request).await?;
        for word in response.content.split_inclusive(' ') {
            if tx.send(StreamEvent::Token(word.to_string())).await.is_err() {
                return Err(GatewayError::Cancelled);
            }
        }
        let _ = tx
            .send(StreamEvent::Done {
                text: response.content,
                usage: response.usage,
            })
            .await;
        Ok(())
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// A mock transcriber returning a fixed transcript.
pub struct MockTranscriber {
    pub transcript: String,
}

impl MockTranscriber {
    pub fn new(transcript: impl Into<String>) -> Self {
        Self {
            transcript: transcript.into(),
        }
    }
}

#[async_trait]
impl Transcriber for MockTranscriber {
    async fn transcribe(&self, _audio: Vec<u8>, _filename: &str) -> Result<String, GatewayError> {
        Ok(self.transcript.clone())
    }
}
