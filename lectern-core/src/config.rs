//! Configuration system for Lectern.
//!
//! Uses `figment` for layered configuration: defaults -> config file ->
//! environment. Every pipeline tunable is exposed here with its default so
//! deployments can adjust thresholds, deadlines, and limits at runtime.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration for the Lectern backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LecternConfig {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub memory: MemoryConfig,
    pub evaluation: EvaluationConfig,
    pub cache: CacheConfig,
    pub limits: LimitsConfig,
    pub resilience: ResilienceConfig,
    pub agent: AgentConfig,
    pub ingest: IngestConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP server.
    pub bind: String,
    /// Tracing filter directive (e.g. "info", "lectern_core=debug").
    pub log_level: String,
    /// Whether a caller-supplied tenant id is accepted when no verified
    /// identity header is present (anonymous demo scope).
    pub allow_anonymous_tenant: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_string(),
            log_level: "info".to_string(),
            allow_anonymous_tenant: true,
        }
    }
}

/// Model provider configuration for chat, embeddings, and transcription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Base URL of the primary OpenAI-compatible endpoint.
    pub base_url: String,
    /// Environment variable holding the primary API key.
    pub api_key_env: String,
    /// Primary chat model.
    pub chat_model: String,
    /// Optional secondary chat model tried when the primary fails.
    pub fallback_chat_model: Option<String>,
    /// Optional base URL for the fallback provider (defaults to `base_url`).
    pub fallback_base_url: Option<String>,
    /// Environment variable holding the fallback API key (defaults to
    /// `api_key_env`).
    pub fallback_api_key_env: Option<String>,
    /// Embedding model.
    pub embedding_model: String,
    /// Embedding dimensions requested from the provider.
    pub embedding_dimensions: usize,
    /// Speech-to-text model for audio/video ingestion.
    pub transcription_model: String,
    /// Generation temperature.
    pub temperature: f32,
    /// Cap on generated tokens per answer.
    pub max_tokens: usize,
    /// Per-request HTTP timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            chat_model: "gpt-4o-mini".to_string(),
            fallback_chat_model: Some("claude-3-haiku-20240307".to_string()),
            fallback_base_url: None,
            fallback_api_key_env: Some("ANTHROPIC_API_KEY".to_string()),
            embedding_model: "text-embedding-3-large".to_string(),
            embedding_dimensions: 1024,
            transcription_model: "whisper-1".to_string(),
            temperature: 0.3,
            max_tokens: 1024,
            request_timeout_secs: 30,
        }
    }
}

/// Recursive chunker configuration; sizes are measured in tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 800,
            chunk_overlap: 150,
        }
    }
}

/// Retrieval thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Candidates fetched from the index.
    pub k_retrieve: usize,
    /// Chunks kept for the prompt context.
    pub k_context: usize,
    /// Minimum score for a chunk to be kept.
    pub tau_keep: f32,
    /// Below this top score the context is treated as empty.
    pub tau_no_context: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k_retrieve: 8,
            k_context: 4,
            tau_keep: 0.5,
            tau_no_context: 0.35,
        }
    }
}

/// Conversation memory configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Token budget for the whole conversation context.
    pub max_context_tokens: usize,
    /// Fraction of the budget at which summarization kicks in before
    /// messages are dropped outright.
    pub summarize_threshold: f32,
    /// Idle seconds after which a conversation's memory is evicted.
    pub idle_timeout_secs: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 4000,
            summarize_threshold: 0.8,
            idle_timeout_secs: 1800,
        }
    }
}

/// Response evaluation thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Confidence strictly below this escalates the turn for review.
    pub tau_review: f32,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self { tau_review: 0.5 }
    }
}

/// Semantic cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Minimum cosine similarity for a semantic cache hit.
    pub tau_cache: f32,
    /// Minimum confidence for an answer to be cached at all.
    pub tau_cacheable: f32,
    /// Entry time-to-live in seconds.
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            tau_cache: 0.93,
            tau_cacheable: 0.7,
            ttl_secs: 3600,
        }
    }
}

/// Request rate limits and input bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Requests per minute per tenant.
    pub tenant_per_minute: u32,
    /// Requests per minute per source IP.
    pub ip_per_minute: u32,
    /// Maximum accepted question length in characters.
    pub max_message_chars: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            tenant_per_minute: 60,
            ip_per_minute: 120,
            max_message_chars: 4000,
        }
    }
}

/// Circuit breaker and retry configuration shared by all gateway calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Failures within `failure_window_secs` that trip the breaker.
    pub failure_threshold: usize,
    /// Sliding window over which failures are counted, in seconds.
    pub failure_window_secs: u64,
    /// How long an open breaker rejects before admitting a probe.
    pub open_timeout_secs: u64,
    /// Initial retry backoff in milliseconds.
    pub retry_base_ms: u64,
    /// Backoff cap in milliseconds.
    pub retry_cap_ms: u64,
    /// Total attempts per dependency (first try + retries).
    pub retry_max_attempts: u32,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_secs: 60,
            open_timeout_secs: 30,
            retry_base_ms: 500,
            retry_cap_ms: 8000,
            retry_max_attempts: 4,
        }
    }
}

/// Per-stage deadlines and agent behavior switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Retrieval stage deadline in milliseconds.
    pub retrieve_deadline_ms: u64,
    /// Generation stage deadline in milliseconds.
    pub generate_deadline_ms: u64,
    /// Evaluation stage deadline in milliseconds.
    pub evaluate_deadline_ms: u64,
    /// When the retrieval context is empty, answer with the canned
    /// "not in the materials" decline without calling the chat model.
    pub skip_generation_on_empty_context: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            retrieve_deadline_ms: 2000,
            generate_deadline_ms: 20_000,
            evaluate_deadline_ms: 1000,
            skip_generation_on_empty_context: true,
        }
    }
}

/// Ingestion behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Texts per embedding batch.
    pub embed_batch_size: usize,
    /// When the embedding breaker is open, wait one open-timeout for a
    /// probe instead of failing the upload immediately.
    pub block_on_breaker: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            embed_batch_size: 32,
            block_on_breaker: false,
        }
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Environment variables (prefixed with `LECTERN_`, `__` separators)
/// 2. The given TOML file, if present
/// 3. Built-in defaults
pub fn load_config(path: Option<&Path>) -> Result<LecternConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(LecternConfig::default()));

    if let Some(path) = path {
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("LECTERN_").split("__"));

    figment.extract().map_err(Box::new)
}
