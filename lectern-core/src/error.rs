//! Error types for the Lectern core library.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering the gateway, document processing, vector index, memory,
//! cache, rate limiting, ingestion, and agent domains.

/// Top-level error type for the Lectern core library.
#[derive(Debug, thiserror::Error)]
pub enum LecternError {
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Processing error: {0}")]
    Processing(#[from] ProcessingError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Rate limit error: {0}")]
    RateLimit(#[from] RateLimitError),

    #[error("Ingestion error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias used across the crate.
pub type Result<T, E = LecternError> = std::result::Result<T, E>;

/// Errors from model provider interactions through the gateway.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("API request failed: {message}")]
    ApiRequest { message: String },

    #[error("API response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Streaming error: {message}")]
    Streaming { message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Provider connection failed: {message}")]
    Connection { message: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Provider refused the request: {message}")]
    PolicyRejection { message: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Circuit open for {dependency}, retry after {retry_after_secs}s")]
    CircuitOpen {
        dependency: String,
        retry_after_secs: u64,
    },

    #[error("Upstream unavailable: {message}")]
    Unavailable { message: String },

    #[error("Request was cancelled")]
    Cancelled,
}

impl GatewayError {
    /// Whether the error is transient and eligible for retry/fallback.
    ///
    /// Policy rejections and invalid requests never retry and never
    /// advance the fallback chain.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::ApiRequest { .. }
                | GatewayError::Streaming { .. }
                | GatewayError::RateLimited { .. }
                | GatewayError::Timeout { .. }
                | GatewayError::Connection { .. }
        )
    }
}

/// Errors from document extraction and chunking.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("Unsupported content type: {declared}")]
    UnsupportedType { declared: String },

    #[error("Extraction failed: {message}")]
    ExtractionFailed { message: String },

    #[error("No non-trivial text extracted from document")]
    EmptyCorpus,

    #[error("Transcription failed: {0}")]
    Transcription(#[from] GatewayError),
}

/// Errors from the vector index.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Chunk has an empty embedding: {source_name}#{chunk_index}")]
    EmptyEmbedding {
        source_name: String,
        chunk_index: usize,
    },

    #[error("Index backend error: {message}")]
    Backend { message: String },
}

/// Errors from the conversation memory system.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("Context compaction failed: {message}")]
    CompactionFailed { message: String },

    #[error("Message exceeds the context budget even alone ({tokens} > {budget})")]
    OversizedTurn { tokens: usize, budget: usize },
}

/// Errors from the semantic cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache backend error: {message}")]
    Backend { message: String },
}

/// Errors from the rate limiter.
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("Rate limit exceeded for {scope}, retry after {retry_after_secs}s")]
    Exhausted {
        scope: String,
        retry_after_secs: u64,
    },
}

/// Errors from the ingestion coordinator.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Processing failed: {0}")]
    Processing(#[from] ProcessingError),

    #[error("Embedding failed: {0}")]
    Embedding(GatewayError),

    #[error("Index write failed: {0}")]
    Index(#[from] IndexError),
}

/// Errors from the staged query agent.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Stage '{stage}' exceeded its {deadline_ms}ms deadline")]
    StageTimeout { stage: String, deadline_ms: u64 },

    #[error("Upstream failure during {stage}: {source}")]
    Upstream {
        stage: String,
        #[source]
        source: GatewayError,
    },

    #[error("Retrieval failed: {0}")]
    Retrieval(#[from] IndexError),

    #[error("The conversation turn was abandoned by the caller")]
    Abandoned,
}
