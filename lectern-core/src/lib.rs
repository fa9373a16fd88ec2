//! # Lectern Core
//!
//! Core library for the Lectern creator-support backend: the ingestion
//! path that turns uploads into per-tenant vector indices, and the query
//! path — a staged agent that retrieves, generates, evaluates, and
//! optionally streams a grounded answer — plus the production machinery
//! both need: prompt-injection screening, token-budgeted conversation
//! memory, response evaluation, a semantic cache, rate limiting, and
//! circuit-broken gateway calls to model providers.

pub mod agent;
pub mod cache;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod gateway;
pub mod guard;
pub mod index;
pub mod ingest;
pub mod memory;
pub mod persistence;
pub mod processor;
pub mod ratelimit;
pub mod tokens;
pub mod types;

// Re-export commonly used types at the crate root.
pub use agent::{AgentStage, RagAgent};
pub use cache::SemanticCache;
pub use config::{load_config, LecternConfig};
pub use error::{LecternError, Result};
pub use evaluator::{ConfidenceLevel, Evaluation, ResponseEvaluator};
pub use gateway::{GatewayHealth, ModelGateway};
pub use guard::{GuardVerdict, PromptGuard, ThreatLevel};
pub use index::{MemoryVectorIndex, SearchFilter, VectorIndex};
pub use ingest::IngestionCoordinator;
pub use memory::{ConversationMemory, MemoryRegistry};
pub use persistence::{MemoryPersistence, Persistence, PersistenceError};
pub use processor::DocumentProcessor;
pub use ratelimit::RateLimiter;
pub use tokens::TokenCounter;
pub use types::{
    AgentEvent, AgentReply, ChatMessage, ChunkDraft, ChunkMetadata, Citation, CompletionRequest,
    CompletionResponse, ContentType, ConversationTurn, DocumentChunk, Role, ScoredChunk,
    StreamEvent, TokenUsage, UploadRecord, UploadStatus,
};
