//! Core type definitions for the Lectern pipeline.
//!
//! Defines the fundamental data structures used throughout the system:
//! chat messages, completion requests/responses, stream events, document
//! chunks, upload records, and conversation turns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Represents a participant role in a conversation.
///
/// `Summary` marks the synthetic message that replaces older turns after
/// memory compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Summary,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Summary => write!(f, "summary"),
        }
    }
}

/// A single message in a conversation or completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create a summary pseudo-message.
    pub fn summary(content: impl Into<String>) -> Self {
        Self::new(Role::Summary, content)
    }
}

/// Token usage statistics from an LLM call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl TokenUsage {
    pub fn total(&self) -> usize {
        self.input_tokens + self.output_tokens
    }

    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// A request to a chat-completion provider.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: Option<usize>,
}

impl Default for CompletionRequest {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            temperature: 0.3,
            max_tokens: None,
        }
    }
}

/// The result of a chat-completion request.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub usage: TokenUsage,
    pub model: String,
}

/// A stream event received during response streaming.
///
/// A well-formed stream is zero or more `Token` events followed by exactly
/// one `Done` carrying the assembled text and final usage.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Token(String),
    Done { text: String, usage: TokenUsage },
    Error(String),
}

/// The declared content type of an uploaded document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Pdf,
    Text,
    Audio,
    Video,
}

impl ContentType {
    /// Whether this content type requires speech-to-text before chunking.
    pub fn needs_transcription(&self) -> bool {
        matches!(self, ContentType::Audio | ContentType::Video)
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentType::Pdf => write!(f, "pdf"),
            ContentType::Text => write!(f, "text"),
            ContentType::Audio => write!(f, "audio"),
            ContentType::Video => write!(f, "video"),
        }
    }
}

impl FromStr for ContentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pdf" => Ok(ContentType::Pdf),
            "text" | "txt" => Ok(ContentType::Text),
            "audio" => Ok(ContentType::Audio),
            "video" => Ok(ContentType::Video),
            other => Err(format!("unsupported content type '{other}'")),
        }
    }
}

/// Metadata attached to every retrievable chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Originating file name.
    pub source: String,
    /// Human-readable document title shown in citations.
    pub title: String,
    pub content_type: ContentType,
    /// Position of this chunk within the document, 0-based.
    pub chunk_index: usize,
    pub tenant_id: String,
    /// For PDF-derived chunks, the 0-based page the text came from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_index: Option<usize>,
}

/// A chunk produced by the document processor, not yet embedded.
#[derive(Debug, Clone)]
pub struct ChunkDraft {
    pub text: String,
    pub metadata: ChunkMetadata,
}

/// The atomic retrievable unit stored in the vector index.
///
/// Immutable once written; replaced wholesale on re-ingestion of the same
/// `(tenant_id, source, chunk_index)` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub text: String,
    pub embedding: Vec<f32>,
    pub metadata: ChunkMetadata,
}

/// A chunk returned from a similarity search with its score in [0, 1].
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: DocumentChunk,
    pub score: f32,
}

/// A source citation attached to an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub title: String,
    pub score: f32,
    pub chunk_index: usize,
}

/// Lifecycle state of an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadStatus::Pending => write!(f, "pending"),
            UploadStatus::Processing => write!(f, "processing"),
            UploadStatus::Ready => write!(f, "ready"),
            UploadStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Record of one content upload, owned by the ingestion coordinator.
///
/// Invariant: `chunk_count > 0` iff `status == Ready`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRecord {
    pub id: Uuid,
    pub tenant_id: String,
    pub filename: String,
    pub declared_type: ContentType,
    pub byte_size: usize,
    pub status: UploadStatus,
    pub chunk_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl UploadRecord {
    pub fn new(
        tenant_id: impl Into<String>,
        filename: impl Into<String>,
        declared_type: ContentType,
        byte_size: usize,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            filename: filename.into(),
            declared_type,
            byte_size,
            status: UploadStatus::Pending,
            chunk_count: 0,
            reason: None,
            created_at: Utc::now(),
        }
    }
}

/// One completed question/answer exchange, persisted for review.
///
/// Invariant: `should_escalate` implies low confidence, hallucination
/// flags, or an empty retrieval context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub id: Uuid,
    pub tenant_id: String,
    pub user_message: String,
    pub assistant_response: String,
    pub sources: Vec<Citation>,
    pub confidence: f32,
    pub should_escalate: bool,
    pub reviewed: bool,
    pub created_at: DateTime<Utc>,
}

/// The packaged result of one agent run.
#[derive(Debug, Clone)]
pub struct AgentReply {
    pub response: String,
    pub sources: Vec<Citation>,
    pub confidence: f32,
    pub hallucination_flags: Vec<String>,
    pub should_escalate: bool,
    /// Set when the prompt guard refused the query outright; the HTTP
    /// layer maps this to a 422 while still recording the turn.
    pub guard_rejected: bool,
}

impl AgentReply {
    /// Build the persisted turn for this reply.
    pub fn into_turn(self, tenant_id: impl Into<String>, user_message: impl Into<String>) -> ConversationTurn {
        ConversationTurn {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            user_message: user_message.into(),
            assistant_response: self.response,
            sources: self.sources,
            confidence: self.confidence,
            should_escalate: self.should_escalate,
            reviewed: false,
            created_at: Utc::now(),
        }
    }
}

/// An event emitted by the agent while answering.
///
/// Mirrors `StreamEvent` but terminates with the full evaluated reply so
/// the streaming endpoint can emit sources/confidence exactly once.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Token(String),
    Done(AgentReply),
    Error { kind: String, message: String },
}
