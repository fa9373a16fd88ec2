//! Conversation memory: a token-budgeted sliding window with
//! summarization.
//!
//! Each conversation owns an ordered message list plus an optional
//! rolling summary. The invariant after every mutation is that the whole
//! context fits inside `max_context_tokens`. When an append would break
//! it, the oldest messages are condensed through the gateway into the
//! summary; if even that is not enough (one pathological turn), the
//! oldest remaining turn is truncated head-first with an explicit
//! marker.
//!
//! A registry hands out per-conversation memories behind async mutexes
//! so turns within one conversation are serialized, and evicts sessions
//! that have been idle past the configured timeout.

use crate::config::MemoryConfig;
use crate::gateway::ModelGateway;
use crate::tokens::TokenCounter;
use crate::types::{ChatMessage, CompletionRequest, Role};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Marker prepended when a single oversized turn had to be cut.
pub const TRUNCATION_MARKER: &str = "[truncated] ";

const SUMMARIZE_PROMPT: &str = "Condense the following conversation excerpt into a short \
factual summary. Keep names, numbers, and decisions. Reply with the summary only.";

/// Token-budgeted sliding-window memory for one conversation.
pub struct ConversationMemory {
    messages: Vec<ChatMessage>,
    summary: Option<String>,
    max_tokens: usize,
    summarize_threshold: f32,
    counter: Arc<TokenCounter>,
}

impl ConversationMemory {
    pub fn new(counter: Arc<TokenCounter>, config: &MemoryConfig) -> Self {
        Self {
            messages: Vec::new(),
            summary: None,
            max_tokens: config.max_context_tokens.max(64),
            summarize_threshold: config.summarize_threshold.clamp(0.1, 1.0),
            counter,
        }
    }

    /// Append a message, then restore the token invariant, summarizing
    /// evicted history through the gateway.
    ///
    /// Summarizer failures degrade to dropping the oldest messages; a
    /// turn never fails on this path.
    pub async fn append(&mut self, role: Role, content: impl Into<String>, gateway: &ModelGateway) {
        self.messages.push(ChatMessage::new(role, content));
        self.manage_window(gateway).await;
    }

    /// The current context: `[summary?] ++ messages`, chronological.
    pub fn context(&self) -> Vec<ChatMessage> {
        let mut context = Vec::with_capacity(self.messages.len() + 1);
        if let Some(ref summary) = self.summary {
            context.push(ChatMessage::summary(format!(
                "Summary of earlier conversation: {summary}"
            )));
        }
        context.extend(self.messages.iter().cloned());
        context
    }

    /// Tokens used by the full context, including the summary.
    pub fn token_count(&self) -> usize {
        self.counter.count_messages(&self.context())
    }

    /// Drop all messages and the summary.
    pub fn reset(&mut self) {
        self.messages.clear();
        self.summary = None;
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.summary.is_none()
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    async fn manage_window(&mut self, gateway: &ModelGateway) {
        if self.token_count() <= self.max_tokens {
            return;
        }

        // Evict oldest messages until the remainder fits under the
        // summarize threshold, leaving slack for the summary itself.
        let target = (self.max_tokens as f32 * self.summarize_threshold) as usize;
        let mut evicted: Vec<ChatMessage> = Vec::new();
        while self.messages.len() > 1 && self.token_count() > target {
            evicted.push(self.messages.remove(0));
        }

        if !evicted.is_empty() {
            match self.summarize(&evicted, gateway).await {
                Ok(summary) => {
                    debug!(
                        evicted = evicted.len(),
                        summary_chars = summary.len(),
                        "Compacted conversation window"
                    );
                    self.summary = Some(summary);
                }
                Err(message) => {
                    warn!(error = %message, "Summarization failed, dropping oldest messages");
                }
            }
        }

        // Summary may itself be large; shrink it before touching the
        // remaining turns.
        if self.token_count() > self.max_tokens {
            if let Some(summary) = self.summary.take() {
                let budget = self.max_tokens / 4;
                self.summary = Some(self.counter.truncate(&summary, budget));
            }
        }

        // Still over budget (summary grew or summarization was skipped):
        // drop oldest messages outright.
        while self.messages.len() > 1 && self.token_count() > self.max_tokens {
            self.messages.remove(0);
        }

        // Pathological single turn: truncate it head-first with a marker.
        if self.token_count() > self.max_tokens {
            if let Some(first) = self.messages.first_mut() {
                let overhead = 16 + self
                    .summary
                    .as_ref()
                    .map(|s| self.counter.count(s))
                    .unwrap_or(0);
                let budget = self.max_tokens.saturating_sub(overhead).max(16);
                let kept = self.counter.truncate(&first.content, budget);
                first.content = format!("{TRUNCATION_MARKER}{kept}");
            }
        }
    }

    async fn summarize(
        &self,
        evicted: &[ChatMessage],
        gateway: &ModelGateway,
    ) -> Result<String, String> {
        let mut transcript = String::new();
        if let Some(ref prior) = self.summary {
            transcript.push_str("Earlier summary: ");
            transcript.push_str(prior);
            transcript.push_str("\n\n");
        }
        for msg in evicted {
            transcript.push_str(&format!("{}: {}\n", msg.role, msg.content));
        }

        let request = CompletionRequest {
            messages: vec![
                ChatMessage::system(SUMMARIZE_PROMPT),
                ChatMessage::user(transcript),
            ],
            temperature: 0.0,
            max_tokens: Some(self.max_tokens / 8),
        };
        gateway
            .chat(request)
            .await
            .map(|response| response.content.trim().to_string())
            .map_err(|e| e.to_string())
    }
}

struct SessionSlot {
    memory: Arc<Mutex<ConversationMemory>>,
    last_used: Instant,
}

/// Owns per-conversation memories; conversation ids map to locked
/// sessions so concurrent requests on one conversation serialize.
pub struct MemoryRegistry {
    sessions: Mutex<HashMap<String, SessionSlot>>,
    counter: Arc<TokenCounter>,
    config: MemoryConfig,
}

impl MemoryRegistry {
    pub fn new(counter: Arc<TokenCounter>, config: MemoryConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            counter,
            config,
        }
    }

    /// Fetch or create the memory for a conversation. Touching a session
    /// refreshes its idle clock; expired sessions are dropped on the way.
    pub async fn bind(&self, conversation_id: &str) -> Arc<Mutex<ConversationMemory>> {
        let idle_timeout = Duration::from_secs(self.config.idle_timeout_secs.max(1));
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|_, slot| slot.last_used.elapsed() < idle_timeout);

        let slot = sessions
            .entry(conversation_id.to_string())
            .or_insert_with(|| SessionSlot {
                memory: Arc::new(Mutex::new(ConversationMemory::new(
                    self.counter.clone(),
                    &self.config,
                ))),
                last_used: Instant::now(),
            });
        slot.last_used = Instant::now();
        slot.memory.clone()
    }

    /// Number of live (non-evicted) sessions.
    pub async fn session_count(&self) -> usize {
        let idle_timeout = Duration::from_secs(self.config.idle_timeout_secs.max(1));
        let sessions = self.sessions.lock().await;
        sessions
            .values()
            .filter(|slot| slot.last_used.elapsed() < idle_timeout)
            .count()
    }
}
