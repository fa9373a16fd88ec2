//! Persistence port for conversations and upload records.
//!
//! The core only needs a narrow CRUD surface; deployments back it with a
//! real database, and tests (or single-node demo mode) use the in-memory
//! implementation. Failures on this port are logged by callers and never
//! surface on the user-visible path.

use crate::types::{ConversationTurn, UploadRecord, UploadStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Error from the persistence backend.
#[derive(Debug, thiserror::Error)]
#[error("persistence failed: {message}")]
pub struct PersistenceError {
    pub message: String,
}

impl PersistenceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Narrow persistence contract consumed by the core.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn insert_turn(&self, turn: ConversationTurn) -> Result<(), PersistenceError>;

    /// Turns for a tenant, newest first, up to `limit`.
    async fn list_turns(
        &self,
        tenant_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, PersistenceError>;

    async fn insert_upload(&self, record: UploadRecord) -> Result<(), PersistenceError>;

    async fn update_upload_status(
        &self,
        id: Uuid,
        status: UploadStatus,
        chunk_count: Option<usize>,
        reason: Option<String>,
    ) -> Result<(), PersistenceError>;

    /// Whether the backend is reachable, for health reporting.
    async fn is_healthy(&self) -> bool;
}

/// In-memory persistence for tests and single-node deployments.
#[derive(Default)]
pub struct MemoryPersistence {
    turns: Mutex<Vec<ConversationTurn>>,
    uploads: Mutex<HashMap<Uuid, UploadRecord>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch one upload record by id.
    pub async fn upload(&self, id: Uuid) -> Option<UploadRecord> {
        self.uploads.lock().await.get(&id).cloned()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn insert_turn(&self, turn: ConversationTurn) -> Result<(), PersistenceError> {
        self.turns.lock().await.push(turn);
        Ok(())
    }

    async fn list_turns(
        &self,
        tenant_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, PersistenceError> {
        let turns = self.turns.lock().await;
        let mut result: Vec<ConversationTurn> = turns
            .iter()
            .filter(|t| t.tenant_id == tenant_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        result.truncate(limit);
        Ok(result)
    }

    async fn insert_upload(&self, record: UploadRecord) -> Result<(), PersistenceError> {
        self.uploads.lock().await.insert(record.id, record);
        Ok(())
    }

    async fn update_upload_status(
        &self,
        id: Uuid,
        status: UploadStatus,
        chunk_count: Option<usize>,
        reason: Option<String>,
    ) -> Result<(), PersistenceError> {
        let mut uploads = self.uploads.lock().await;
        let record = uploads
            .get_mut(&id)
            .ok_or_else(|| PersistenceError::new(format!("unknown upload {id}")))?;
        record.status = status;
        if let Some(count) = chunk_count {
            record.chunk_count = count;
        }
        record.reason = reason;
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        true
    }
}
