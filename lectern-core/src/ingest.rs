//! Ingestion coordinator: raw upload bytes to tenant-scoped vectors.
//!
//! Drives the upload lifecycle (pending -> processing -> ready | failed),
//! embeds chunk texts in batches with failing-batch-only retry, upserts
//! into the tenant's namespace, and bumps the tenant's cache generation
//! once the index write succeeded. Steps are idempotent on
//! `(tenant_id, source, chunk_index)`, so re-running a failed upload is
//! safe.

use crate::cache::SemanticCache;
use crate::config::IngestConfig;
use crate::error::{GatewayError, IngestError};
use crate::gateway::ModelGateway;
use crate::index::VectorIndex;
use crate::persistence::Persistence;
use crate::processor::DocumentProcessor;
use crate::types::{ChunkDraft, ContentType, DocumentChunk, UploadRecord, UploadStatus};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Coordinates extraction, embedding, and index writes for uploads.
pub struct IngestionCoordinator {
    gateway: Arc<ModelGateway>,
    processor: Arc<DocumentProcessor>,
    index: Arc<dyn VectorIndex>,
    cache: Arc<SemanticCache>,
    persistence: Arc<dyn Persistence>,
    config: IngestConfig,
}

impl IngestionCoordinator {
    pub fn new(
        gateway: Arc<ModelGateway>,
        processor: Arc<DocumentProcessor>,
        index: Arc<dyn VectorIndex>,
        cache: Arc<SemanticCache>,
        persistence: Arc<dyn Persistence>,
        config: IngestConfig,
    ) -> Self {
        Self {
            gateway,
            processor,
            index,
            cache,
            persistence,
            config,
        }
    }

    /// Ingest one uploaded document for a tenant.
    ///
    /// Returns the upload record in its terminal state; the error cause
    /// is also recorded on the `failed` record so the caller can surface
    /// either.
    pub async fn ingest(
        &self,
        tenant_id: &str,
        filename: &str,
        declared_type: ContentType,
        title: Option<&str>,
        bytes: Vec<u8>,
    ) -> Result<UploadRecord, (UploadRecord, IngestError)> {
        let title = title.unwrap_or(filename);
        let mut record = UploadRecord::new(tenant_id, filename, declared_type, bytes.len());
        self.persist_insert(&record).await;

        record.status = UploadStatus::Processing;
        self.persist_update(&record).await;
        info!(tenant_id, filename, content_type = %declared_type, "Ingestion started");

        let drafts = match self
            .processor
            .process(&self.gateway, bytes, declared_type, filename, title, tenant_id)
            .await
        {
            Ok(drafts) => drafts,
            Err(e) => {
                return Err(self.fail(record, IngestError::Processing(e)).await);
            }
        };

        let chunks = match self.embed_drafts(drafts).await {
            Ok(chunks) => chunks,
            Err(e) => {
                return Err(self.fail(record, IngestError::Embedding(e)).await);
            }
        };

        let chunk_count = chunks.len();
        if let Err(e) = self.index.upsert(tenant_id, chunks).await {
            return Err(self.fail(record, IngestError::Index(e)).await);
        }

        // Bump after the upsert so stale cache reads during ingestion
        // still return pre-ingestion answers.
        self.cache.bump_generation(tenant_id).await;

        record.status = UploadStatus::Ready;
        record.chunk_count = chunk_count;
        self.persist_update(&record).await;
        info!(tenant_id, filename, chunk_count, "Ingestion complete");
        Ok(record)
    }

    /// Embed chunk texts in batches. Only the failing batch is retried;
    /// completed batches keep their embeddings.
    async fn embed_drafts(&self, drafts: Vec<ChunkDraft>) -> Result<Vec<DocumentChunk>, GatewayError> {
        let batch_size = self.config.embed_batch_size.max(1);
        let mut chunks = Vec::with_capacity(drafts.len());

        for batch in drafts.chunks(batch_size) {
            let texts: Vec<String> = batch.iter().map(|d| d.text.clone()).collect();
            let embeddings = match self.gateway.embed(&texts).await {
                Ok(embeddings) => embeddings,
                Err(GatewayError::CircuitOpen {
                    dependency,
                    retry_after_secs,
                }) if self.config.block_on_breaker => {
                    warn!(
                        dependency,
                        retry_after_secs, "Embedding breaker open, waiting for probe window"
                    );
                    tokio::time::sleep(Duration::from_secs(retry_after_secs.max(1))).await;
                    self.gateway.embed(&texts).await?
                }
                Err(e) => return Err(e),
            };

            if embeddings.len() != batch.len() {
                return Err(GatewayError::ResponseParse {
                    message: format!(
                        "embedding batch size mismatch: sent {}, got {}",
                        batch.len(),
                        embeddings.len()
                    ),
                });
            }
            for (draft, embedding) in batch.iter().zip(embeddings) {
                chunks.push(DocumentChunk {
                    text: draft.text.clone(),
                    embedding,
                    metadata: draft.metadata.clone(),
                });
            }
        }
        Ok(chunks)
    }

    async fn fail(&self, mut record: UploadRecord, error: IngestError) -> (UploadRecord, IngestError) {
        error!(
            tenant_id = %record.tenant_id,
            filename = %record.filename,
            error = %error,
            "Ingestion failed"
        );
        record.status = UploadStatus::Failed;
        record.chunk_count = 0;
        record.reason = Some(error.to_string());
        self.persist_update(&record).await;
        (record, error)
    }

    async fn persist_insert(&self, record: &UploadRecord) {
        if let Err(e) = self.persistence.insert_upload(record.clone()).await {
            warn!(error = %e, "Failed to persist upload record");
        }
    }

    async fn persist_update(&self, record: &UploadRecord) {
        if let Err(e) = self
            .persistence
            .update_upload_status(
                record.id,
                record.status,
                Some(record.chunk_count),
                record.reason.clone(),
            )
            .await
        {
            warn!(error = %e, "Failed to persist upload status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChunkingConfig, ResilienceConfig};
    use crate::gateway::{EmbeddingProvider, HashEmbedder, MockChatProvider, MockTranscriber};
    use crate::index::MemoryVectorIndex;
    use crate::persistence::MemoryPersistence;
    use crate::tokens::TokenCounter;

    fn coordinator(transcript: &str) -> (IngestionCoordinator, Arc<MemoryVectorIndex>, Arc<SemanticCache>, Arc<MemoryPersistence>) {
        let counter = Arc::new(TokenCounter::for_model("gpt-4o-mini"));
        let gateway = Arc::new(ModelGateway::new(
            vec![Arc::new(MockChatProvider::new())],
            Arc::new(HashEmbedder::new(64)),
            Arc::new(MockTranscriber::new(transcript)),
            &ResilienceConfig::default(),
        ));
        let processor = Arc::new(DocumentProcessor::new(
            counter,
            &ChunkingConfig {
                chunk_size: 40,
                chunk_overlap: 5,
            },
        ));
        let index = Arc::new(MemoryVectorIndex::new());
        let cache = Arc::new(SemanticCache::new(0.93, 0.7, Duration::from_secs(3600)));
        let persistence = Arc::new(MemoryPersistence::new());
        let coordinator = IngestionCoordinator::new(
            gateway,
            processor,
            index.clone(),
            cache.clone(),
            persistence.clone(),
            IngestConfig::default(),
        );
        (coordinator, index, cache, persistence)
    }

    #[tokio::test]
    async fn test_ingest_text_reaches_ready() {
        let (coordinator, index, _cache, persistence) = coordinator("");
        let text = "Export via File then Export then PDF. ".repeat(20);
        let record = coordinator
            .ingest("tenant-1", "guide.txt", ContentType::Text, Some("Export Guide"), text.into_bytes())
            .await
            .unwrap();

        assert_eq!(record.status, UploadStatus::Ready);
        assert!(record.chunk_count > 0);
        assert_eq!(index.chunk_count("tenant-1").await, record.chunk_count);

        // The persisted record reflects the same terminal state.
        let stored = persistence.upload(record.id).await.unwrap();
        assert_eq!(stored.status, UploadStatus::Ready);
        assert_eq!(stored.chunk_count, record.chunk_count);
    }

    #[tokio::test]
    async fn test_ready_iff_chunk_count_positive() {
        let (coordinator, _index, _cache, persistence) = coordinator("");
        // Empty corpus: the record must land on failed with zero chunks.
        let result = coordinator
            .ingest("tenant-1", "empty.txt", ContentType::Text, None, b"  \n ".to_vec())
            .await;
        let (record, error) = result.unwrap_err();
        assert_eq!(record.status, UploadStatus::Failed);
        assert_eq!(record.chunk_count, 0);
        assert!(record.reason.is_some());
        assert!(matches!(error, IngestError::Processing(_)));

        let stored = persistence.upload(record.id).await.unwrap();
        assert_eq!(stored.status, UploadStatus::Failed);
    }

    #[tokio::test]
    async fn test_ingested_text_is_retrievable() {
        let (coordinator, index, _cache, _persistence) = coordinator("");
        let text = "Export via File > Export > PDF.";
        coordinator
            .ingest("tenant-1", "module3.txt", ContentType::Text, Some("Module 3"), text.as_bytes().to_vec())
            .await
            .unwrap();

        let embedder = HashEmbedder::new(64);
        let query = embedder
            .embed(&["Export via File > Export > PDF.".to_string()])
            .await
            .unwrap()
            .remove(0);
        let results = index.search("tenant-1", &query, 4, None).await.unwrap();
        assert!(!results.is_empty());
        assert!(results[0].score >= 0.5, "verbatim text should retrieve well");
        assert_eq!(results[0].chunk.metadata.title, "Module 3");
    }

    #[tokio::test]
    async fn test_reingest_same_file_is_idempotent() {
        let (coordinator, index, _cache, _persistence) = coordinator("");
        let text = "Export via File then Export then PDF. ".repeat(20);
        let first = coordinator
            .ingest("t", "guide.txt", ContentType::Text, None, text.clone().into_bytes())
            .await
            .unwrap();
        let count_after_first = index.chunk_count("t").await;
        let second = coordinator
            .ingest("t", "guide.txt", ContentType::Text, None, text.into_bytes())
            .await
            .unwrap();

        assert_eq!(first.chunk_count, second.chunk_count);
        assert_eq!(index.chunk_count("t").await, count_after_first);
    }

    #[tokio::test]
    async fn test_ingest_bumps_cache_generation() {
        let (coordinator, _index, cache, _persistence) = coordinator("");
        cache
            .store("t", "q", vec![1.0, 0.0], "stale answer".into(), vec![], 0.9, false)
            .await;
        assert!(cache.lookup("t", "q", None).await.is_some());

        coordinator
            .ingest("t", "new.txt", ContentType::Text, None, b"Fresh corpus content here.".to_vec())
            .await
            .unwrap();

        assert!(
            cache.lookup("t", "q", None).await.is_none(),
            "pre-ingestion cache entries must be invalidated"
        );
    }

    #[tokio::test]
    async fn test_ingest_video_transcribes_then_indexes() {
        let (coordinator, index, _cache, _persistence) =
            coordinator("Welcome to module three, today we cover exporting to PDF.");
        let record = coordinator
            .ingest("t", "module3.mp4", ContentType::Video, Some("Module 3"), vec![0u8; 64])
            .await
            .unwrap();
        assert_eq!(record.status, UploadStatus::Ready);
        assert!(record.chunk_count > 0);
        assert_eq!(index.chunk_count("t").await, record.chunk_count);
    }
}
