//! Per-tenant vector index.
//!
//! Chunks live in tenant namespaces and are searched by cosine
//! similarity. Embeddings are L2-normalized at the write boundary, so the
//! search score is a plain dot product clamped to [0, 1]. Cross-tenant
//! leakage is treated as a correctness failure: every read and write is
//! keyed by tenant id, and search only ever touches one namespace.

use crate::error::IndexError;
use crate::types::{ContentType, DocumentChunk, ScoredChunk};
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Optional metadata filter for a search.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub content_type: Option<ContentType>,
    pub source: Option<String>,
}

impl SearchFilter {
    fn matches(&self, chunk: &DocumentChunk) -> bool {
        if let Some(ct) = self.content_type {
            if chunk.metadata.content_type != ct {
                return false;
            }
        }
        if let Some(ref source) = self.source {
            if &chunk.metadata.source != source {
                return false;
            }
        }
        true
    }
}

/// Trait for approximate-nearest-neighbor chunk stores.
///
/// Implementations must guarantee tenant isolation and per-chunk atomic
/// upserts keyed by `(tenant_id, source, chunk_index)`.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Write chunks into the tenant's namespace. Duplicate keys replace
    /// the prior value. Returns the number of chunks written.
    async fn upsert(&self, tenant_id: &str, chunks: Vec<DocumentChunk>) -> Result<usize, IndexError>;

    /// Search the tenant's namespace for the `k` most similar chunks,
    /// ordered by descending score; ties break by ascending chunk index
    /// and then source name.
    async fn search(
        &self,
        tenant_id: &str,
        query_embedding: &[f32],
        k: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<ScoredChunk>, IndexError>;

    /// Number of chunks stored for a tenant.
    async fn chunk_count(&self, tenant_id: &str) -> usize;
}

/// L2-normalize a vector in place. Zero vectors are left untouched.
pub fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Cosine similarity of two same-length vectors, assuming both are
/// L2-normalized; clamped to [0, 1].
pub fn cosine_score(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    dot.clamp(0.0, 1.0)
}

type NamespaceKey = (String, usize);

/// In-process vector index backed by per-tenant hash maps.
///
/// Suitable for single-node deployments and tests; a hosted ANN store can
/// implement [`VectorIndex`] without touching callers.
pub struct MemoryVectorIndex {
    namespaces: RwLock<HashMap<String, HashMap<NamespaceKey, DocumentChunk>>>,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self {
            namespaces: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryVectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn upsert(&self, tenant_id: &str, chunks: Vec<DocumentChunk>) -> Result<usize, IndexError> {
        let mut prepared = Vec::with_capacity(chunks.len());
        let mut expected_dim: Option<usize> = None;
        for mut chunk in chunks {
            if chunk.embedding.is_empty() {
                return Err(IndexError::EmptyEmbedding {
                    source_name: chunk.metadata.source,
                    chunk_index: chunk.metadata.chunk_index,
                });
            }
            match expected_dim {
                None => expected_dim = Some(chunk.embedding.len()),
                Some(dim) if dim != chunk.embedding.len() => {
                    return Err(IndexError::DimensionMismatch {
                        expected: dim,
                        got: chunk.embedding.len(),
                    });
                }
                Some(_) => {}
            }
            normalize(&mut chunk.embedding);
            prepared.push(chunk);
        }

        let written = prepared.len();
        let mut namespaces = self.namespaces.write().await;
        let namespace = namespaces.entry(tenant_id.to_string()).or_default();
        if let Some((_, existing)) = namespace.iter().next() {
            let dim = existing.embedding.len();
            if let Some(new_dim) = expected_dim {
                if new_dim != dim {
                    return Err(IndexError::DimensionMismatch {
                        expected: dim,
                        got: new_dim,
                    });
                }
            }
        }
        for chunk in prepared {
            let key = (chunk.metadata.source.clone(), chunk.metadata.chunk_index);
            namespace.insert(key, chunk);
        }
        tracing::debug!(tenant_id, written, "Upserted chunks");
        Ok(written)
    }

    async fn search(
        &self,
        tenant_id: &str,
        query_embedding: &[f32],
        k: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<ScoredChunk>, IndexError> {
        let mut query = query_embedding.to_vec();
        normalize(&mut query);

        let namespaces = self.namespaces.read().await;
        let Some(namespace) = namespaces.get(tenant_id) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<ScoredChunk> = namespace
            .values()
            .filter(|chunk| filter.map(|f| f.matches(chunk)).unwrap_or(true))
            .map(|chunk| ScoredChunk {
                score: cosine_score(&query, &chunk.embedding),
                chunk: chunk.clone(),
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.chunk.metadata.chunk_index.cmp(&b.chunk.metadata.chunk_index))
                .then_with(|| a.chunk.metadata.source.cmp(&b.chunk.metadata.source))
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn chunk_count(&self, tenant_id: &str) -> usize {
        self.namespaces
            .read()
            .await
            .get(tenant_id)
            .map(|ns| ns.len())
            .unwrap_or(0)
    }
}
