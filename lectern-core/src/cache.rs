//! Semantic response cache.
//!
//! Two-tier lookup per tenant: an exact tier keyed by a hash of the
//! normalized query, and a semantic tier that compares query embeddings
//! by cosine similarity against `tau_cache`. Entries expire after a TTL
//! and are invalidated wholesale by a per-tenant generation counter that
//! ingestion bumps after every successful index write.

use crate::index::{cosine_score, normalize};
use crate::types::Citation;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// A cached answer snapshot.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub query: String,
    embedding: Vec<f32>,
    pub response: String,
    pub sources: Vec<Citation>,
    pub confidence: f32,
    generation: u64,
    created_at: Instant,
    pub hit_count: u64,
}

#[derive(Default)]
struct TenantCache {
    generation: u64,
    entries: HashMap<String, CacheEntry>,
}

/// Per-tenant semantic cache with TTL and generation-based invalidation.
pub struct SemanticCache {
    tenants: Mutex<HashMap<String, TenantCache>>,
    tau_cache: f32,
    tau_cacheable: f32,
    ttl: Duration,
}

impl SemanticCache {
    pub fn new(tau_cache: f32, tau_cacheable: f32, ttl: Duration) -> Self {
        Self {
            tenants: Mutex::new(HashMap::new()),
            tau_cache,
            tau_cacheable,
            ttl,
        }
    }

    /// Deterministic key for the exact tier: SHA-256 of the lowercased,
    /// trimmed query, truncated to 16 hex chars.
    fn hash_query(query: &str) -> String {
        let normalized = query.trim().to_lowercase();
        let digest = Sha256::digest(normalized.as_bytes());
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        hex[..16].to_string()
    }

    /// Look up a cached answer for a semantically similar query.
    ///
    /// Tries the exact tier first, then scans the semantic tier for the
    /// best embedding match at or above `tau_cache`. Expired entries and
    /// entries from a stale corpus generation are pruned on the way.
    pub async fn lookup(
        &self,
        tenant_id: &str,
        query: &str,
        query_embedding: Option<&[f32]>,
    ) -> Option<CacheEntry> {
        let mut tenants = self.tenants.lock().await;
        let tenant = tenants.get_mut(tenant_id)?;
        let generation = tenant.generation;
        let ttl = self.ttl;
        tenant
            .entries
            .retain(|_, e| e.generation == generation && e.created_at.elapsed() < ttl);

        let key = Self::hash_query(query);
        if let Some(entry) = tenant.entries.get_mut(&key) {
            entry.hit_count += 1;
            tracing::debug!(tenant_id, tier = "exact", "Semantic cache hit");
            return Some(entry.clone());
        }

        let query_embedding = query_embedding?;
        let mut normalized = query_embedding.to_vec();
        normalize(&mut normalized);

        let mut best: Option<(String, f32)> = None;
        for (key, entry) in tenant.entries.iter() {
            let score = cosine_score(&normalized, &entry.embedding);
            if score >= self.tau_cache && best.as_ref().map(|(_, s)| score > *s).unwrap_or(true) {
                best = Some((key.clone(), score));
            }
        }

        let (key, score) = best?;
        let entry = tenant.entries.get_mut(&key)?;
        entry.hit_count += 1;
        tracing::debug!(tenant_id, tier = "semantic", score, "Semantic cache hit");
        Some(entry.clone())
    }

    /// Store an answer if it clears the cacheability bar.
    ///
    /// Low-confidence and escalated answers are never cached.
    pub async fn store(
        &self,
        tenant_id: &str,
        query: &str,
        query_embedding: Vec<f32>,
        response: String,
        sources: Vec<Citation>,
        confidence: f32,
        should_escalate: bool,
    ) -> bool {
        if should_escalate || confidence < self.tau_cacheable {
            return false;
        }

        let mut embedding = query_embedding;
        normalize(&mut embedding);

        let mut tenants = self.tenants.lock().await;
        let tenant = tenants.entry(tenant_id.to_string()).or_default();
        let key = Self::hash_query(query);
        tenant.entries.insert(
            key,
            CacheEntry {
                query: query.to_string(),
                embedding,
                response,
                sources,
                confidence,
                generation: tenant.generation,
                created_at: Instant::now(),
                hit_count: 0,
            },
        );
        true
    }

    /// Invalidate a tenant's entries after its corpus changed.
    ///
    /// Existing entries carry the old generation and are ignored (and
    /// pruned) by subsequent lookups; monotonic visibility means a stale
    /// read during ingestion still returns a pre-ingestion answer.
    pub async fn bump_generation(&self, tenant_id: &str) {
        let mut tenants = self.tenants.lock().await;
        let tenant = tenants.entry(tenant_id.to_string()).or_default();
        tenant.generation += 1;
        tracing::debug!(tenant_id, generation = tenant.generation, "Cache generation bumped");
    }

    /// Live (unexpired, current-generation) entry count for a tenant.
    pub async fn entry_count(&self, tenant_id: &str) -> usize {
        let tenants = self.tenants.lock().await;
        tenants
            .get(tenant_id)
            .map(|t| {
                t.entries
                    .values()
                    .filter(|e| e.generation == t.generation && e.created_at.elapsed() < self.ttl)
                    .count()
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> SemanticCache {
        SemanticCache::new(0.93, 0.7, Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_exact_hit_without_embedding() {
        let cache = cache();
        cache
            .store("t", "How to export?", vec![1.0, 0.0], "Use File > Export".into(), vec![], 0.8, false)
            .await;

        let hit = cache.lookup("t", "  how to EXPORT?  ", None).await;
        assert!(hit.is_some());
        assert_eq!(hit.unwrap().response, "Use File > Export");
    }

    #[tokio::test]
    async fn test_semantic_hit_above_threshold() {
        let cache = cache();
        cache
            .store("t", "How to export?", vec![1.0, 0.0], "answer".into(), vec![], 0.8, false)
            .await;

        // Nearly identical direction: cosine well above 0.93.
        let hit = cache.lookup("t", "How do I save as PDF?", Some(&[0.999, 0.01])).await;
        assert!(hit.is_some());

        // Orthogonal embedding: no hit.
        let miss = cache.lookup("t", "Unrelated", Some(&[0.0, 1.0])).await;
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn test_low_confidence_not_stored() {
        let cache = cache();
        let stored = cache
            .store("t", "q", vec![1.0], "weak answer".into(), vec![], 0.4, false)
            .await;
        assert!(!stored);
        assert!(cache.lookup("t", "q", None).await.is_none());
    }

    #[tokio::test]
    async fn test_escalated_not_stored() {
        let cache = cache();
        let stored = cache
            .store("t", "q", vec![1.0], "escalated".into(), vec![], 0.9, true)
            .await;
        assert!(!stored);
    }

    #[tokio::test]
    async fn test_generation_invalidates() {
        let cache = cache();
        cache
            .store("t", "q", vec![1.0, 0.0], "old corpus answer".into(), vec![], 0.9, false)
            .await;
        assert!(cache.lookup("t", "q", None).await.is_some());

        cache.bump_generation("t").await;
        assert!(cache.lookup("t", "q", None).await.is_none());
        assert_eq!(cache.entry_count("t").await, 0);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let cache = SemanticCache::new(0.93, 0.7, Duration::from_millis(20));
        cache
            .store("t", "q", vec![1.0], "short lived".into(), vec![], 0.9, false)
            .await;
        assert!(cache.lookup("t", "q", None).await.is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.lookup("t", "q", None).await.is_none());
    }

    #[tokio::test]
    async fn test_tenant_scoping() {
        let cache = cache();
        cache
            .store("tenant-a", "q", vec![1.0, 0.0], "a's answer".into(), vec![], 0.9, false)
            .await;
        assert!(cache.lookup("tenant-b", "q", Some(&[1.0, 0.0])).await.is_none());
    }

    #[tokio::test]
    async fn test_hit_count_increments() {
        let cache = cache();
        cache
            .store("t", "q", vec![1.0], "counted".into(), vec![], 0.9, false)
            .await;
        cache.lookup("t", "q", None).await;
        let second = cache.lookup("t", "q", None).await.unwrap();
        assert_eq!(second.hit_count, 2);
    }
}
