//! Token-bucket rate limiting.
//!
//! One limiter instance covers one scope (per-tenant or per-IP); the
//! endpoint layer consults both before admitting a query. Buckets refill
//! continuously at `rate` tokens per second up to `capacity` and are
//! checked-and-decremented atomically under the map lock.

use crate::error::RateLimitError;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// A keyed token-bucket rate limiter for one scope.
pub struct RateLimiter {
    scope: String,
    capacity: f64,
    /// Refill rate in tokens per second.
    rate: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    /// Build a limiter admitting `per_minute` requests per key with burst
    /// capacity equal to the per-minute limit.
    pub fn per_minute(scope: impl Into<String>, per_minute: u32) -> Self {
        let capacity = per_minute.max(1) as f64;
        Self {
            scope: scope.into(),
            capacity,
            rate: capacity / 60.0,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Admit or reject a request of the given cost for `key`.
    ///
    /// On rejection the error carries the whole seconds until the bucket
    /// holds `cost` tokens again.
    pub async fn allow(&self, key: &str, cost: f64) -> Result<(), RateLimitError> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;

        // Opportunistic prune: full and idle buckets carry no state.
        if buckets.len() > 10_000 {
            let capacity = self.capacity;
            buckets.retain(|_, b| {
                b.tokens + b.last_refill.elapsed().as_secs_f64() * self.rate < capacity
            });
        }

        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            Ok(())
        } else {
            let deficit = cost - bucket.tokens;
            let retry_after_secs = (deficit / self.rate).ceil() as u64;
            tracing::debug!(
                scope = %self.scope,
                key,
                retry_after_secs,
                "Rate limit exceeded"
            );
            Err(RateLimitError::Exhausted {
                scope: self.scope.clone(),
                retry_after_secs: retry_after_secs.max(1),
            })
        }
    }

    /// Remaining whole tokens for a key (capacity for unseen keys).
    pub async fn remaining(&self, key: &str) -> u64 {
        let buckets = self.buckets.lock().await;
        match buckets.get(key) {
            Some(bucket) => {
                let refilled = (bucket.tokens
                    + bucket.last_refill.elapsed().as_secs_f64() * self.rate)
                    .min(self.capacity);
                refilled.floor() as u64
            }
            None => self.capacity as u64,
        }
    }

    /// The configured per-window capacity.
    pub fn capacity(&self) -> u64 {
        self.capacity as u64
    }

    #[cfg(test)]
    async fn drain(&self, key: &str) {
        let mut buckets = self.buckets.lock().await;
        if let Some(bucket) = buckets.get_mut(key) {
            bucket.tokens = 0.0;
            bucket.last_refill = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allows_up_to_capacity() {
        let limiter = RateLimiter::per_minute("tenant", 5);
        for _ in 0..5 {
            assert!(limiter.allow("k", 1.0).await.is_ok());
        }
        let denied = limiter.allow("k", 1.0).await;
        assert!(denied.is_err());
    }

    #[tokio::test]
    async fn test_denial_carries_retry_after() {
        let limiter = RateLimiter::per_minute("tenant", 60);
        for _ in 0..60 {
            limiter.allow("k", 1.0).await.unwrap();
        }
        match limiter.allow("k", 1.0).await {
            Err(RateLimitError::Exhausted {
                scope,
                retry_after_secs,
            }) => {
                assert_eq!(scope, "tenant");
                assert!(retry_after_secs >= 1);
            }
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = RateLimiter::per_minute("ip", 1);
        assert!(limiter.allow("1.1.1.1", 1.0).await.is_ok());
        assert!(limiter.allow("1.1.1.1", 1.0).await.is_err());
        assert!(limiter.allow("2.2.2.2", 1.0).await.is_ok());
    }

    #[tokio::test]
    async fn test_refills_over_time() {
        // 600/min = 10 tokens per second, so a drained bucket recovers
        // one token within 100ms.
        let limiter = RateLimiter::per_minute("tenant", 600);
        limiter.allow("k", 1.0).await.unwrap();
        limiter.drain("k").await;
        assert!(limiter.allow("k", 1.0).await.is_err());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(limiter.allow("k", 1.0).await.is_ok());
    }

    #[tokio::test]
    async fn test_remaining_tracks_usage() {
        let limiter = RateLimiter::per_minute("tenant", 10);
        assert_eq!(limiter.remaining("k").await, 10);
        limiter.allow("k", 1.0).await.unwrap();
        assert!(limiter.remaining("k").await <= 9);
    }

    #[tokio::test]
    async fn test_admitted_requests_bounded_by_capacity_plus_refill() {
        // Admits in a window never exceed r*W + C. With C=3 and a tiny
        // window, at most the burst capacity passes.
        let limiter = RateLimiter::per_minute("tenant", 3);
        let mut admitted = 0;
        for _ in 0..10 {
            if limiter.allow("k", 1.0).await.is_ok() {
                admitted += 1;
            }
        }
        assert!(admitted <= 3);
    }

}
