//! Shared token-bucket rate limiter for upstream model APIs.
//!
//! Each governed API carries two buckets that must both be satisfied:
//! requests per minute and tokens per minute. `try_acquire` spends both
//! atomically or neither, and reports the soonest time at which both would
//! have room. Capacity is always the safe limit: 80% of the provider's
//! documented hard limit, leaving headroom for burstiness and unmonitored
//! use of the same key.
//!
//! State lives behind a backend: in-memory behind a mutex for a single
//! process, or the shared SQLite store so every process spends from the
//! same budget and limiter state survives restarts.

mod backend;
mod bucket;

pub use backend::{LimiterBackend, MemoryLimiterBackend, SqliteLimiterBackend};
pub use bucket::BucketState;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LimiterError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Unknown API: {0}")]
    UnknownApi(String),
}

pub type Result<T> = std::result::Result<T, LimiterError>;

/// Outcome of a non-blocking acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// All buckets had room; the cost has been spent.
    Ok,
    /// At least one bucket is short; retry after the suggested delay.
    Retry { after_ms: u64 },
}

/// Provider hard limits for one upstream API.
#[derive(Debug, Clone)]
pub struct ApiLimits {
    pub api: String,
    pub requests_per_min: u64,
    pub tokens_per_min: u64,
}

impl ApiLimits {
    pub fn new(api: impl Into<String>, requests_per_min: u64, tokens_per_min: u64) -> Self {
        Self {
            api: api.into(),
            requests_per_min,
            tokens_per_min,
        }
    }

    /// The limiter's effective ceiling: 80% of the documented hard limit,
    /// never the hard limit itself.
    pub fn safe_capacity(hard_limit: u64) -> u64 {
        (hard_limit as f64 * 0.80).floor() as u64
    }

    pub fn safe_requests_per_min(&self) -> u64 {
        Self::safe_capacity(self.requests_per_min)
    }

    pub fn safe_tokens_per_min(&self) -> u64 {
        Self::safe_capacity(self.tokens_per_min)
    }
}

/// Token-bucket limiter shared by every worker in the process (and, with
/// the SQLite backend, across processes).
#[derive(Clone)]
pub struct RateLimiter {
    backend: Arc<dyn LimiterBackend>,
}

impl RateLimiter {
    pub fn new(backend: Arc<dyn LimiterBackend>) -> Self {
        Self { backend }
    }

    /// Attempt to spend `cost_requests` from the request bucket and
    /// `cost_tokens` from the token bucket of `api`. Non-blocking; never
    /// partially spends.
    pub async fn try_acquire(
        &self,
        api: &str,
        cost_requests: u64,
        cost_tokens: u64,
    ) -> Result<Acquire> {
        let now_ms = Utc::now().timestamp_millis();
        self.backend
            .try_acquire(api, cost_requests, cost_tokens, now_ms)
            .await
    }

    /// Acquire, sleeping out `Retry` responses until the spend succeeds.
    ///
    /// This is the scheduling stall used by the OCR pipeline; waits here
    /// are not failures and consume no retry budget.
    pub async fn acquire(&self, api: &str, cost_requests: u64, cost_tokens: u64) -> Result<()> {
        loop {
            match self.try_acquire(api, cost_requests, cost_tokens).await? {
                Acquire::Ok => return Ok(()),
                Acquire::Retry { after_ms } => {
                    tracing::debug!(api, after_ms, "rate limiter stall");
                    tokio::time::sleep(Duration::from_millis(after_ms.max(10))).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_capacity_is_80_percent_floor() {
        assert_eq!(ApiLimits::safe_capacity(60), 48);
        assert_eq!(ApiLimits::safe_capacity(100), 80);
        assert_eq!(ApiLimits::safe_capacity(7), 5);
        assert_eq!(ApiLimits::safe_capacity(0), 0);
    }

    #[tokio::test]
    async fn test_acquire_waits_out_retry() {
        let limits = vec![ApiLimits::new("gemini", 60, 100_000)];
        let backend = Arc::new(MemoryLimiterBackend::new(&limits));
        let limiter = RateLimiter::new(backend);

        // Drain the request bucket (safe capacity 48).
        for _ in 0..48 {
            assert_eq!(
                limiter.try_acquire("gemini", 1, 0).await.unwrap(),
                Acquire::Ok
            );
        }
        assert!(matches!(
            limiter.try_acquire("gemini", 1, 0).await.unwrap(),
            Acquire::Retry { .. }
        ));

        // The blocking variant sleeps through the refill and succeeds.
        tokio::time::timeout(Duration::from_secs(5), limiter.acquire("gemini", 1, 0))
            .await
            .expect("acquire should complete after refill")
            .unwrap();
    }
}
