//! Per-endpoint rate limiting.
//!
//! Fixed-window counters keyed by endpoint id. A denied acquire returns the
//! remaining window so the dispatcher can re-enqueue the job instead of
//! burning an attempt; rate-limited deliveries never increment
//! `num_trials`.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::Result;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Time until the window resets; zero when allowed.
    pub retry_after: Duration,
}

impl RateLimitDecision {
    /// An allowing decision.
    pub const fn allow() -> Self {
        Self { allowed: true, retry_after: Duration::ZERO }
    }

    /// A denying decision with reset guidance.
    pub const fn deny(retry_after: Duration) -> Self {
        Self { allowed: false, retry_after }
    }
}

/// Shared rate limiter consulted by every dispatcher worker.
///
/// Implementations share state across workers; the in-memory one is
/// process-wide, backend-based ones span processes.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Takes one token for `key` from a `limit`-per-`window` budget.
    async fn acquire(&self, key: &str, limit: u32, window: Duration)
        -> Result<RateLimitDecision>;
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: Instant,
    count: u32,
}

/// Fixed-window in-memory rate limiter.
#[derive(Default)]
pub struct MemoryRateLimiter {
    windows: Arc<Mutex<HashMap<String, Window>>>,
}

impl MemoryRateLimiter {
    /// Creates an empty limiter.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn acquire(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateLimitDecision> {
        // A zero limit or zero window disables limiting for the key.
        if limit == 0 || window.is_zero() {
            return Ok(RateLimitDecision::allow());
        }

        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        let entry = windows.entry(key.to_string()).or_insert(Window { started_at: now, count: 0 });

        let elapsed = now.duration_since(entry.started_at);
        if elapsed >= window {
            entry.started_at = now;
            entry.count = 0;
        }

        if entry.count < limit {
            entry.count += 1;
            Ok(RateLimitDecision::allow())
        } else {
            Ok(RateLimitDecision::deny(window.saturating_sub(elapsed)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_limit_within_window() {
        let limiter = MemoryRateLimiter::new();
        for _ in 0..3 {
            let decision = limiter.acquire("ep", 3, Duration::from_secs(60)).await.unwrap();
            assert!(decision.allowed);
        }

        let denied = limiter.acquire("ep", 3, Duration::from_secs(60)).await.unwrap();
        assert!(!denied.allowed);
        assert!(denied.retry_after > Duration::ZERO);
        assert!(denied.retry_after <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn window_expiry_resets_budget() {
        let limiter = MemoryRateLimiter::new();
        let window = Duration::from_millis(30);

        assert!(limiter.acquire("ep", 1, window).await.unwrap().allowed);
        assert!(!limiter.acquire("ep", 1, window).await.unwrap().allowed);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(limiter.acquire("ep", 1, window).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let limiter = MemoryRateLimiter::new();
        let window = Duration::from_secs(60);

        assert!(limiter.acquire("a", 1, window).await.unwrap().allowed);
        assert!(!limiter.acquire("a", 1, window).await.unwrap().allowed);
        assert!(limiter.acquire("b", 1, window).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn zero_limit_disables_limiting() {
        let limiter = MemoryRateLimiter::new();
        for _ in 0..100 {
            assert!(limiter.acquire("ep", 0, Duration::from_secs(1)).await.unwrap().allowed);
        }
    }
}
