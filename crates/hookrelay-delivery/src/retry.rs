//! Retry scheduling and backoff computation.
//!
//! After every failed attempt the scheduler decides between a delayed retry
//! and terminal failure. `retry_limit` counts retries after the first
//! attempt, so a delivery makes at most `retry_limit + 1` attempts and a
//! limit of zero means a single failed attempt goes straight to `failure`.

use std::time::Duration;

use chrono::{DateTime, Utc};

use hookrelay_core::models::{StrategyConfig, StrategyKind};

use crate::error::DeliveryError;

/// Upper bound on any computed backoff delay: 24 hours.
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 3600);

/// Lower bound for exponential delays, so `interval_seconds = 0` still
/// spaces attempts out.
pub const MIN_EXPONENTIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Result of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry at the given time.
    Retry {
        /// When the next attempt becomes due.
        next_attempt_at: DateTime<Utc>,
    },
    /// Stop retrying; the delivery is terminally failed.
    GiveUp {
        /// Why no retry is scheduled.
        reason: String,
    },
}

/// Context for deciding what happens after a failed attempt.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Attempts made so far, including the one that just failed.
    pub num_trials: u32,
    /// The failure being classified.
    pub error: DeliveryError,
    /// When the attempt failed.
    pub failed_at: DateTime<Utc>,
    /// Policy in force for this delivery.
    pub policy: StrategyConfig,
}

impl RetryContext {
    /// Creates a retry context for a failed attempt.
    pub fn new(
        num_trials: u32,
        error: DeliveryError,
        failed_at: DateTime<Utc>,
        policy: StrategyConfig,
    ) -> Self {
        Self { num_trials, error, failed_at, policy }
    }

    /// Decides whether and when to retry.
    ///
    /// Non-retriable errors and an exhausted attempt budget both give up.
    /// A server-supplied Retry-After (429) overrides the computed backoff,
    /// still capped at [`MAX_BACKOFF`].
    pub fn decide(&self) -> RetryDecision {
        if !self.error.is_retriable() {
            return RetryDecision::GiveUp { reason: format!("non-retriable: {}", self.error) };
        }

        if self.num_trials > self.policy.retry_limit {
            return RetryDecision::GiveUp {
                reason: format!(
                    "retry limit ({}) exhausted after {} attempts",
                    self.policy.retry_limit, self.num_trials
                ),
            };
        }

        let delay = match self.error.retry_after_seconds() {
            Some(seconds) => Duration::from_secs(seconds).min(MAX_BACKOFF),
            None => backoff_delay(self.policy.kind, self.policy.duration_seconds, self.num_trials),
        };

        let Ok(delay) = chrono::Duration::from_std(delay) else {
            return RetryDecision::GiveUp { reason: "retry delay out of range".to_string() };
        };

        RetryDecision::Retry { next_attempt_at: self.failed_at + delay }
    }
}

/// Computes the backoff delay after the `num_trials`-th attempt.
///
/// Linear: the configured interval. Exponential:
/// `interval * 2^(num_trials - 1)`, clamped into
/// [[`MIN_EXPONENTIAL_BACKOFF`], [`MAX_BACKOFF`]].
pub fn backoff_delay(kind: StrategyKind, interval_seconds: u64, num_trials: u32) -> Duration {
    match kind {
        StrategyKind::Linear => Duration::from_secs(interval_seconds).min(MAX_BACKOFF),
        StrategyKind::Exponential => {
            let exponent = num_trials.saturating_sub(1).min(20);
            let factor = 2u64.saturating_pow(exponent);
            let seconds = interval_seconds.saturating_mul(factor);
            Duration::from_secs(seconds).clamp(MIN_EXPONENTIAL_BACKOFF, MAX_BACKOFF)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(kind: StrategyKind, duration_seconds: u64, retry_limit: u32) -> StrategyConfig {
        StrategyConfig { kind, duration_seconds, retry_limit }
    }

    #[test]
    fn linear_delays_stay_constant() {
        for trial in 1..=5 {
            assert_eq!(
                backoff_delay(StrategyKind::Linear, 30, trial),
                Duration::from_secs(30)
            );
        }
    }

    #[test]
    fn exponential_delays_double() {
        // interval 5s: 5, 10, 20 for the first three failed attempts.
        assert_eq!(backoff_delay(StrategyKind::Exponential, 5, 1), Duration::from_secs(5));
        assert_eq!(backoff_delay(StrategyKind::Exponential, 5, 2), Duration::from_secs(10));
        assert_eq!(backoff_delay(StrategyKind::Exponential, 5, 3), Duration::from_secs(20));
    }

    #[test]
    fn exponential_is_capped_at_24_hours() {
        let delay = backoff_delay(StrategyKind::Exponential, 3600, 12);
        assert_eq!(delay, MAX_BACKOFF);
    }

    #[test]
    fn zero_interval_exponential_clamps_to_one_second() {
        assert_eq!(
            backoff_delay(StrategyKind::Exponential, 0, 1),
            MIN_EXPONENTIAL_BACKOFF
        );
        assert_eq!(
            backoff_delay(StrategyKind::Exponential, 0, 7),
            MIN_EXPONENTIAL_BACKOFF
        );
    }

    #[test]
    fn retries_until_limit_then_gives_up() {
        let policy = policy(StrategyKind::Exponential, 5, 3);
        let failed_at = Utc::now();

        // Attempts 1..=3 schedule retries; attempt 4 exhausts the budget.
        for trial in 1..=3 {
            let ctx = RetryContext::new(
                trial,
                DeliveryError::endpoint_status(500, "", None),
                failed_at,
                policy,
            );
            assert!(matches!(ctx.decide(), RetryDecision::Retry { .. }), "trial {trial}");
        }

        let ctx = RetryContext::new(
            4,
            DeliveryError::endpoint_status(500, "", None),
            failed_at,
            policy,
        );
        match ctx.decide() {
            RetryDecision::GiveUp { reason } => assert!(reason.contains("retry limit")),
            RetryDecision::Retry { .. } => unreachable!("limit must be exhausted"),
        }
    }

    #[test]
    fn zero_retry_limit_fails_on_first_attempt() {
        let ctx = RetryContext::new(
            1,
            DeliveryError::endpoint_status(503, "", None),
            Utc::now(),
            policy(StrategyKind::Linear, 30, 0),
        );
        assert!(matches!(ctx.decide(), RetryDecision::GiveUp { .. }));
    }

    #[test]
    fn non_retriable_gives_up_immediately() {
        let ctx = RetryContext::new(
            1,
            DeliveryError::endpoint_status(404, "", None),
            Utc::now(),
            policy(StrategyKind::Linear, 30, 5),
        );
        match ctx.decide() {
            RetryDecision::GiveUp { reason } => assert!(reason.contains("non-retriable")),
            RetryDecision::Retry { .. } => unreachable!("4xx must not retry"),
        }
    }

    #[test]
    fn retry_after_overrides_backoff() {
        let failed_at = Utc::now();
        let ctx = RetryContext::new(
            1,
            DeliveryError::endpoint_status(429, "", Some(120)),
            failed_at,
            policy(StrategyKind::Linear, 30, 5),
        );
        match ctx.decide() {
            RetryDecision::Retry { next_attempt_at } => {
                assert_eq!(next_attempt_at, failed_at + chrono::Duration::seconds(120));
            },
            RetryDecision::GiveUp { .. } => unreachable!("429 is retriable"),
        }
    }

    #[test]
    fn linear_schedule_matches_interval() {
        let failed_at = Utc::now();
        let ctx = RetryContext::new(
            2,
            DeliveryError::endpoint_status(503, "", None),
            failed_at,
            policy(StrategyKind::Linear, 30, 3),
        );
        match ctx.decide() {
            RetryDecision::Retry { next_attempt_at } => {
                assert_eq!(next_attempt_at, failed_at + chrono::Duration::seconds(30));
            },
            RetryDecision::GiveUp { .. } => unreachable!(),
        }
    }
}
