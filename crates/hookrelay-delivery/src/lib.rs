//! Webhook delivery engine.
//!
//! Implements the delivery half of the platform: fan-out planning,
//! dispatcher workers pulling from the work queue, versioned request
//! signing, fixed-window rate limiting, per-endpoint circuit breaking,
//! retry scheduling, and replay. Persistence goes through the
//! [`storage::DeliveryStore`] trait so the whole engine runs against
//! Postgres in production and against the in-memory mock in tests.
//!
//! Control flow:
//!
//! ```text
//! ingest -> FanoutPlanner -> WorkQueue (delivery job)
//!        -> DeliveryWorker -> outcome -> RetryContext
//!        -> WorkQueue (delayed retry) | terminal status
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod circuit;
pub mod client;
pub mod error;
pub mod planner;
pub mod rate_limit;
pub mod replay;
pub mod retry;
pub mod signing;
pub mod storage;
pub mod worker;
pub mod worker_pool;

pub use circuit::{BreakerNotifier, CircuitBreaker, NoOpNotifier};
pub use client::{ClientConfig, DeliveryClient, DeliveryRequest, DeliveryResponse};
pub use error::{DeliveryError, Result};
pub use planner::{DeliveryJobPayload, FanoutPlanner, FanoutResult, RawEvent};
pub use rate_limit::{MemoryRateLimiter, RateLimitDecision, RateLimiter};
pub use replay::{BatchSummary, ReplayService};
pub use retry::{RetryContext, RetryDecision};
pub use storage::{DeliveryStore, PostgresDeliveryStore};
pub use worker::{
    DeliveryWorker, DispatcherConfig, EngineStats, IdentityTransformer, Transformer,
};
pub use worker_pool::{DeliveryEngine, WorkerPool};
