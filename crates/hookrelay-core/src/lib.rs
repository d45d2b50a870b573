//! Core domain models and services for the hookrelay delivery platform.
//!
//! Provides strongly-typed domain primitives, the subscription filter
//! engine, the work queue contract, cursor pagination, and the repository
//! layer. All other crates depend on these foundational types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod error;
pub mod filter;
pub mod models;
pub mod pagination;
pub mod queue;
pub mod storage;
pub mod time;

pub use cache::TtlCache;
pub use error::{CoreError, Result};
pub use models::{
    AlertConfig, DeliveryAttempt, DeliveryId, DeliveryMetadata, DeliveryStatus, Endpoint,
    EndpointId, EndpointStatus, Event, EventDelivery, EventId, FilterConfig, Project,
    ProjectConfig, ProjectId, ProjectType, RateLimitConfig, SignatureConfig, Source, SourceId,
    StrategyConfig, StrategyKind, Subscription, SubscriptionId, SubscriptionType,
};
pub use queue::{MemoryWorkQueue, QueueJob, QueueName, TaskName, WorkQueue};
pub use time::{Clock, RealClock};
