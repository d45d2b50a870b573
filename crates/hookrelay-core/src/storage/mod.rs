//! Database access layer implementing the repository pattern.
//!
//! The repository layer translates between domain models and the relational
//! schema. All database operations go through these repositories; SQL
//! outside this module is forbidden to keep semantics (soft deletes, cursor
//! pagination, transactional chunking) in one place.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

pub mod delivery_attempts;
pub mod endpoints;
pub mod event_deliveries;
pub mod events;
pub mod projects;
pub mod queue_jobs;
pub mod sources;
pub mod subscriptions;

use crate::{
    error::Result,
    models::{DeliveryStatus, EndpointId, EventId, SourceId},
};

/// Junction-row insert partition size.
///
/// Event fan-outs can carry tens of thousands of endpoints; inserts are
/// chunked so a single statement never exceeds this many rows.
pub const INSERT_PARTITION_SIZE: usize = 30_000;

/// Row filter shared by event and delivery listings.
///
/// All fields are conjunctive; empty vectors and `None` place no
/// constraint. Date bounds are inclusive.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Restrict to these endpoints.
    pub endpoint_ids: Vec<EndpointId>,
    /// Restrict to these sources.
    pub source_ids: Vec<SourceId>,
    /// Restrict to deliveries of one event.
    pub event_id: Option<EventId>,
    /// Restrict to these delivery statuses.
    pub statuses: Vec<DeliveryStatus>,
    /// Restrict to one idempotency key.
    pub idempotency_key: Option<String>,
    /// Inclusive lower bound on `created_at`.
    pub created_at_start: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `created_at`.
    pub created_at_end: Option<DateTime<Utc>>,
    /// Full-text query against the tokenized event mirror.
    pub query: Option<String>,
}

/// Container for all repository instances providing unified database access.
#[derive(Clone)]
pub struct Storage {
    /// Repository for project configuration.
    pub projects: Arc<projects::Repository>,

    /// Repository for ingest sources.
    pub sources: Arc<sources::Repository>,

    /// Repository for endpoint configuration and breaker state.
    pub endpoints: Arc<endpoints::Repository>,

    /// Repository for subscriptions.
    pub subscriptions: Arc<subscriptions::Repository>,

    /// Repository for ingested events and the search mirror.
    pub events: Arc<events::Repository>,

    /// Repository for event deliveries.
    pub event_deliveries: Arc<event_deliveries::Repository>,

    /// Repository for delivery attempt audit rows.
    pub delivery_attempts: Arc<delivery_attempts::Repository>,

    /// Postgres-backed work queue.
    pub queue_jobs: Arc<queue_jobs::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    ///
    /// All repositories share the same pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            projects: Arc::new(projects::Repository::new(pool.clone())),
            sources: Arc::new(sources::Repository::new(pool.clone())),
            endpoints: Arc::new(endpoints::Repository::new(pool.clone())),
            subscriptions: Arc::new(subscriptions::Repository::new(pool.clone())),
            events: Arc::new(events::Repository::new(pool.clone())),
            event_deliveries: Arc::new(event_deliveries::Repository::new(pool.clone())),
            delivery_attempts: Arc::new(delivery_attempts::Repository::new(pool.clone())),
            queue_jobs: Arc::new(queue_jobs::Repository::new(pool)),
        }
    }

    /// Performs a health check on the database connection.
    ///
    /// # Errors
    ///
    /// Returns an error when the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.projects.pool()).await?;
        Ok(())
    }
}
