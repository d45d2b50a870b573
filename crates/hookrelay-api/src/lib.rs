//! HTTP ingest and admin surface.
//!
//! Axum routes for event ingestion, fan-out, replay, resend, and paged
//! listings, plus health probes. The planner runs synchronously inside the
//! ingest handlers: the event and its deliveries are persisted before the
//! response returns.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod handlers;
pub mod server;

use std::sync::Arc;

use hookrelay_core::storage::Storage;
use hookrelay_delivery::{planner::FanoutPlanner, replay::ReplayService, worker::EntityCaches};

pub use config::Config;
pub use server::{create_router, start_server};

/// Shared application state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    /// Repository aggregate.
    pub storage: Arc<Storage>,
    /// Fan-out planner shared with the delivery engine.
    pub planner: Arc<FanoutPlanner>,
    /// Replay and resend operations.
    pub replay: Arc<ReplayService>,
    /// Dispatcher entity caches; write paths invalidate by key.
    pub caches: EntityCaches,
}

impl AppState {
    /// Creates the shared state.
    pub fn new(
        storage: Arc<Storage>,
        planner: Arc<FanoutPlanner>,
        replay: Arc<ReplayService>,
        caches: EntityCaches,
    ) -> Self {
        Self { storage, planner, replay, caches }
    }
}
