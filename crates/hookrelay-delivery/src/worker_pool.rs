//! Worker pool management and engine lifecycle.
//!
//! A fixed set of long-lived dispatcher workers pull from the work queue
//! under supervision: spawn, health, and graceful shutdown with a timeout.
//! A worker panic is absorbed by its task; the claimed job resurfaces
//! after the visibility timeout, preserving at-least-once processing.

use std::{sync::Arc, time::Duration};

use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use hookrelay_core::{queue::WorkQueue, Clock, RealClock};

use crate::{
    circuit::{BreakerNotifier, CircuitBreaker},
    client::DeliveryClient,
    error::{DeliveryError, Result},
    planner::FanoutPlanner,
    rate_limit::RateLimiter,
    storage::DeliveryStore,
    worker::{
        DeliveryWorker, DispatcherConfig, EndpointSlots, EngineStats, EntityCaches, Transformer,
    },
};

/// Supervised pool of dispatcher workers.
pub struct WorkerPool {
    workers: Vec<Arc<DeliveryWorker>>,
    handles: Vec<JoinHandle<Result<()>>>,
    cancellation_token: CancellationToken,
    stats: Arc<RwLock<EngineStats>>,
}

impl WorkerPool {
    fn new(
        workers: Vec<Arc<DeliveryWorker>>,
        cancellation_token: CancellationToken,
        stats: Arc<RwLock<EngineStats>>,
    ) -> Self {
        Self { workers, handles: Vec::new(), cancellation_token, stats }
    }

    /// Spawns all workers. Returns immediately.
    async fn spawn_workers(&mut self) {
        info!(worker_count = self.workers.len(), "spawning dispatcher workers");

        {
            let mut stats = self.stats.write().await;
            stats.active_workers = self.workers.len();
        }

        for worker in &self.workers {
            let worker = worker.clone();
            let handle = tokio::spawn(async move { worker.run().await });
            self.handles.push(handle);
        }
    }

    /// Signals cancellation and waits for workers within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownRequested` when the timeout elapses with workers
    /// still running.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();

        let stats = self.stats.clone();
        let handles = std::mem::take(&mut self.handles);
        let shutdown = async move {
            for (worker_id, handle) in handles.into_iter().enumerate() {
                match handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(error)) => {
                        warn!(worker_id, error = %error, "worker finished with error");
                    },
                    Err(join_error) => {
                        error!(worker_id, error = %join_error, "worker task panicked");
                    },
                }
            }
            stats.write().await.active_workers = 0;
        };

        match tokio::time::timeout(timeout, shutdown).await {
            Ok(()) => {
                info!("worker pool shutdown completed");
                Ok(())
            },
            Err(_) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "worker shutdown timed out, workers may still be running"
                );
                Err(DeliveryError::ShutdownRequested)
            },
        }
    }

    /// Whether any worker task is still running.
    pub fn has_active_workers(&self) -> bool {
        self.handles.iter().any(|h| !h.is_finished())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active = self.handles.iter().filter(|h| !h.is_finished()).count();
        if active > 0 && !self.cancellation_token.is_cancelled() {
            error!(
                active_workers = active,
                "WorkerPool dropped with active workers, forcing cancellation"
            );
            self.cancellation_token.cancel();
        }
    }
}

/// The delivery engine: shared components plus the worker pool.
pub struct DeliveryEngine {
    store: Arc<dyn DeliveryStore>,
    queue: Arc<dyn WorkQueue>,
    client: Arc<DeliveryClient>,
    limiter: Arc<dyn RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    transformer: Arc<dyn Transformer>,
    planner: Arc<FanoutPlanner>,
    caches: EntityCaches,
    slots: Arc<EndpointSlots>,
    stats: Arc<RwLock<EngineStats>>,
    config: DispatcherConfig,
    cancellation_token: CancellationToken,
    clock: Arc<dyn Clock>,
    worker_pool: Option<WorkerPool>,
}

impl DeliveryEngine {
    /// Creates an engine over the given capabilities.
    ///
    /// # Errors
    ///
    /// Returns an error when the HTTP client cannot be built.
    pub fn new(
        store: Arc<dyn DeliveryStore>,
        queue: Arc<dyn WorkQueue>,
        limiter: Arc<dyn RateLimiter>,
        transformer: Arc<dyn Transformer>,
        notifier: Arc<dyn BreakerNotifier>,
        config: DispatcherConfig,
    ) -> Result<Self> {
        let client = Arc::new(DeliveryClient::new(config.client_config.clone())?);
        let breaker =
            Arc::new(CircuitBreaker::new(store.clone(), notifier, config.default_alert));
        let dedup_window = chrono::Duration::from_std(config.dedup_window)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        let planner = Arc::new(FanoutPlanner::with_dedup_window(
            store.clone(),
            queue.clone(),
            dedup_window,
        ));
        let slots = Arc::new(EndpointSlots::new(config.endpoint_concurrency));

        Ok(Self {
            store,
            queue,
            client,
            limiter,
            breaker,
            transformer,
            planner,
            caches: EntityCaches::new(),
            slots,
            stats: Arc::new(RwLock::new(EngineStats::default())),
            config,
            cancellation_token: CancellationToken::new(),
            clock: Arc::new(RealClock::new()),
            worker_pool: None,
        })
    }

    /// Replaces the engine clock (tests drive virtual time through this).
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The planner sharing this engine's store and queue.
    pub fn planner(&self) -> Arc<FanoutPlanner> {
        self.planner.clone()
    }

    /// The entity caches, for invalidation by the write surface.
    pub fn caches(&self) -> EntityCaches {
        self.caches.clone()
    }

    /// Starts the configured worker pool. Returns immediately.
    pub async fn start(&mut self) {
        let workers: Vec<Arc<DeliveryWorker>> = (0..self.config.worker_count)
            .map(|worker_id| {
                Arc::new(DeliveryWorker::new(
                    worker_id,
                    self.store.clone(),
                    self.queue.clone(),
                    self.client.clone(),
                    self.limiter.clone(),
                    self.breaker.clone(),
                    self.transformer.clone(),
                    self.planner.clone(),
                    self.caches.clone(),
                    self.slots.clone(),
                    self.stats.clone(),
                    self.config.clone(),
                    self.cancellation_token.clone(),
                    self.clock.clone(),
                ))
            })
            .collect();

        let mut pool = WorkerPool::new(workers, self.cancellation_token.clone(), self.stats.clone());
        pool.spawn_workers().await;
        self.worker_pool = Some(pool);

        info!(worker_count = self.config.worker_count, "delivery engine started");
    }

    /// Gracefully shuts the engine down.
    ///
    /// # Errors
    ///
    /// Returns an error when workers do not finish within the configured
    /// shutdown timeout.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");
        match self.worker_pool.take() {
            Some(pool) => pool.shutdown_graceful(self.config.shutdown_timeout).await,
            None => Ok(()),
        }
    }

    /// Current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }
}
