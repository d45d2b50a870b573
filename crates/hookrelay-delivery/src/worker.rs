//! Dispatcher workers.
//!
//! Workers pull delivery jobs from the work queue and run the dispatch
//! pipeline: pre-checks, rate-limit gate, transform, sign, HTTP execution,
//! attempt recording, and outcome handling through the retry scheduler and
//! circuit breaker. Claims are a status compare-and-set, so duplicate queue
//! pulls are rejected instead of producing overlapping attempts.

use std::{collections::HashMap, sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use hookrelay_core::{
    cache::TtlCache,
    models::{
        AlertConfig, DeliveryAttempt, DeliveryId, DeliveryMetadata, DeliveryStatus, Endpoint,
        EndpointAuth, EndpointId, EndpointStatus, EventDelivery, EventId, Project, ProjectId,
        RateLimitConfig, StrategyConfig, Subscription, SubscriptionId,
    },
    queue::{QueueJob, QueueName, TaskName, WorkQueue},
    Clock,
};

use crate::{
    circuit::CircuitBreaker,
    client::{extract_retry_after_seconds, ClientConfig, DeliveryClient},
    error::{DeliveryError, Result},
    planner::{DeliveryJobPayload, FanoutPlanner, IndexJobPayload},
    rate_limit::RateLimiter,
    retry::{RetryContext, RetryDecision},
    signing,
    storage::DeliveryStore,
};

/// Default number of dispatcher workers.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default jobs claimed per poll.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default cap on concurrent inflight attempts per endpoint.
pub const DEFAULT_ENDPOINT_CONCURRENCY: usize = 4;

/// Attempt rows record the service version that made them.
const API_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Configuration for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Number of concurrent workers.
    pub worker_count: usize,
    /// Jobs claimed per worker poll.
    pub batch_size: usize,
    /// Idle poll interval.
    pub poll_interval: Duration,
    /// Maximum inflight attempts per endpoint.
    pub endpoint_concurrency: usize,
    /// HTTP client configuration.
    pub client_config: ClientConfig,
    /// Fallback retry policy for deliveries without a snapshot.
    pub default_strategy: StrategyConfig,
    /// Fallback breaker policy for endpoints without an override.
    pub default_alert: AlertConfig,
    /// Fallback rate limit for endpoints without one.
    pub default_rate_limit: RateLimitConfig,
    /// Idempotency deduplication window.
    pub dedup_window: Duration,
    /// Maximum time to wait for workers on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_secs(1),
            endpoint_concurrency: DEFAULT_ENDPOINT_CONCURRENCY,
            client_config: ClientConfig::default(),
            default_strategy: StrategyConfig::default(),
            default_alert: AlertConfig::default(),
            default_rate_limit: RateLimitConfig::default(),
            dedup_window: Duration::from_secs(24 * 3600),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Counters for engine monitoring.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Number of running workers.
    pub active_workers: usize,
    /// Jobs processed since startup.
    pub jobs_processed: u64,
    /// Deliveries that reached `success`.
    pub successful_deliveries: u64,
    /// Attempts that failed and were rescheduled.
    pub rescheduled_deliveries: u64,
    /// Deliveries that reached `failure`.
    pub failed_deliveries: u64,
    /// Deliveries discarded by pre-checks.
    pub discarded_deliveries: u64,
    /// Attempts currently in flight.
    pub inflight_attempts: u64,
}

/// External transformer invocation.
///
/// Subscriptions may attach an opaque function body; executing it is an
/// external collaborator's job. The identity implementation passes the
/// payload through untouched.
#[async_trait::async_trait]
pub trait Transformer: Send + Sync {
    /// Transforms the event body; the output becomes the request body.
    async fn transform(
        &self,
        function: &str,
        payload: &serde_json::Value,
    ) -> std::result::Result<serde_json::Value, String>;
}

/// Pass-through transformer used when no execution engine is wired.
#[derive(Debug, Default)]
pub struct IdentityTransformer;

#[async_trait::async_trait]
impl Transformer for IdentityTransformer {
    async fn transform(
        &self,
        _function: &str,
        payload: &serde_json::Value,
    ) -> std::result::Result<serde_json::Value, String> {
        Ok(payload.clone())
    }
}

/// Queue payload for a deferred fan-out of an already-persisted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayJobPayload {
    /// Project owning the event.
    pub project_id: ProjectId,
    /// Event to fan out again.
    pub event_id: EventId,
}

/// Queue payload for a retention sweep of one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionSweepPayload {
    /// Project to sweep.
    pub project_id: ProjectId,
}

/// Per-endpoint inflight caps.
///
/// Bounds concurrent attempts per endpoint at `limit`; saturated endpoints
/// push their jobs back onto the queue with a small jitter instead of
/// queueing on a semaphore, which keeps workers free for other endpoints.
pub struct EndpointSlots {
    limit: usize,
    inflight: Mutex<HashMap<EndpointId, usize>>,
}

impl EndpointSlots {
    /// Creates slot tracking with the given per-endpoint limit.
    pub fn new(limit: usize) -> Self {
        Self { limit: limit.max(1), inflight: Mutex::new(HashMap::new()) }
    }

    /// Tries to reserve one inflight slot for the endpoint.
    pub async fn try_acquire(&self, endpoint_id: EndpointId) -> bool {
        let mut inflight = self.inflight.lock().await;
        let count = inflight.entry(endpoint_id).or_insert(0);
        if *count >= self.limit {
            return false;
        }
        *count += 1;
        true
    }

    /// Releases a previously acquired slot.
    pub async fn release(&self, endpoint_id: EndpointId) {
        let mut inflight = self.inflight.lock().await;
        if let Some(count) = inflight.get_mut(&endpoint_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inflight.remove(&endpoint_id);
            }
        }
    }
}

/// Read-through caches for config entities, keyed by UID with a 10-minute
/// TTL. Writers invalidate through the API layer.
#[derive(Clone)]
pub struct EntityCaches {
    /// Projects by id.
    pub projects: TtlCache<ProjectId, Project>,
    /// Endpoints by id.
    pub endpoints: TtlCache<EndpointId, Endpoint>,
    /// Subscriptions by id.
    pub subscriptions: TtlCache<SubscriptionId, Subscription>,
}

impl EntityCaches {
    /// Creates caches with the default TTL.
    pub fn new() -> Self {
        Self {
            projects: TtlCache::with_default_ttl(),
            endpoints: TtlCache::with_default_ttl(),
            subscriptions: TtlCache::with_default_ttl(),
        }
    }
}

impl Default for EntityCaches {
    fn default() -> Self {
        Self::new()
    }
}

/// One dispatcher worker.
pub struct DeliveryWorker {
    id: usize,
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
}

impl DeliveryWorker {
    /// Creates a worker sharing the engine's state.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
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
    ) -> Self {
        Self {
            id,
            store,
            queue,
            client,
            limiter,
            breaker,
            transformer,
            planner,
            caches,
            slots,
            stats,
            config,
            cancellation_token,
            clock,
        }
    }

    /// Main worker loop: claims and processes jobs until cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error only on setup failure; per-job errors are logged
    /// and the job is left for a re-pull.
    pub async fn run(&self) -> Result<()> {
        info!(worker_id = self.id, "dispatcher worker starting");

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            match self.process_batch().await {
                Ok(0) => {
                    tokio::select! {
                        () = self.clock.sleep(self.config.poll_interval) => {},
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
                Ok(_) => {},
                Err(error) => {
                    error!(worker_id = self.id, error = %error, "batch processing failed");
                    tokio::select! {
                        () = self.clock.sleep(Duration::from_secs(5)) => {},
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
            }
        }

        info!(worker_id = self.id, "dispatcher worker stopped");
        Ok(())
    }

    /// Claims and processes one batch of jobs.
    ///
    /// The run loop calls this continuously; tests and embedders drive the
    /// pipeline one batch at a time. Returns the number of jobs claimed.
    ///
    /// # Errors
    ///
    /// Returns an error when the queue claim fails; per-job failures are
    /// logged and the jobs stay claimable.
    pub async fn process_batch(&self) -> Result<usize> {
        let jobs = self.queue.claim(self.config.batch_size).await?;
        let claimed = jobs.len();

        for job in jobs {
            if self.cancellation_token.is_cancelled() {
                break;
            }
            if let Err(error) = self.process_job(&job).await {
                error!(
                    worker_id = self.id,
                    job_id = %job.id,
                    task = %job.task,
                    error = %error,
                    "job processing failed"
                );
                // Left claimed; the visibility timeout re-surfaces it.
            }
            let mut stats = self.stats.write().await;
            stats.jobs_processed += 1;
        }

        Ok(claimed)
    }

    /// Routes one claimed job to its handler.
    async fn process_job(&self, job: &QueueJob) -> Result<()> {
        match job.task {
            TaskName::EventProcessor => self.process_delivery_job(job).await,
            TaskName::IndexDocument => {
                let payload: IndexJobPayload = serde_json::from_value(job.payload.clone())
                    .map_err(|e| DeliveryError::configuration(e.to_string()))?;
                self.store.index_event(payload.event_id).await?;
                self.queue.complete(job.id).await?;
                Ok(())
            },
            TaskName::CreateEventProcessor => self.process_replay_job(job).await,
            TaskName::RetentionSweep => self.process_retention_job(job).await,
        }
    }

    /// Hard-deletes a project's events past its retention policy.
    async fn process_retention_job(&self, job: &QueueJob) -> Result<()> {
        let payload: RetentionSweepPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| DeliveryError::configuration(e.to_string()))?;

        let Some(project) = self.load_project(payload.project_id).await? else {
            self.queue.complete(job.id).await?;
            return Ok(());
        };

        let retention_days = i64::from(project.config.0.retention_days);
        let before = Utc::now() - chrono::Duration::days(retention_days);
        let removed = self.store.sweep_events(project.id, before).await?;
        if removed > 0 {
            info!(project_id = %project.id, removed, "retention sweep removed expired events");
        }

        self.queue.complete(job.id).await?;
        Ok(())
    }

    /// Deferred fan-out: batch replay enqueues one of these per event.
    async fn process_replay_job(&self, job: &QueueJob) -> Result<()> {
        let payload: ReplayJobPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| DeliveryError::configuration(e.to_string()))?;

        let Some(project) = self.load_project(payload.project_id).await? else {
            warn!(project_id = %payload.project_id, "replay for unknown project, dropping");
            self.queue.complete(job.id).await?;
            return Ok(());
        };
        let Some(event) = self.store.find_event(payload.project_id, payload.event_id).await?
        else {
            warn!(event_id = %payload.event_id, "replay for unknown event, dropping");
            self.queue.complete(job.id).await?;
            return Ok(());
        };

        self.planner.fanout_existing_event(&project, &event, Duration::ZERO).await?;
        self.queue.complete(job.id).await?;
        Ok(())
    }

    /// The dispatch pipeline for one delivery job.
    #[allow(clippy::too_many_lines)]
    async fn process_delivery_job(&self, job: &QueueJob) -> Result<()> {
        let payload: DeliveryJobPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| DeliveryError::configuration(e.to_string()))?;
        let delivery_id = payload.delivery_id;

        // Peek at the delivery before claiming so a saturated endpoint can
        // push the job back without consuming the claim.
        let Some(preview) = self.store.find_delivery(payload.project_id, delivery_id).await?
        else {
            debug!(delivery_id = %delivery_id, "delivery vanished, dropping job");
            self.queue.complete(job.id).await?;
            return Ok(());
        };
        if preview.status.is_terminal() {
            self.queue.complete(job.id).await?;
            return Ok(());
        }

        let endpoint_id = preview.endpoint_id;
        if !self.slots.try_acquire(endpoint_id).await {
            // Hot endpoint: back off with jitter to avoid a thundering herd.
            self.queue.release(job.id, dispatch_jitter()).await?;
            return Ok(());
        }

        let result = self.dispatch(payload.project_id, delivery_id, job).await;
        self.slots.release(endpoint_id).await;
        result
    }

    async fn dispatch(
        &self,
        project_id: ProjectId,
        delivery_id: DeliveryId,
        job: &QueueJob,
    ) -> Result<()> {
        // Claim: scheduled/retry -> processing. Losing the CAS means a
        // duplicate pull or concurrent resend; drop this job.
        let Some(delivery) = self.store.claim_delivery(delivery_id).await? else {
            debug!(delivery_id = %delivery_id, "claim lost, dropping duplicate job");
            self.queue.complete(job.id).await?;
            return Ok(());
        };

        let Some(project) = self.load_project(project_id).await? else {
            self.discard(&delivery, job, "project deleted").await?;
            return Ok(());
        };
        let Some(endpoint) = self.load_endpoint(delivery.endpoint_id).await? else {
            self.discard(&delivery, job, "endpoint deleted").await?;
            return Ok(());
        };
        let subscription =
            self.load_subscription(project_id, delivery.subscription_id).await?;
        let Some(subscription) = subscription else {
            self.discard(&delivery, job, "subscription deleted").await?;
            return Ok(());
        };

        // Endpoint status pre-checks: paused holds, inactive discards.
        match endpoint.status {
            EndpointStatus::Active => {},
            EndpointStatus::Paused | EndpointStatus::Pending => {
                debug!(endpoint_id = %endpoint.id, "endpoint not ready, delivery held");
                self.store
                    .update_delivery_status(
                        delivery.id,
                        DeliveryStatus::Scheduled,
                        "endpoint paused",
                    )
                    .await?;
                self.queue.release(job.id, Duration::from_secs(60)).await?;
                return Ok(());
            },
            EndpointStatus::Inactive => {
                self.discard(&delivery, job, "endpoint inactive").await?;
                return Ok(());
            },
        }

        // Rate-limit gate: denial is not an attempt and does not touch
        // num_trials.
        let limit = effective_rate_limit(&project, &endpoint, &subscription);
        let decision = self
            .limiter
            .acquire(
                &endpoint.id.to_string(),
                limit.count,
                Duration::from_secs(limit.duration_seconds),
            )
            .await?;
        if !decision.allowed {
            debug!(
                endpoint_id = %endpoint.id,
                retry_after_ms = decision.retry_after.as_millis() as u64,
                "rate limited, rescheduling without an attempt"
            );
            self.store
                .update_delivery_status(delivery.id, DeliveryStatus::Scheduled, "rate limited")
                .await?;
            self.queue.release(job.id, decision.retry_after).await?;
            return Ok(());
        }

        {
            let mut stats = self.stats.write().await;
            stats.inflight_attempts += 1;
        }
        let outcome = self.attempt(&project, &endpoint, &subscription, &delivery, job).await;
        {
            let mut stats = self.stats.write().await;
            stats.inflight_attempts = stats.inflight_attempts.saturating_sub(1);
        }
        outcome
    }

    /// Runs one HTTP attempt and hands the outcome to the scheduler.
    async fn attempt(
        &self,
        project: &Project,
        endpoint: &Endpoint,
        subscription: &Subscription,
        delivery: &EventDelivery,
        job: &QueueJob,
    ) -> Result<()> {
        let mut metadata = delivery.metadata.0.clone();
        let num_trials = metadata.num_trials + 1;

        // Transform first: its output is what gets signed and sent.
        let body_value = match &subscription.function {
            Some(function) => {
                match self.transformer.transform(function, &metadata.data).await {
                    Ok(transformed) => transformed,
                    Err(message) => {
                        let error = DeliveryError::transform(message);
                        metadata.num_trials = num_trials;
                        return self
                            .handle_failure(
                                endpoint, delivery, job, metadata, None, error, num_trials,
                            )
                            .await;
                    },
                }
            },
            None => metadata.data.clone(),
        };
        let body = serde_json::to_string(&body_value)
            .map_err(|e| DeliveryError::configuration(e.to_string()))?;

        let headers = match self.build_headers(project, endpoint, delivery, &body, num_trials) {
            Ok(headers) => headers,
            Err(error) => {
                // Signing misconfiguration is terminal until fixed.
                metadata.num_trials = num_trials;
                return self
                    .handle_failure(endpoint, delivery, job, metadata, None, error, num_trials)
                    .await;
            },
        };

        let request = crate::client::DeliveryRequest {
            delivery_id: delivery.id,
            event_id: delivery.event_id,
            url: endpoint.target_url.clone(),
            headers: headers.clone(),
            body: Bytes::from(body),
            timeout: Duration::from_secs(u64::try_from(endpoint.http_timeout_seconds).unwrap_or(30)),
            attempt_number: num_trials,
        };

        metadata.num_trials = num_trials;
        match self.client.deliver(request).await {
            Ok(response) if response.is_success => {
                let attempt = build_attempt(delivery, endpoint, &headers, Some(&response), None);
                self.store
                    .record_attempt(&attempt, DeliveryStatus::Success, &metadata, "")
                    .await?;
                let reactivated = self.breaker.record_success(endpoint.id).await?;
                if reactivated {
                    self.caches.endpoints.invalidate(&endpoint.id).await;
                }
                self.queue.complete(job.id).await?;

                let mut stats = self.stats.write().await;
                stats.successful_deliveries += 1;
                info!(
                    worker_id = self.id,
                    delivery_id = %delivery.id,
                    status = response.status_code,
                    attempt = num_trials,
                    "delivery succeeded"
                );
                Ok(())
            },
            Ok(response) => {
                let retry_after = extract_retry_after_seconds(&response.headers);
                let error = DeliveryError::endpoint_status(
                    response.status_code,
                    response.body.clone(),
                    retry_after,
                );
                self.handle_failure(
                    endpoint,
                    delivery,
                    job,
                    metadata,
                    Some((&headers, response)),
                    error,
                    num_trials,
                )
                .await
            },
            Err(error) => {
                self.handle_failure(
                    endpoint,
                    delivery,
                    job,
                    metadata,
                    Some((&headers, empty_response())),
                    error,
                    num_trials,
                )
                .await
            },
        }
    }

    /// Records a failed attempt and either reschedules or terminates.
    #[allow(clippy::too_many_arguments)]
    async fn handle_failure(
        &self,
        endpoint: &Endpoint,
        delivery: &EventDelivery,
        job: &QueueJob,
        mut metadata: DeliveryMetadata,
        response: Option<(&HashMap<String, String>, crate::client::DeliveryResponse)>,
        error: DeliveryError,
        num_trials: u32,
    ) -> Result<()> {
        let policy = StrategyConfig {
            kind: metadata.strategy,
            duration_seconds: metadata.interval_seconds,
            retry_limit: metadata.retry_limit,
        };
        let decision = RetryContext::new(num_trials, error.clone(), Utc::now(), policy).decide();

        let no_headers = HashMap::new();
        let (request_headers, http_response) = match response {
            Some((headers, response)) => (headers, Some(response)),
            None => (&no_headers, None),
        };
        let attempt =
            build_attempt(delivery, endpoint, request_headers, http_response.as_ref(), Some(&error));

        match decision {
            RetryDecision::Retry { next_attempt_at } => {
                metadata.next_send_time = next_attempt_at;
                self.store
                    .record_attempt(&attempt, DeliveryStatus::Retry, &metadata, "")
                    .await?;

                let delay = (next_attempt_at - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                // New retry job first, then ack the old one; a crash in
                // between yields a duplicate pull, which the claim CAS eats.
                self.queue
                    .enqueue(
                        QueueName::Retry,
                        TaskName::EventProcessor,
                        serde_json::to_value(DeliveryJobPayload {
                            project_id: delivery.project_id,
                            delivery_id: delivery.id,
                        })
                        .map_err(|e| DeliveryError::configuration(e.to_string()))?,
                        Some(delivery.id),
                        delay,
                    )
                    .await?;
                self.queue.complete(job.id).await?;

                let mut stats = self.stats.write().await;
                stats.rescheduled_deliveries += 1;
                warn!(
                    worker_id = self.id,
                    delivery_id = %delivery.id,
                    attempt = num_trials,
                    next_attempt_at = %next_attempt_at,
                    error = %error,
                    "delivery failed, retry scheduled"
                );
                Ok(())
            },
            RetryDecision::GiveUp { reason } => {
                self.store
                    .record_attempt(&attempt, DeliveryStatus::Failure, &metadata, &reason)
                    .await?;
                let tripped = self.breaker.record_failure(endpoint).await?;
                if tripped {
                    // The endpoint just went inactive; drop the cached copy
                    // so pre-checks see it immediately.
                    self.caches.endpoints.invalidate(&endpoint.id).await;
                }
                self.queue.complete(job.id).await?;

                let mut stats = self.stats.write().await;
                stats.failed_deliveries += 1;
                error!(
                    worker_id = self.id,
                    delivery_id = %delivery.id,
                    attempt = num_trials,
                    reason = %reason,
                    "delivery permanently failed"
                );
                Ok(())
            },
        }
    }

    /// Discards a delivery from a pre-check; no attempt is recorded.
    async fn discard(
        &self,
        delivery: &EventDelivery,
        job: &QueueJob,
        reason: &str,
    ) -> Result<()> {
        self.store
            .update_delivery_status(delivery.id, DeliveryStatus::Discarded, reason)
            .await?;
        self.queue.complete(job.id).await?;

        let mut stats = self.stats.write().await;
        stats.discarded_deliveries += 1;
        warn!(delivery_id = %delivery.id, reason, "delivery discarded");
        Ok(())
    }

    /// Assembles outbound headers: stored event headers, platform headers,
    /// signature, and endpoint authentication.
    fn build_headers(
        &self,
        project: &Project,
        endpoint: &Endpoint,
        delivery: &EventDelivery,
        body: &str,
        attempt_number: u32,
    ) -> Result<HashMap<String, String>> {
        let mut headers = delivery.headers.0.clone();

        let signature_config = &project.config.0.signature;
        let signature =
            signing::build_signature_header(signature_config, &endpoint.secrets.0, Utc::now(), body)?;
        headers.insert(signature_config.header.clone(), signature);

        headers.insert("X-Hookrelay-Event-Type".to_string(), delivery.event_type.clone());
        headers.insert("X-Hookrelay-Delivery-Attempt".to_string(), attempt_number.to_string());

        if let Some(auth) = &endpoint.auth {
            match &auth.0 {
                EndpointAuth::ApiKey { header_name, header_value } => {
                    headers.insert(header_name.clone(), header_value.clone());
                },
            }
        }

        Ok(headers)
    }

    async fn load_project(&self, id: ProjectId) -> Result<Option<Project>> {
        if let Some(project) = self.caches.projects.get(&id).await {
            return Ok(Some(project));
        }
        let project = self.store.find_project(id).await?;
        if let Some(project) = &project {
            self.caches.projects.insert(id, project.clone()).await;
        }
        Ok(project)
    }

    async fn load_endpoint(&self, id: EndpointId) -> Result<Option<Endpoint>> {
        if let Some(endpoint) = self.caches.endpoints.get(&id).await {
            return Ok(Some(endpoint));
        }
        let endpoint = self.store.find_endpoint(id).await?;
        if let Some(endpoint) = &endpoint {
            self.caches.endpoints.insert(id, endpoint.clone()).await;
        }
        Ok(endpoint)
    }

    async fn load_subscription(
        &self,
        project_id: ProjectId,
        id: SubscriptionId,
    ) -> Result<Option<Subscription>> {
        if let Some(subscription) = self.caches.subscriptions.get(&id).await {
            return Ok(Some(subscription));
        }
        let subscription = self.store.find_subscription(project_id, id).await?;
        if let Some(subscription) = &subscription {
            self.caches.subscriptions.insert(id, subscription.clone()).await;
        }
        Ok(subscription)
    }
}

/// Effective rate limit: subscription override, endpoint config, then
/// project default.
fn effective_rate_limit(
    project: &Project,
    endpoint: &Endpoint,
    subscription: &Subscription,
) -> RateLimitConfig {
    if let Some(config) = &subscription.rate_limit_config {
        return config.0;
    }
    if endpoint.rate_limit > 0 && endpoint.rate_limit_duration_seconds > 0 {
        return RateLimitConfig {
            count: u32::try_from(endpoint.rate_limit).unwrap_or(0),
            duration_seconds: u64::try_from(endpoint.rate_limit_duration_seconds).unwrap_or(0),
        };
    }
    project.config.0.rate_limit
}

/// Jitter applied when an endpoint's inflight cap is saturated.
fn dispatch_jitter() -> Duration {
    let mut rng = rand::rng();
    Duration::from_millis(rng.random_range(50..=250))
}

fn empty_response() -> crate::client::DeliveryResponse {
    crate::client::DeliveryResponse {
        status_code: 0,
        headers: HashMap::new(),
        body: String::new(),
        ip_address: String::new(),
        duration: Duration::ZERO,
        is_success: false,
    }
}

fn build_attempt(
    delivery: &EventDelivery,
    endpoint: &Endpoint,
    request_headers: &HashMap<String, String>,
    response: Option<&crate::client::DeliveryResponse>,
    error: Option<&DeliveryError>,
) -> DeliveryAttempt {
    let (http_status, response_headers, response_data, ip_address) = match response {
        Some(response) if response.status_code > 0 => (
            Some(i32::from(response.status_code)),
            response.headers.clone(),
            response.body.clone(),
            response.ip_address.clone(),
        ),
        _ => (None, HashMap::new(), String::new(), String::new()),
    };

    DeliveryAttempt {
        id: Uuid::now_v7(),
        delivery_id: delivery.id,
        endpoint_id: endpoint.id,
        api_version: API_VERSION.to_string(),
        ip_address,
        request_http_header: sqlx::types::Json(request_headers.clone()),
        response_http_header: sqlx::types::Json(response_headers),
        http_status,
        response_data,
        error: error.map(ToString::to_string).unwrap_or_default(),
        status: response.is_some_and(|r| r.is_success),
        created_at: Utc::now(),
    }
}
