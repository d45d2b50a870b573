//! Replay and force-resend operations.
//!
//! Replay re-runs fan-out for an event against the subscriptions that
//! exist now, not the ones that matched originally. Resend revives a
//! single terminal delivery; force-resend revives a set, skipping state
//! checks but still refusing endpoints that remain disabled. Batch
//! variants stream their result sets with a cursor loop instead of one
//! unbounded page.

use std::{sync::Arc, time::Duration};

use rand::Rng;
use serde_json::json;
use tracing::{info, warn};

use hookrelay_core::{
    error::{CoreError, Result},
    models::{
        DeliveryId, DeliveryStatus, EndpointStatus, EventDelivery, EventId, Project, ProjectId,
    },
    queue::{QueueName, TaskName, WorkQueue},
    storage::ListFilter,
};

use crate::{
    planner::{DeliveryJobPayload, FanoutPlanner},
    storage::DeliveryStore,
    worker::ReplayJobPayload,
};

/// Page size for batch streaming.
pub const BATCH_PAGE_SIZE: i64 = 1000;

/// Result of a bulk operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct BatchSummary {
    /// Items queued or reset successfully.
    pub successes: u64,
    /// Items that failed validation or persistence.
    pub failures: u64,
}

/// Replay, resend, and batch retry operations.
pub struct ReplayService {
    store: Arc<dyn DeliveryStore>,
    queue: Arc<dyn WorkQueue>,
    planner: Arc<FanoutPlanner>,
}

impl ReplayService {
    /// Creates the service over shared capabilities.
    pub fn new(
        store: Arc<dyn DeliveryStore>,
        queue: Arc<dyn WorkQueue>,
        planner: Arc<FanoutPlanner>,
    ) -> Self {
        Self { store, queue, planner }
    }

    /// Replays one event: fresh deliveries from current subscriptions.
    ///
    /// No deduplication against earlier fan-outs; replaying twice creates
    /// two independent delivery sets.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown events.
    pub async fn replay_event(
        &self,
        project: &Project,
        event_id: EventId,
    ) -> Result<Vec<EventDelivery>> {
        let event = self
            .store
            .find_event(project.id, event_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("event {event_id}")))?;

        let deliveries =
            self.planner.fanout_existing_event(project, &event, Duration::ZERO).await?;
        info!(
            project_id = %project.id,
            event_id = %event_id,
            deliveries = deliveries.len(),
            "event replayed"
        );
        Ok(deliveries)
    }

    /// Replays every event matching the filter.
    ///
    /// Streams ids in `created_at`-ascending pages of [`BATCH_PAGE_SIZE`]
    /// and enqueues one deferred fan-out job per event, spread under the
    /// project's rate-limit policy.
    ///
    /// # Errors
    ///
    /// Returns an error only when the id stream itself fails; per-event
    /// enqueue failures are counted in the summary.
    pub async fn batch_replay(
        &self,
        project: &Project,
        filter: &ListFilter,
    ) -> Result<BatchSummary> {
        let mut summary = BatchSummary::default();
        let mut cursor: Option<EventId> = None;
        let mut position: u64 = 0;

        loop {
            let page = self
                .store
                .event_ids_page(project.id, filter, cursor, BATCH_PAGE_SIZE)
                .await?;
            let Some(last) = page.last().copied() else { break };

            for event_id in page {
                let delay = spread_delay(project, position);
                position += 1;

                let enqueued = self
                    .queue
                    .enqueue(
                        QueueName::CreateEvent,
                        TaskName::CreateEventProcessor,
                        json!(ReplayJobPayload { project_id: project.id, event_id }),
                        None,
                        delay,
                    )
                    .await;
                match enqueued {
                    Ok(_) => summary.successes += 1,
                    Err(error) => {
                        warn!(event_id = %event_id, error = %error, "batch replay enqueue failed");
                        summary.failures += 1;
                    },
                }
            }

            cursor = Some(last);
        }

        info!(
            project_id = %project.id,
            successes = summary.successes,
            failures = summary.failures,
            "batch replay enqueued"
        );
        Ok(summary)
    }

    /// Resends a single delivery.
    ///
    /// Only terminal deliveries (`success`, `failure`, `discarded`) may be
    /// resent; the delivery resets to `scheduled` with zero trials and a
    /// fresh job. Endpoints that are still disabled refuse the resend.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` for non-terminal deliveries or disabled
    /// endpoints, `NotFound` for unknown ids.
    pub async fn resend_delivery(
        &self,
        project: &Project,
        delivery_id: DeliveryId,
    ) -> Result<EventDelivery> {
        let delivery = self
            .store
            .find_delivery(project.id, delivery_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("event delivery {delivery_id}")))?;

        if !delivery.status.is_terminal() {
            return Err(CoreError::conflict(format!(
                "delivery {delivery_id} is {} and cannot be resent",
                delivery.status
            )));
        }

        self.revive(project.id, &delivery, Duration::ZERO).await
    }

    /// Force-resends a set of deliveries by id.
    ///
    /// State checks are skipped, but deliveries whose endpoint is still
    /// disabled are refused until the endpoint is re-enabled. Pending
    /// retry jobs are purged before re-enqueueing.
    ///
    /// # Errors
    ///
    /// Never fails as a whole; per-id failures are counted in the summary.
    pub async fn force_resend(
        &self,
        project: &Project,
        ids: &[DeliveryId],
    ) -> Result<BatchSummary> {
        let mut summary = BatchSummary::default();

        for (position, id) in ids.iter().enumerate() {
            let delivery = match self.store.find_delivery(project.id, *id).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    summary.failures += 1;
                    continue;
                },
                Err(error) => {
                    warn!(delivery_id = %id, error = %error, "force resend lookup failed");
                    summary.failures += 1;
                    continue;
                },
            };

            let delay = spread_delay(project, position as u64);
            match self.revive(project.id, &delivery, delay).await {
                Ok(_) => summary.successes += 1,
                Err(error) => {
                    warn!(delivery_id = %id, error = %error, "force resend refused");
                    summary.failures += 1;
                },
            }
        }

        Ok(summary)
    }

    /// Retries every delivery matching the filter.
    ///
    /// Streams ids ascending and applies single-resend semantics to each;
    /// non-terminal deliveries count as failures.
    ///
    /// # Errors
    ///
    /// Returns an error only when the id stream itself fails.
    pub async fn batch_retry(
        &self,
        project: &Project,
        filter: &ListFilter,
    ) -> Result<BatchSummary> {
        let mut summary = BatchSummary::default();
        let mut cursor: Option<DeliveryId> = None;

        loop {
            let page = self
                .store
                .delivery_ids_page(project.id, filter, cursor, BATCH_PAGE_SIZE)
                .await?;
            let Some(last) = page.last().copied() else { break };

            for delivery_id in page {
                match self.resend_delivery(project, delivery_id).await {
                    Ok(_) => summary.successes += 1,
                    Err(error) => {
                        warn!(delivery_id = %delivery_id, error = %error, "batch retry skipped");
                        summary.failures += 1;
                    },
                }
            }

            cursor = Some(last);
        }

        info!(
            project_id = %project.id,
            successes = summary.successes,
            failures = summary.failures,
            "batch retry completed"
        );
        Ok(summary)
    }

    /// Resets a delivery and enqueues a fresh job.
    ///
    /// Stale jobs are purged before the reset, so no queued job can point
    /// at a revived delivery; the new job is enqueued after.
    async fn revive(
        &self,
        project_id: ProjectId,
        delivery: &EventDelivery,
        delay: Duration,
    ) -> Result<EventDelivery> {
        let endpoint = self
            .store
            .find_endpoint(delivery.endpoint_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("endpoint {}", delivery.endpoint_id)))?;

        if endpoint.status != EndpointStatus::Active {
            return Err(CoreError::conflict(format!(
                "endpoint {} is {}; re-enable it before resending",
                endpoint.id, endpoint.status
            )));
        }

        self.queue.delete_for_deliveries(&[delivery.id]).await?;
        let mut reset = self.store.reset_deliveries_for_resend(&[delivery.id]).await?;
        let delivery = reset
            .pop()
            .ok_or_else(|| CoreError::not_found(format!("event delivery {}", delivery.id)))?;

        self.queue
            .enqueue(
                QueueName::Event,
                TaskName::EventProcessor,
                json!(DeliveryJobPayload { project_id, delivery_id: delivery.id }),
                Some(delivery.id),
                delay,
            )
            .await?;

        debug_assert_eq!(delivery.status, DeliveryStatus::Scheduled);
        Ok(delivery)
    }
}

/// Delay for the `position`-th item of a batch, spreading enqueues under
/// the project's rate-limit policy with jitter.
fn spread_delay(project: &Project, position: u64) -> Duration {
    let rate = project.config.0.rate_limit;
    if rate.count == 0 || rate.duration_seconds == 0 {
        return Duration::ZERO;
    }

    let window = position / u64::from(rate.count);
    let base = window * rate.duration_seconds * 1000;
    let jitter = rand::rng().random_range(0..=250);
    Duration::from_millis(base + jitter)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::Utc;
    use sqlx::types::Json;

    use hookrelay_core::{
        models::{
            DeliveryMetadata, Endpoint, EndpointId, Event, EventId, FilterConfig, ProjectConfig,
            ProjectId, ProjectType, StrategyKind, Subscription, SubscriptionId, SubscriptionType,
        },
        queue::MemoryWorkQueue,
    };

    use super::*;
    use crate::storage::mock::MockDeliveryStore;

    fn project() -> Project {
        let now = Utc::now();
        Project {
            id: ProjectId::new(),
            name: "payments".to_string(),
            project_type: ProjectType::Outgoing,
            config: Json(ProjectConfig::default()),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    fn endpoint(project_id: ProjectId, status: EndpointStatus) -> Endpoint {
        let now = Utc::now();
        Endpoint {
            id: EndpointId::new(),
            project_id,
            name: "orders".to_string(),
            target_url: "https://example.com/hooks".to_string(),
            secrets: Json(vec![]),
            http_timeout_seconds: 30,
            rate_limit: 0,
            rate_limit_duration_seconds: 0,
            status,
            auth: None,
            alert_config: None,
            breaker_failure_count: 0,
            breaker_window_started_at: None,
            disabled_by_breaker: false,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    fn subscription(project_id: ProjectId, endpoint_id: EndpointId) -> Subscription {
        let now = Utc::now();
        Subscription {
            id: SubscriptionId::new(),
            sub_type: SubscriptionType::Api,
            project_id,
            name: "orders-sub".to_string(),
            endpoint_id: Some(endpoint_id),
            source_id: None,
            device_id: None,
            filter_config: Json(FilterConfig::default()),
            alert_config: None,
            retry_config: None,
            rate_limit_config: None,
            function: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    fn event(project_id: ProjectId, endpoints: Vec<EndpointId>) -> Event {
        let now = Utc::now();
        Event {
            id: EventId::new(),
            event_type: "user.created".to_string(),
            project_id,
            source_id: None,
            endpoints,
            headers: Json(HashMap::new()),
            raw: r#"{"id":42}"#.to_string(),
            data: Json(serde_json::json!({"id": 42})),
            url_query_params: None,
            idempotency_key: None,
            is_duplicate_event: false,
            acknowledged_at: Some(now),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    fn delivery(
        project: &Project,
        event: &Event,
        endpoint_id: EndpointId,
        status: DeliveryStatus,
    ) -> EventDelivery {
        let now = Utc::now();
        EventDelivery {
            id: DeliveryId::new(),
            project_id: project.id,
            event_id: event.id,
            endpoint_id,
            subscription_id: SubscriptionId::new(),
            device_id: None,
            headers: Json(HashMap::new()),
            url_query_params: None,
            idempotency_key: None,
            event_type: event.event_type.clone(),
            status,
            metadata: Json(DeliveryMetadata {
                data: event.data.0.clone(),
                raw: event.raw.clone(),
                strategy: StrategyKind::Linear,
                next_send_time: now,
                num_trials: 3,
                interval_seconds: 30,
                retry_limit: 3,
            }),
            description: String::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    struct Fixture {
        store: Arc<MockDeliveryStore>,
        queue: Arc<MemoryWorkQueue>,
        service: ReplayService,
        project: Project,
    }

    async fn setup() -> Fixture {
        let store = Arc::new(MockDeliveryStore::new());
        let queue = Arc::new(MemoryWorkQueue::new());
        let planner = Arc::new(FanoutPlanner::new(store.clone(), queue.clone()));
        let service = ReplayService::new(store.clone(), queue.clone(), planner);
        let project = project();
        store.insert_project(project.clone()).await;
        Fixture { store, queue, service, project }
    }

    #[tokio::test]
    async fn replay_uses_current_subscriptions() {
        let f = setup().await;
        let ep = endpoint(f.project.id, EndpointStatus::Active);
        f.store.insert_endpoint(ep.clone()).await;
        f.store.insert_subscription(subscription(f.project.id, ep.id)).await;

        let ev = event(f.project.id, vec![ep.id]);
        f.store.insert_event(ev.clone()).await;

        let deliveries = f.service.replay_event(&f.project, ev.id).await.unwrap();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].endpoint_id, ep.id);
    }

    #[tokio::test]
    async fn replay_expands_broadcast_subscriptions() {
        let f = setup().await;
        let mut incoming = f.project.clone();
        incoming.project_type = ProjectType::Incoming;
        f.store.insert_project(incoming.clone()).await;

        let first = endpoint(incoming.id, EndpointStatus::Active);
        let second = endpoint(incoming.id, EndpointStatus::Active);
        f.store.insert_endpoint(first.clone()).await;
        f.store.insert_endpoint(second.clone()).await;

        let source_id = hookrelay_core::models::SourceId::new();
        let mut broadcast = subscription(incoming.id, first.id);
        broadcast.endpoint_id = None;
        broadcast.source_id = Some(source_id);
        f.store.insert_subscription(broadcast).await;

        let mut ev = event(incoming.id, vec![]);
        ev.source_id = Some(source_id);
        f.store.insert_event(ev.clone()).await;

        let deliveries = f.service.replay_event(&incoming, ev.id).await.unwrap();
        let mut delivered: Vec<_> = deliveries.iter().map(|d| d.endpoint_id).collect();
        delivered.sort();
        let mut expected = vec![first.id, second.id];
        expected.sort();
        assert_eq!(delivered, expected);
    }

    #[tokio::test]
    async fn replay_twice_creates_independent_sets() {
        let f = setup().await;
        let ep = endpoint(f.project.id, EndpointStatus::Active);
        f.store.insert_endpoint(ep.clone()).await;
        f.store.insert_subscription(subscription(f.project.id, ep.id)).await;
        let ev = event(f.project.id, vec![ep.id]);
        f.store.insert_event(ev.clone()).await;

        let first = f.service.replay_event(&f.project, ev.id).await.unwrap();
        let second = f.service.replay_event(&f.project, ev.id).await.unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_ne!(first[0].id, second[0].id);
        assert_eq!(f.store.deliveries.read().await.len(), 2);
    }

    #[tokio::test]
    async fn resend_requires_terminal_status() {
        let f = setup().await;
        let ep = endpoint(f.project.id, EndpointStatus::Active);
        f.store.insert_endpoint(ep.clone()).await;
        let ev = event(f.project.id, vec![ep.id]);
        f.store.insert_event(ev.clone()).await;

        let pending = delivery(&f.project, &ev, ep.id, DeliveryStatus::Processing);
        f.store.insert_delivery(pending.clone()).await;

        let result = f.service.resend_delivery(&f.project, pending.id).await;
        assert!(matches!(result, Err(CoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn resend_resets_trials_and_enqueues() {
        let f = setup().await;
        let ep = endpoint(f.project.id, EndpointStatus::Active);
        f.store.insert_endpoint(ep.clone()).await;
        let ev = event(f.project.id, vec![ep.id]);
        f.store.insert_event(ev.clone()).await;

        let failed = delivery(&f.project, &ev, ep.id, DeliveryStatus::Failure);
        f.store.insert_delivery(failed.clone()).await;

        let reset = f.service.resend_delivery(&f.project, failed.id).await.unwrap();
        assert_eq!(reset.status, DeliveryStatus::Scheduled);
        assert_eq!(reset.metadata.0.num_trials, 0);
        assert_eq!(f.queue.len().await, 1);
    }

    #[tokio::test]
    async fn force_resend_refuses_inactive_endpoint() {
        let f = setup().await;
        let ep = endpoint(f.project.id, EndpointStatus::Inactive);
        f.store.insert_endpoint(ep.clone()).await;
        let ev = event(f.project.id, vec![ep.id]);
        f.store.insert_event(ev.clone()).await;

        let discarded = delivery(&f.project, &ev, ep.id, DeliveryStatus::Discarded);
        f.store.insert_delivery(discarded.clone()).await;

        let summary = f.service.force_resend(&f.project, &[discarded.id]).await.unwrap();
        assert_eq!(summary, BatchSummary { successes: 0, failures: 1 });
        assert_eq!(
            f.store.delivery_status(discarded.id).await,
            Some(DeliveryStatus::Discarded)
        );
    }

    #[tokio::test]
    async fn force_resend_revives_discarded_after_reactivation() {
        let f = setup().await;
        let ep = endpoint(f.project.id, EndpointStatus::Active);
        f.store.insert_endpoint(ep.clone()).await;
        let ev = event(f.project.id, vec![ep.id]);
        f.store.insert_event(ev.clone()).await;

        let discarded = delivery(&f.project, &ev, ep.id, DeliveryStatus::Discarded);
        f.store.insert_delivery(discarded.clone()).await;

        let summary = f.service.force_resend(&f.project, &[discarded.id]).await.unwrap();
        assert_eq!(summary, BatchSummary { successes: 1, failures: 0 });
        assert_eq!(
            f.store.delivery_status(discarded.id).await,
            Some(DeliveryStatus::Scheduled)
        );
        assert_eq!(f.queue.len().await, 1);
    }

    #[tokio::test]
    async fn batch_replay_enqueues_one_job_per_event() {
        let f = setup().await;
        let ep = endpoint(f.project.id, EndpointStatus::Active);
        f.store.insert_endpoint(ep.clone()).await;
        for _ in 0..5 {
            f.store.insert_event(event(f.project.id, vec![ep.id])).await;
        }

        let summary =
            f.service.batch_replay(&f.project, &ListFilter::default()).await.unwrap();
        assert_eq!(summary.successes, 5);
        assert_eq!(summary.failures, 0);
        assert_eq!(f.queue.len().await, 5);
    }

    #[tokio::test]
    async fn batch_retry_counts_non_terminal_as_failures() {
        let f = setup().await;
        let ep = endpoint(f.project.id, EndpointStatus::Active);
        f.store.insert_endpoint(ep.clone()).await;
        let ev = event(f.project.id, vec![ep.id]);
        f.store.insert_event(ev.clone()).await;

        f.store.insert_delivery(delivery(&f.project, &ev, ep.id, DeliveryStatus::Failure)).await;
        f.store.insert_delivery(delivery(&f.project, &ev, ep.id, DeliveryStatus::Processing)).await;

        let summary = f.service.batch_retry(&f.project, &ListFilter::default()).await.unwrap();
        assert_eq!(summary.successes, 1);
        assert_eq!(summary.failures, 1);
    }
}
