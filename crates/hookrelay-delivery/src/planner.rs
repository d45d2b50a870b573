//! Event fan-out planning.
//!
//! Expands one ingested event into N event deliveries: idempotency check,
//! candidate subscription resolution, filter evaluation, optional
//! auto-subscribe, transactional persistence, and ordered enqueueing of
//! delivery jobs.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use tracing::{debug, info};

use hookrelay_core::{
    error::{CoreError, Result},
    filter,
    models::{
        DeliveryId, DeliveryMetadata, EndpointId, Event, EventDelivery, EventId, FilterConfig,
        Project, ProjectId, ProjectType, SourceId, StrategyConfig, Subscription, SubscriptionId,
        SubscriptionType,
    },
    queue::{QueueName, TaskName, WorkQueue},
};

use crate::storage::DeliveryStore;

/// Default deduplication window for idempotency keys: 24 hours.
pub const DEFAULT_DEDUP_WINDOW: chrono::Duration = chrono::Duration::hours(24);

/// Raw event handed to the planner by the ingest surface.
#[derive(Debug, Clone)]
pub struct RawEvent {
    /// Producer-declared event type.
    pub event_type: String,
    /// Explicit endpoint targets (outgoing projects). Empty means every
    /// endpoint in the project.
    pub endpoint_ids: Vec<EndpointId>,
    /// Ingest source (incoming projects).
    pub source_id: Option<SourceId>,
    /// Canonicalised JSON body.
    pub data: serde_json::Value,
    /// Body exactly as received.
    pub raw: String,
    /// Headers captured at ingest, custom headers already merged.
    pub headers: HashMap<String, String>,
    /// Query parameters captured at ingest.
    pub url_query_params: Option<String>,
    /// Client-supplied deduplication key.
    pub idempotency_key: Option<String>,
    /// Synthesize a default subscription for unmatched target endpoints.
    pub create_subscription: bool,
    /// Explicit delivery delay requested by the producer.
    pub delay: Duration,
}

/// Queue payload for one delivery job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryJobPayload {
    /// Project owning the delivery.
    pub project_id: ProjectId,
    /// Delivery to dispatch.
    pub delivery_id: DeliveryId,
}

/// Queue payload for one search-index job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexJobPayload {
    /// Project owning the event.
    pub project_id: ProjectId,
    /// Event to mirror into the search table.
    pub event_id: EventId,
}

/// Outcome of planning one event.
#[derive(Debug, Clone)]
pub struct FanoutResult {
    /// The persisted event.
    pub event: Event,
    /// Deliveries created and enqueued, ordered by endpoint id.
    pub deliveries: Vec<EventDelivery>,
}

/// Plans fan-outs: one event in, N enqueued deliveries out.
pub struct FanoutPlanner {
    store: Arc<dyn DeliveryStore>,
    queue: Arc<dyn WorkQueue>,
    dedup_window: chrono::Duration,
}

impl FanoutPlanner {
    /// Creates a planner with the default dedup window.
    pub fn new(store: Arc<dyn DeliveryStore>, queue: Arc<dyn WorkQueue>) -> Self {
        Self::with_dedup_window(store, queue, DEFAULT_DEDUP_WINDOW)
    }

    /// Creates a planner with an explicit dedup window.
    pub fn with_dedup_window(
        store: Arc<dyn DeliveryStore>,
        queue: Arc<dyn WorkQueue>,
        dedup_window: chrono::Duration,
    ) -> Self {
        Self { store, queue, dedup_window }
    }

    /// Plans one raw event: persists it and enqueues its deliveries.
    ///
    /// Duplicates (same project and idempotency key inside the dedup
    /// window) persist with `is_duplicate_event = true` and produce zero
    /// deliveries.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for malformed input and storage errors
    /// otherwise; nothing is enqueued when persistence fails.
    pub async fn plan(&self, project: &Project, raw: RawEvent) -> Result<FanoutResult> {
        if raw.event_type.is_empty() {
            return Err(CoreError::validation("event_type is required"));
        }

        let now = Utc::now();

        // Idempotency gate: a prior non-duplicate event with the same key
        // claims the fan-out; this one is persisted as a duplicate marker.
        if let Some(key) = raw.idempotency_key.as_deref().filter(|k| !k.is_empty()) {
            let window_start = now - self.dedup_window;
            if let Some(original) = self
                .store
                .find_first_with_idempotency_key(project.id, key, window_start)
                .await?
            {
                info!(
                    project_id = %project.id,
                    original_event_id = %original,
                    idempotency_key = key,
                    "duplicate event, skipping fan-out"
                );
                let event = build_event(project.id, &raw, Vec::new(), true);
                self.store.create_event(&event).await?;
                self.store.acknowledge_event(event.id).await?;
                self.enqueue_index_job(project.id, event.id).await?;
                return Ok(FanoutResult { event, deliveries: Vec::new() });
            }
        }

        // Resolve candidate subscriptions by project ingest model.
        let candidates = match project.project_type {
            ProjectType::Outgoing => {
                let endpoint_ids = if raw.endpoint_ids.is_empty() {
                    self.store.project_endpoint_ids(project.id).await?
                } else {
                    raw.endpoint_ids.clone()
                };
                self.store.subscriptions_by_endpoints(project.id, &endpoint_ids).await?
            },
            ProjectType::Incoming => {
                let source_id = raw.source_id.ok_or_else(|| {
                    CoreError::validation("incoming projects require a source_id")
                })?;
                self.store.subscriptions_by_source(project.id, source_id).await?
            },
        };

        let mut matched: Vec<Subscription> = candidates
            .into_iter()
            .filter(|subscription| subscription_matches(subscription, &raw))
            .collect();

        // Auto-subscribe: target endpoints with no match get a default
        // match-all subscription when the producer asked for one.
        if raw.create_subscription && project.project_type == ProjectType::Outgoing {
            for endpoint_id in &raw.endpoint_ids {
                if matched.iter().any(|s| s.endpoint_id == Some(*endpoint_id)) {
                    continue;
                }
                let subscription = default_subscription(project.id, *endpoint_id, raw.source_id);
                self.store.create_subscription(&subscription).await?;
                debug!(
                    endpoint_id = %endpoint_id,
                    subscription_id = %subscription.id,
                    "auto-created subscription"
                );
                matched.push(subscription);
            }
        }

        // One delivery per (subscription, endpoint); broadcast
        // subscriptions expand to every endpoint in the project.
        let mut pairs: Vec<(Subscription, EndpointId)> = Vec::new();
        for subscription in matched {
            match subscription.endpoint_id {
                Some(endpoint_id) => pairs.push((subscription, endpoint_id)),
                None if subscription.device_id.is_none() => {
                    for endpoint_id in self.store.project_endpoint_ids(project.id).await? {
                        pairs.push((subscription.clone(), endpoint_id));
                    }
                },
                // CLI device streams are delivered over their own channel.
                None => {},
            }
        }

        // Deterministic downstream ordering: deliveries enqueue by
        // endpoint id.
        pairs.sort_by_key(|(_, endpoint_id)| *endpoint_id);
        pairs.dedup_by_key(|(subscription, endpoint_id)| (subscription.id, *endpoint_id));

        let mut endpoints: Vec<EndpointId> =
            pairs.iter().map(|(_, endpoint_id)| *endpoint_id).collect();
        endpoints.dedup();

        let event = build_event(project.id, &raw, endpoints, false);
        self.store.create_event(&event).await?;

        let deliveries: Vec<EventDelivery> = pairs
            .iter()
            .map(|(subscription, endpoint_id)| {
                build_delivery(project, &event, subscription, *endpoint_id)
            })
            .collect();
        self.store.create_deliveries(&deliveries).await?;
        self.store.acknowledge_event(event.id).await?;

        for delivery in &deliveries {
            self.queue
                .enqueue(
                    QueueName::Event,
                    TaskName::EventProcessor,
                    serde_json::to_value(DeliveryJobPayload {
                        project_id: project.id,
                        delivery_id: delivery.id,
                    })
                    .map_err(|e| CoreError::validation(e.to_string()))?,
                    Some(delivery.id),
                    raw.delay,
                )
                .await?;
        }
        self.enqueue_index_job(project.id, event.id).await?;

        info!(
            project_id = %project.id,
            event_id = %event.id,
            deliveries = deliveries.len(),
            "event fanned out"
        );

        Ok(FanoutResult { event, deliveries })
    }

    /// Creates fresh deliveries for an existing event against current
    /// subscriptions, then enqueues them.
    ///
    /// This is the replay path: no idempotency check, no new event row,
    /// no deduplication against earlier fan-outs.
    ///
    /// # Errors
    ///
    /// Returns storage errors; nothing is enqueued when persistence fails.
    pub async fn fanout_existing_event(
        &self,
        project: &Project,
        event: &Event,
        delay: Duration,
    ) -> Result<Vec<EventDelivery>> {
        let candidates = match project.project_type {
            ProjectType::Outgoing => {
                let endpoint_ids = if event.endpoints.is_empty() {
                    self.store.project_endpoint_ids(project.id).await?
                } else {
                    event.endpoints.clone()
                };
                self.store.subscriptions_by_endpoints(project.id, &endpoint_ids).await?
            },
            ProjectType::Incoming => match event.source_id {
                Some(source_id) => {
                    self.store.subscriptions_by_source(project.id, source_id).await?
                },
                None => Vec::new(),
            },
        };

        let matched: Vec<Subscription> = candidates
            .into_iter()
            .filter(|subscription| {
                let config = &subscription.filter_config.0;
                filter::matches_event_type(&event.event_type, &config.event_types)
                    && matches_payload(config, &event.data.0, &event.headers.0)
            })
            .collect();

        // Broadcast subscriptions expand to every endpoint in the project,
        // exactly as they do during the original fan-out.
        let mut pairs: Vec<(Subscription, EndpointId)> = Vec::new();
        for subscription in matched {
            match subscription.endpoint_id {
                Some(endpoint_id) => pairs.push((subscription, endpoint_id)),
                None if subscription.device_id.is_none() => {
                    for endpoint_id in self.store.project_endpoint_ids(project.id).await? {
                        pairs.push((subscription.clone(), endpoint_id));
                    }
                },
                // CLI device streams are delivered over their own channel.
                None => {},
            }
        }
        pairs.sort_by_key(|(_, endpoint_id)| *endpoint_id);

        let deliveries: Vec<EventDelivery> = pairs
            .iter()
            .map(|(subscription, endpoint_id)| {
                build_delivery(project, event, subscription, *endpoint_id)
            })
            .collect();
        self.store.create_deliveries(&deliveries).await?;

        for delivery in &deliveries {
            self.queue
                .enqueue(
                    QueueName::Event,
                    TaskName::EventProcessor,
                    serde_json::to_value(DeliveryJobPayload {
                        project_id: project.id,
                        delivery_id: delivery.id,
                    })
                    .map_err(|e| CoreError::validation(e.to_string()))?,
                    Some(delivery.id),
                    delay,
                )
                .await?;
        }

        Ok(deliveries)
    }

    async fn enqueue_index_job(&self, project_id: ProjectId, event_id: EventId) -> Result<()> {
        self.queue
            .enqueue(
                QueueName::SearchIndex,
                TaskName::IndexDocument,
                serde_json::to_value(IndexJobPayload { project_id, event_id })
                    .map_err(|e| CoreError::validation(e.to_string()))?,
                None,
                Duration::ZERO,
            )
            .await?;
        Ok(())
    }
}

fn subscription_matches(subscription: &Subscription, raw: &RawEvent) -> bool {
    let config = &subscription.filter_config.0;
    filter::matches_event_type(&raw.event_type, &config.event_types)
        && matches_payload(config, &raw.data, &raw.headers)
}

fn matches_payload(
    config: &FilterConfig,
    data: &serde_json::Value,
    headers: &HashMap<String, String>,
) -> bool {
    let headers_value = serde_json::to_value(headers).unwrap_or_default();
    filter::matches_filter(data, &config.filter.body, config.filter.is_flattened)
        && filter::matches_filter(&headers_value, &config.filter.headers, config.filter.is_flattened)
}

fn build_event(
    project_id: ProjectId,
    raw: &RawEvent,
    endpoints: Vec<EndpointId>,
    is_duplicate: bool,
) -> Event {
    let now = Utc::now();
    Event {
        id: EventId::new(),
        event_type: raw.event_type.clone(),
        project_id,
        source_id: raw.source_id,
        endpoints,
        headers: Json(raw.headers.clone()),
        raw: raw.raw.clone(),
        data: Json(raw.data.clone()),
        url_query_params: raw.url_query_params.clone(),
        idempotency_key: raw.idempotency_key.clone(),
        is_duplicate_event: is_duplicate,
        acknowledged_at: None,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    }
}

fn build_delivery(
    project: &Project,
    event: &Event,
    subscription: &Subscription,
    endpoint_id: EndpointId,
) -> EventDelivery {
    let now = Utc::now();
    // Policy snapshot: subscription override wins over project defaults.
    let strategy: StrategyConfig = subscription
        .retry_config
        .as_ref()
        .map_or(project.config.0.strategy, |config| config.0);

    EventDelivery {
        id: DeliveryId::new(),
        project_id: project.id,
        event_id: event.id,
        endpoint_id,
        subscription_id: subscription.id,
        device_id: subscription.device_id,
        headers: event.headers.clone(),
        url_query_params: event.url_query_params.clone(),
        idempotency_key: event.idempotency_key.clone(),
        event_type: event.event_type.clone(),
        status: hookrelay_core::models::DeliveryStatus::Scheduled,
        metadata: Json(DeliveryMetadata {
            data: event.data.0.clone(),
            raw: event.raw.clone(),
            strategy: strategy.kind,
            next_send_time: now,
            num_trials: 0,
            interval_seconds: strategy.duration_seconds,
            retry_limit: strategy.retry_limit,
        }),
        description: String::new(),
        created_at: now,
        updated_at: now,
        deleted_at: None,
    }
}

fn default_subscription(
    project_id: ProjectId,
    endpoint_id: EndpointId,
    source_id: Option<SourceId>,
) -> Subscription {
    let now = Utc::now();
    Subscription {
        id: SubscriptionId::new(),
        sub_type: SubscriptionType::Api,
        project_id,
        name: format!("auto-{endpoint_id}"),
        endpoint_id: Some(endpoint_id),
        source_id,
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

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use hookrelay_core::models::{
        EndpointStatus, ProjectConfig, StrategyKind, SubscriptionFilter,
    };
    use hookrelay_core::queue::MemoryWorkQueue;

    use super::*;
    use crate::storage::mock::MockDeliveryStore;

    fn outgoing_project() -> Project {
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

    fn endpoint(project_id: ProjectId) -> hookrelay_core::models::Endpoint {
        let now = Utc::now();
        hookrelay_core::models::Endpoint {
            id: EndpointId::new(),
            project_id,
            name: "orders".to_string(),
            target_url: "https://example.com/hooks".to_string(),
            secrets: Json(vec![]),
            http_timeout_seconds: 30,
            rate_limit: 0,
            rate_limit_duration_seconds: 0,
            status: EndpointStatus::Active,
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

    fn subscription(
        project_id: ProjectId,
        endpoint_id: EndpointId,
        filter_config: FilterConfig,
    ) -> Subscription {
        let now = Utc::now();
        Subscription {
            id: SubscriptionId::new(),
            sub_type: SubscriptionType::Api,
            project_id,
            name: "orders-sub".to_string(),
            endpoint_id: Some(endpoint_id),
            source_id: None,
            device_id: None,
            filter_config: Json(filter_config),
            alert_config: None,
            retry_config: None,
            rate_limit_config: None,
            function: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    fn raw_event(endpoint_ids: Vec<EndpointId>) -> RawEvent {
        RawEvent {
            event_type: "user.created".to_string(),
            endpoint_ids,
            source_id: None,
            data: json!({"id": 42}),
            raw: r#"{"id":42}"#.to_string(),
            headers: HashMap::new(),
            url_query_params: None,
            idempotency_key: None,
            create_subscription: false,
            delay: Duration::ZERO,
        }
    }

    async fn setup() -> (Arc<MockDeliveryStore>, Arc<MemoryWorkQueue>, FanoutPlanner, Project) {
        let store = Arc::new(MockDeliveryStore::new());
        let queue = Arc::new(MemoryWorkQueue::new());
        let planner = FanoutPlanner::new(store.clone(), queue.clone());
        let project = outgoing_project();
        store.insert_project(project.clone()).await;
        (store, queue, planner, project)
    }

    #[tokio::test]
    async fn matching_subscription_produces_one_delivery() {
        let (store, queue, planner, project) = setup().await;
        let ep = endpoint(project.id);
        store.insert_endpoint(ep.clone()).await;
        store.insert_subscription(subscription(project.id, ep.id, FilterConfig::default())).await;

        let result = planner.plan(&project, raw_event(vec![ep.id])).await.unwrap();

        assert_eq!(result.deliveries.len(), 1);
        assert_eq!(result.deliveries[0].endpoint_id, ep.id);
        assert_eq!(result.deliveries[0].metadata.0.retry_limit, 3);
        assert_eq!(result.deliveries[0].metadata.0.strategy, StrategyKind::Linear);
        assert!(!result.event.is_duplicate_event);
        // One delivery job plus one search-index job.
        assert_eq!(queue.len().await, 2);
    }

    #[tokio::test]
    async fn filter_mismatch_produces_zero_deliveries() {
        let (store, queue, planner, project) = setup().await;
        let ep = endpoint(project.id);
        store.insert_endpoint(ep.clone()).await;

        let filter_config = FilterConfig {
            event_types: vec!["*".to_string()],
            filter: SubscriptionFilter {
                headers: json!({}),
                body: json!({"data.amount": {"$gte": 100}}),
                is_flattened: true,
            },
        };
        store.insert_subscription(subscription(project.id, ep.id, filter_config)).await;

        let mut raw = raw_event(vec![ep.id]);
        raw.data = json!({"data": {"amount": 50}});

        let result = planner.plan(&project, raw).await.unwrap();
        assert!(result.deliveries.is_empty());
        // Only the search-index job.
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn event_type_mismatch_drops_candidate() {
        let (store, _queue, planner, project) = setup().await;
        let ep = endpoint(project.id);
        store.insert_endpoint(ep.clone()).await;
        let filter_config = FilterConfig {
            event_types: vec!["invoice.paid".to_string()],
            filter: SubscriptionFilter::default(),
        };
        store.insert_subscription(subscription(project.id, ep.id, filter_config)).await;

        let result = planner.plan(&project, raw_event(vec![ep.id])).await.unwrap();
        assert!(result.deliveries.is_empty());
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_skips_fanout() {
        let (store, queue, planner, project) = setup().await;
        let ep = endpoint(project.id);
        store.insert_endpoint(ep.clone()).await;
        store.insert_subscription(subscription(project.id, ep.id, FilterConfig::default())).await;

        let mut first = raw_event(vec![ep.id]);
        first.idempotency_key = Some("abc-1".to_string());
        let first_result = planner.plan(&project, first).await.unwrap();
        assert_eq!(first_result.deliveries.len(), 1);

        let mut second = raw_event(vec![ep.id]);
        second.idempotency_key = Some("abc-1".to_string());
        let second_result = planner.plan(&project, second).await.unwrap();

        assert!(second_result.event.is_duplicate_event);
        assert!(second_result.deliveries.is_empty());

        // Exactly one non-duplicate carrier of the key.
        let events = store.events.read().await;
        let originals =
            events.values().filter(|e| !e.is_duplicate_event).count();
        assert_eq!(originals, 1);
        assert_eq!(events.len(), 2);
        drop(events);

        // Jobs: first fan-out delivery + 2 index jobs.
        assert_eq!(queue.len().await, 3);
    }

    #[tokio::test]
    async fn auto_subscribe_creates_default_subscription() {
        let (store, _queue, planner, project) = setup().await;
        let ep = endpoint(project.id);
        store.insert_endpoint(ep.clone()).await;

        let mut raw = raw_event(vec![ep.id]);
        raw.create_subscription = true;

        let result = planner.plan(&project, raw).await.unwrap();
        assert_eq!(result.deliveries.len(), 1);
        assert_eq!(store.subscriptions.read().await.len(), 1);
    }

    #[tokio::test]
    async fn deliveries_are_ordered_by_endpoint_id() {
        let (store, _queue, planner, project) = setup().await;
        let mut endpoints: Vec<_> = (0..5).map(|_| endpoint(project.id)).collect();
        for ep in &endpoints {
            store.insert_endpoint(ep.clone()).await;
            store
                .insert_subscription(subscription(project.id, ep.id, FilterConfig::default()))
                .await;
        }
        endpoints.sort_by_key(|e| e.id);

        let result = planner
            .plan(&project, raw_event(endpoints.iter().map(|e| e.id).collect()))
            .await
            .unwrap();

        let delivered: Vec<EndpointId> =
            result.deliveries.iter().map(|d| d.endpoint_id).collect();
        let mut sorted = delivered.clone();
        sorted.sort();
        assert_eq!(delivered, sorted);
        assert_eq!(delivered.len(), 5);
    }

    #[tokio::test]
    async fn empty_target_list_broadcasts_to_all_endpoints() {
        let (store, _queue, planner, project) = setup().await;
        for _ in 0..3 {
            let ep = endpoint(project.id);
            store.insert_endpoint(ep.clone()).await;
            store
                .insert_subscription(subscription(project.id, ep.id, FilterConfig::default()))
                .await;
        }

        let result = planner.plan(&project, raw_event(vec![])).await.unwrap();
        assert_eq!(result.deliveries.len(), 3);
    }

    #[tokio::test]
    async fn subscription_retry_override_is_snapshotted() {
        let (store, _queue, planner, project) = setup().await;
        let ep = endpoint(project.id);
        store.insert_endpoint(ep.clone()).await;

        let mut sub = subscription(project.id, ep.id, FilterConfig::default());
        sub.retry_config = Some(Json(StrategyConfig {
            kind: StrategyKind::Exponential,
            duration_seconds: 5,
            retry_limit: 7,
        }));
        store.insert_subscription(sub).await;

        let result = planner.plan(&project, raw_event(vec![ep.id])).await.unwrap();
        let metadata = &result.deliveries[0].metadata.0;
        assert_eq!(metadata.strategy, StrategyKind::Exponential);
        assert_eq!(metadata.interval_seconds, 5);
        assert_eq!(metadata.retry_limit, 7);
    }

    #[tokio::test]
    async fn incoming_project_requires_source() {
        let (_store, _queue, planner, _project) = setup().await;
        let mut project = outgoing_project();
        project.project_type = ProjectType::Incoming;

        let result = planner.plan(&project, raw_event(vec![])).await;
        assert!(matches!(result, Err(CoreError::Validation(_))));
    }

    #[tokio::test]
    async fn incoming_project_resolves_by_source() {
        let (store, _queue, planner, _ignored) = setup().await;
        let mut project = outgoing_project();
        project.project_type = ProjectType::Incoming;
        store.insert_project(project.clone()).await;

        let ep = endpoint(project.id);
        store.insert_endpoint(ep.clone()).await;
        let source_id = SourceId(Uuid::new_v4());
        let mut sub = subscription(project.id, ep.id, FilterConfig::default());
        sub.source_id = Some(source_id);
        store.insert_subscription(sub).await;

        let mut raw = raw_event(vec![]);
        raw.source_id = Some(source_id);

        let result = planner.plan(&project, raw).await.unwrap();
        assert_eq!(result.deliveries.len(), 1);
    }
}
