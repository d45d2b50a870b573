//! Storage abstraction for the delivery engine.
//!
//! A trait over every persistence operation the planner, dispatcher,
//! breaker, and replay service need. Production wires the Postgres
//! repositories from `hookrelay_core::storage`; tests use the in-memory
//! mock to drive delivery logic deterministically without a database.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use hookrelay_core::{
    error::{CoreError, Result},
    models::{
        DeliveryAttempt, DeliveryId, DeliveryMetadata, DeliveryStatus, Endpoint, EndpointId,
        EndpointStatus, Event, EventDelivery, EventId, Project, ProjectId, SourceId, Subscription,
        SubscriptionId,
    },
    storage::{ListFilter, Storage},
};

/// Persistence operations required by the delivery engine.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    // Reads (fronted by the dispatcher's TTL cache).

    /// Loads a project.
    async fn find_project(&self, id: ProjectId) -> Result<Option<Project>>;

    /// Loads an endpoint.
    async fn find_endpoint(&self, id: EndpointId) -> Result<Option<Endpoint>>;

    /// Loads a subscription within a project.
    async fn find_subscription(
        &self,
        project_id: ProjectId,
        id: SubscriptionId,
    ) -> Result<Option<Subscription>>;

    /// Loads an event within a project.
    async fn find_event(&self, project_id: ProjectId, id: EventId) -> Result<Option<Event>>;

    /// Loads a delivery within a project.
    async fn find_delivery(
        &self,
        project_id: ProjectId,
        id: DeliveryId,
    ) -> Result<Option<EventDelivery>>;

    // Fan-out.

    /// The id of the non-duplicate event holding this idempotency key
    /// inside the dedup window, when one exists.
    async fn find_first_with_idempotency_key(
        &self,
        project_id: ProjectId,
        idempotency_key: &str,
        window_start: DateTime<Utc>,
    ) -> Result<Option<EventId>>;

    /// All endpoint ids of a project, ordered by id.
    async fn project_endpoint_ids(&self, project_id: ProjectId) -> Result<Vec<EndpointId>>;

    /// Candidate subscriptions bound to any of the given endpoints.
    async fn subscriptions_by_endpoints(
        &self,
        project_id: ProjectId,
        endpoint_ids: &[EndpointId],
    ) -> Result<Vec<Subscription>>;

    /// Candidate subscriptions bound to a source.
    async fn subscriptions_by_source(
        &self,
        project_id: ProjectId,
        source_id: SourceId,
    ) -> Result<Vec<Subscription>>;

    /// Persists an auto-created subscription.
    async fn create_subscription(&self, subscription: &Subscription) -> Result<()>;

    /// Persists an event and its endpoint junction rows atomically.
    async fn create_event(&self, event: &Event) -> Result<()>;

    /// Persists a batch of deliveries.
    async fn create_deliveries(&self, deliveries: &[EventDelivery]) -> Result<()>;

    /// Marks fan-out complete for an event.
    async fn acknowledge_event(&self, id: EventId) -> Result<()>;

    /// Mirrors an event into the tokenized search table.
    async fn index_event(&self, id: EventId) -> Result<()>;

    // Dispatch.

    /// Claims a delivery for an attempt (`scheduled`/`retry` ->
    /// `processing`). `None` means another claim won; the caller drops its
    /// job.
    async fn claim_delivery(&self, id: DeliveryId) -> Result<Option<EventDelivery>>;

    /// Appends an attempt and updates the delivery in one transaction.
    ///
    /// Keeps the attempt-row count equal to `metadata.num_trials` under
    /// every failure mode.
    async fn record_attempt(
        &self,
        attempt: &DeliveryAttempt,
        status: DeliveryStatus,
        metadata: &DeliveryMetadata,
        description: &str,
    ) -> Result<()>;

    /// Moves a delivery to a new status without recording an attempt
    /// (pre-check discards, rate-limit reschedules).
    async fn update_delivery_status(
        &self,
        id: DeliveryId,
        status: DeliveryStatus,
        description: &str,
    ) -> Result<()>;

    // Breaker state.

    /// Advances the persisted breaker counter, returning the new value.
    async fn advance_breaker(&self, id: EndpointId, window_floor: DateTime<Utc>) -> Result<i32>;

    /// Resets the breaker; returns whether the endpoint was reactivated.
    async fn reset_breaker(&self, id: EndpointId) -> Result<bool>;

    /// Disables an endpoint on the breaker's behalf.
    async fn disable_endpoint(&self, id: EndpointId) -> Result<()>;

    // Retention.

    /// Hard-deletes a project's events older than `before` that have no
    /// remaining deliveries. Returns the number removed.
    async fn sweep_events(&self, project_id: ProjectId, before: DateTime<Utc>) -> Result<u64>;

    // Replay.

    /// Resets deliveries for resend and purges their pending queue jobs in
    /// one transaction. Returns the refreshed rows.
    async fn reset_deliveries_for_resend(&self, ids: &[DeliveryId])
        -> Result<Vec<EventDelivery>>;

    /// One ascending page of event ids matching a filter.
    async fn event_ids_page(
        &self,
        project_id: ProjectId,
        filter: &ListFilter,
        after: Option<EventId>,
        limit: i64,
    ) -> Result<Vec<EventId>>;

    /// One ascending page of delivery ids matching a filter.
    async fn delivery_ids_page(
        &self,
        project_id: ProjectId,
        filter: &ListFilter,
        after: Option<DeliveryId>,
        limit: i64,
    ) -> Result<Vec<DeliveryId>>;
}

/// Production store backed by the Postgres repositories.
pub struct PostgresDeliveryStore {
    storage: Arc<Storage>,
}

impl PostgresDeliveryStore {
    /// Wraps the repository aggregate.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl DeliveryStore for PostgresDeliveryStore {
    async fn find_project(&self, id: ProjectId) -> Result<Option<Project>> {
        self.storage.projects.find_by_id(id).await
    }

    async fn find_endpoint(&self, id: EndpointId) -> Result<Option<Endpoint>> {
        self.storage.endpoints.find_by_id(id).await
    }

    async fn find_subscription(
        &self,
        project_id: ProjectId,
        id: SubscriptionId,
    ) -> Result<Option<Subscription>> {
        self.storage.subscriptions.find_by_id(project_id, id).await
    }

    async fn find_event(&self, project_id: ProjectId, id: EventId) -> Result<Option<Event>> {
        self.storage.events.find_by_id(project_id, id).await
    }

    async fn find_delivery(
        &self,
        project_id: ProjectId,
        id: DeliveryId,
    ) -> Result<Option<EventDelivery>> {
        self.storage.event_deliveries.find_by_id(project_id, id).await
    }

    async fn find_first_with_idempotency_key(
        &self,
        project_id: ProjectId,
        idempotency_key: &str,
        window_start: DateTime<Utc>,
    ) -> Result<Option<EventId>> {
        self.storage
            .events
            .find_first_with_idempotency_key(project_id, idempotency_key, window_start)
            .await
    }

    async fn project_endpoint_ids(&self, project_id: ProjectId) -> Result<Vec<EndpointId>> {
        self.storage.endpoints.find_ids_by_project(project_id).await
    }

    async fn subscriptions_by_endpoints(
        &self,
        project_id: ProjectId,
        endpoint_ids: &[EndpointId],
    ) -> Result<Vec<Subscription>> {
        self.storage.subscriptions.find_by_endpoint_ids(project_id, endpoint_ids).await
    }

    async fn subscriptions_by_source(
        &self,
        project_id: ProjectId,
        source_id: SourceId,
    ) -> Result<Vec<Subscription>> {
        self.storage.subscriptions.find_by_source_id(project_id, source_id).await
    }

    async fn create_subscription(&self, subscription: &Subscription) -> Result<()> {
        self.storage.subscriptions.create(subscription).await
    }

    async fn create_event(&self, event: &Event) -> Result<()> {
        self.storage.events.create_with_endpoints(event).await
    }

    async fn create_deliveries(&self, deliveries: &[EventDelivery]) -> Result<()> {
        self.storage.event_deliveries.create_many(deliveries).await
    }

    async fn acknowledge_event(&self, id: EventId) -> Result<()> {
        self.storage.events.acknowledge(id).await
    }

    async fn index_event(&self, id: EventId) -> Result<()> {
        self.storage.events.index_event(id).await
    }

    async fn claim_delivery(&self, id: DeliveryId) -> Result<Option<EventDelivery>> {
        self.storage.event_deliveries.claim_for_processing(id).await
    }

    async fn record_attempt(
        &self,
        attempt: &DeliveryAttempt,
        status: DeliveryStatus,
        metadata: &DeliveryMetadata,
        description: &str,
    ) -> Result<()> {
        let pool = self.storage.event_deliveries.pool();
        let mut tx = pool.begin().await?;

        self.storage.delivery_attempts.create_in_tx(&mut tx, attempt).await?;
        self.storage
            .event_deliveries
            .update_outcome_in_tx(&mut tx, attempt.delivery_id, status, metadata, description)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn update_delivery_status(
        &self,
        id: DeliveryId,
        status: DeliveryStatus,
        description: &str,
    ) -> Result<()> {
        self.storage.event_deliveries.update_status(id, status, description).await
    }

    async fn advance_breaker(&self, id: EndpointId, window_floor: DateTime<Utc>) -> Result<i32> {
        self.storage.endpoints.advance_breaker(id, window_floor).await
    }

    async fn reset_breaker(&self, id: EndpointId) -> Result<bool> {
        self.storage.endpoints.reset_breaker(id).await
    }

    async fn disable_endpoint(&self, id: EndpointId) -> Result<()> {
        self.storage.endpoints.update_status(id, EndpointStatus::Inactive, true).await
    }

    async fn sweep_events(&self, project_id: ProjectId, before: DateTime<Utc>) -> Result<u64> {
        self.storage.events.hard_delete_project_events(project_id, before).await
    }

    async fn reset_deliveries_for_resend(
        &self,
        ids: &[DeliveryId],
    ) -> Result<Vec<EventDelivery>> {
        let pool = self.storage.event_deliveries.pool();
        let mut tx = pool.begin().await?;

        // Stale retry jobs vanish in the same transaction as the reset so
        // a crash can never leave a job pointing at a reset delivery.
        sqlx::query("DELETE FROM queue_jobs WHERE delivery_id = ANY($1)")
            .bind(ids)
            .execute(&mut *tx)
            .await
            .map_err(CoreError::from)?;

        let mut reset = Vec::with_capacity(ids.len());
        for id in ids {
            reset.push(
                self.storage.event_deliveries.reset_for_resend_in_tx(&mut tx, *id).await?,
            );
        }

        tx.commit().await?;
        Ok(reset)
    }

    async fn event_ids_page(
        &self,
        project_id: ProjectId,
        filter: &ListFilter,
        after: Option<EventId>,
        limit: i64,
    ) -> Result<Vec<EventId>> {
        self.storage.events.list_ids_ascending(project_id, filter, after, limit).await
    }

    async fn delivery_ids_page(
        &self,
        project_id: ProjectId,
        filter: &ListFilter,
        after: Option<DeliveryId>,
        limit: i64,
    ) -> Result<Vec<DeliveryId>> {
        self.storage.event_deliveries.list_ids_ascending(project_id, filter, after, limit).await
    }
}

pub mod mock {
    //! In-memory store for testing delivery logic without a database.

    use std::collections::HashMap;

    use tokio::sync::RwLock;

    use super::{
        async_trait, CoreError, DateTime, DeliveryAttempt, DeliveryId, DeliveryMetadata,
        DeliveryStatus, DeliveryStore, Endpoint, EndpointId, EndpointStatus, Event, EventDelivery,
        EventId, ListFilter, Project, ProjectId, Result, SourceId, Subscription, SubscriptionId,
        Utc,
    };

    /// Mock store holding everything in process memory.
    ///
    /// State is reachable from tests for seeding and verification.
    #[derive(Default)]
    pub struct MockDeliveryStore {
        /// Seeded projects by id.
        pub projects: RwLock<HashMap<ProjectId, Project>>,
        /// Seeded endpoints by id.
        pub endpoints: RwLock<HashMap<EndpointId, Endpoint>>,
        /// Seeded subscriptions by id.
        pub subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
        /// Events written by the planner or seeded by tests.
        pub events: RwLock<HashMap<EventId, Event>>,
        /// Deliveries written by the planner or seeded by tests.
        pub deliveries: RwLock<HashMap<DeliveryId, EventDelivery>>,
        /// Attempts appended by the dispatcher.
        pub attempts: RwLock<Vec<DeliveryAttempt>>,
        /// Event ids mirrored into the search table.
        pub indexed_events: RwLock<Vec<EventId>>,
    }

    impl MockDeliveryStore {
        /// Creates an empty mock store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Seeds a project.
        pub async fn insert_project(&self, project: Project) {
            self.projects.write().await.insert(project.id, project);
        }

        /// Seeds an endpoint.
        pub async fn insert_endpoint(&self, endpoint: Endpoint) {
            self.endpoints.write().await.insert(endpoint.id, endpoint);
        }

        /// Seeds a subscription.
        pub async fn insert_subscription(&self, subscription: Subscription) {
            self.subscriptions.write().await.insert(subscription.id, subscription);
        }

        /// Seeds a delivery.
        pub async fn insert_delivery(&self, delivery: EventDelivery) {
            self.deliveries.write().await.insert(delivery.id, delivery);
        }

        /// Seeds an event.
        pub async fn insert_event(&self, event: Event) {
            self.events.write().await.insert(event.id, event);
        }

        /// Current status of a delivery.
        pub async fn delivery_status(&self, id: DeliveryId) -> Option<DeliveryStatus> {
            self.deliveries.read().await.get(&id).map(|d| d.status)
        }

        /// All recorded attempts for a delivery, oldest first.
        pub async fn attempts_for(&self, id: DeliveryId) -> Vec<DeliveryAttempt> {
            self.attempts.read().await.iter().filter(|a| a.delivery_id == id).cloned().collect()
        }
    }

    #[async_trait]
    impl DeliveryStore for MockDeliveryStore {
        async fn find_project(&self, id: ProjectId) -> Result<Option<Project>> {
            Ok(self.projects.read().await.get(&id).cloned())
        }

        async fn find_endpoint(&self, id: EndpointId) -> Result<Option<Endpoint>> {
            Ok(self
                .endpoints
                .read()
                .await
                .get(&id)
                .filter(|e| e.deleted_at.is_none())
                .cloned())
        }

        async fn find_subscription(
            &self,
            project_id: ProjectId,
            id: SubscriptionId,
        ) -> Result<Option<Subscription>> {
            Ok(self
                .subscriptions
                .read()
                .await
                .get(&id)
                .filter(|s| s.project_id == project_id && s.deleted_at.is_none())
                .cloned())
        }

        async fn find_event(&self, project_id: ProjectId, id: EventId) -> Result<Option<Event>> {
            Ok(self
                .events
                .read()
                .await
                .get(&id)
                .filter(|e| e.project_id == project_id)
                .cloned())
        }

        async fn find_delivery(
            &self,
            project_id: ProjectId,
            id: DeliveryId,
        ) -> Result<Option<EventDelivery>> {
            Ok(self
                .deliveries
                .read()
                .await
                .get(&id)
                .filter(|d| d.project_id == project_id)
                .cloned())
        }

        async fn find_first_with_idempotency_key(
            &self,
            project_id: ProjectId,
            idempotency_key: &str,
            window_start: DateTime<Utc>,
        ) -> Result<Option<EventId>> {
            let events = self.events.read().await;
            let mut matches: Vec<&Event> = events
                .values()
                .filter(|e| {
                    e.project_id == project_id
                        && e.idempotency_key.as_deref() == Some(idempotency_key)
                        && !e.is_duplicate_event
                        && e.created_at >= window_start
                })
                .collect();
            matches.sort_by_key(|e| e.id);
            Ok(matches.first().map(|e| e.id))
        }

        async fn project_endpoint_ids(&self, project_id: ProjectId) -> Result<Vec<EndpointId>> {
            let endpoints = self.endpoints.read().await;
            let mut ids: Vec<EndpointId> = endpoints
                .values()
                .filter(|e| e.project_id == project_id && e.deleted_at.is_none())
                .map(|e| e.id)
                .collect();
            ids.sort();
            Ok(ids)
        }

        async fn subscriptions_by_endpoints(
            &self,
            project_id: ProjectId,
            endpoint_ids: &[EndpointId],
        ) -> Result<Vec<Subscription>> {
            let subscriptions = self.subscriptions.read().await;
            let mut found: Vec<Subscription> = subscriptions
                .values()
                .filter(|s| {
                    s.project_id == project_id
                        && s.deleted_at.is_none()
                        && s.endpoint_id.is_some_and(|id| endpoint_ids.contains(&id))
                })
                .cloned()
                .collect();
            found.sort_by_key(|s| s.id);
            Ok(found)
        }

        async fn subscriptions_by_source(
            &self,
            project_id: ProjectId,
            source_id: SourceId,
        ) -> Result<Vec<Subscription>> {
            let subscriptions = self.subscriptions.read().await;
            let mut found: Vec<Subscription> = subscriptions
                .values()
                .filter(|s| {
                    s.project_id == project_id
                        && s.deleted_at.is_none()
                        && s.source_id == Some(source_id)
                })
                .cloned()
                .collect();
            found.sort_by_key(|s| s.id);
            Ok(found)
        }

        async fn create_subscription(&self, subscription: &Subscription) -> Result<()> {
            hookrelay_core::filter::validate_filter(&subscription.filter_config.0.filter.body)?;
            self.subscriptions.write().await.insert(subscription.id, subscription.clone());
            Ok(())
        }

        async fn create_event(&self, event: &Event) -> Result<()> {
            self.events.write().await.insert(event.id, event.clone());
            Ok(())
        }

        async fn create_deliveries(&self, deliveries: &[EventDelivery]) -> Result<()> {
            let mut map = self.deliveries.write().await;
            for delivery in deliveries {
                map.insert(delivery.id, delivery.clone());
            }
            Ok(())
        }

        async fn acknowledge_event(&self, id: EventId) -> Result<()> {
            if let Some(event) = self.events.write().await.get_mut(&id) {
                event.acknowledged_at = Some(Utc::now());
            }
            Ok(())
        }

        async fn index_event(&self, id: EventId) -> Result<()> {
            self.indexed_events.write().await.push(id);
            Ok(())
        }

        async fn claim_delivery(&self, id: DeliveryId) -> Result<Option<EventDelivery>> {
            let mut deliveries = self.deliveries.write().await;
            match deliveries.get_mut(&id) {
                Some(delivery)
                    if matches!(
                        delivery.status,
                        DeliveryStatus::Scheduled | DeliveryStatus::Retry
                    ) =>
                {
                    delivery.status = DeliveryStatus::Processing;
                    Ok(Some(delivery.clone()))
                },
                _ => Ok(None),
            }
        }

        async fn record_attempt(
            &self,
            attempt: &DeliveryAttempt,
            status: DeliveryStatus,
            metadata: &DeliveryMetadata,
            description: &str,
        ) -> Result<()> {
            self.attempts.write().await.push(attempt.clone());
            let mut deliveries = self.deliveries.write().await;
            let delivery = deliveries
                .get_mut(&attempt.delivery_id)
                .ok_or_else(|| CoreError::not_found("delivery"))?;
            delivery.status = status;
            delivery.metadata = sqlx::types::Json(metadata.clone());
            delivery.description = description.to_string();
            Ok(())
        }

        async fn update_delivery_status(
            &self,
            id: DeliveryId,
            status: DeliveryStatus,
            description: &str,
        ) -> Result<()> {
            if let Some(delivery) = self.deliveries.write().await.get_mut(&id) {
                delivery.status = status;
                delivery.description = description.to_string();
            }
            Ok(())
        }

        async fn advance_breaker(
            &self,
            id: EndpointId,
            window_floor: DateTime<Utc>,
        ) -> Result<i32> {
            let mut endpoints = self.endpoints.write().await;
            let endpoint =
                endpoints.get_mut(&id).ok_or_else(|| CoreError::not_found("endpoint"))?;

            let stale = endpoint
                .breaker_window_started_at
                .is_none_or(|started| started < window_floor);
            if stale {
                endpoint.breaker_failure_count = 1;
                endpoint.breaker_window_started_at = Some(Utc::now());
            } else {
                endpoint.breaker_failure_count += 1;
            }
            Ok(endpoint.breaker_failure_count)
        }

        async fn reset_breaker(&self, id: EndpointId) -> Result<bool> {
            let mut endpoints = self.endpoints.write().await;
            let endpoint =
                endpoints.get_mut(&id).ok_or_else(|| CoreError::not_found("endpoint"))?;

            let reactivated = endpoint.disabled_by_breaker;
            endpoint.breaker_failure_count = 0;
            endpoint.breaker_window_started_at = None;
            if endpoint.disabled_by_breaker {
                endpoint.status = EndpointStatus::Active;
                endpoint.disabled_by_breaker = false;
            }
            Ok(reactivated)
        }

        async fn disable_endpoint(&self, id: EndpointId) -> Result<()> {
            let mut endpoints = self.endpoints.write().await;
            let endpoint =
                endpoints.get_mut(&id).ok_or_else(|| CoreError::not_found("endpoint"))?;
            endpoint.status = EndpointStatus::Inactive;
            endpoint.disabled_by_breaker = true;
            Ok(())
        }

        async fn sweep_events(
            &self,
            project_id: ProjectId,
            before: DateTime<Utc>,
        ) -> Result<u64> {
            let deliveries = self.deliveries.read().await;
            let mut events = self.events.write().await;
            let start = events.len();
            events.retain(|id, event| {
                event.project_id != project_id
                    || event.created_at > before
                    || deliveries.values().any(|d| d.event_id == *id)
            });
            Ok((start - events.len()) as u64)
        }

        async fn reset_deliveries_for_resend(
            &self,
            ids: &[DeliveryId],
        ) -> Result<Vec<EventDelivery>> {
            let mut deliveries = self.deliveries.write().await;
            let mut reset = Vec::with_capacity(ids.len());
            for id in ids {
                let delivery =
                    deliveries.get_mut(id).ok_or_else(|| CoreError::not_found("delivery"))?;
                delivery.status = DeliveryStatus::Scheduled;
                delivery.metadata.0.num_trials = 0;
                delivery.description.clear();
                reset.push(delivery.clone());
            }
            Ok(reset)
        }

        async fn event_ids_page(
            &self,
            project_id: ProjectId,
            filter: &ListFilter,
            after: Option<EventId>,
            limit: i64,
        ) -> Result<Vec<EventId>> {
            let events = self.events.read().await;
            let mut ids: Vec<EventId> = events
                .values()
                .filter(|e| e.project_id == project_id && e.deleted_at.is_none())
                .filter(|e| {
                    filter.created_at_start.is_none_or(|start| e.created_at >= start)
                        && filter.created_at_end.is_none_or(|end| e.created_at <= end)
                        && (filter.endpoint_ids.is_empty()
                            || e.endpoints.iter().any(|id| filter.endpoint_ids.contains(id)))
                        && (filter.source_ids.is_empty()
                            || e.source_id.is_some_and(|id| filter.source_ids.contains(&id)))
                })
                .map(|e| e.id)
                .filter(|id| after.is_none_or(|after| *id > after))
                .collect();
            ids.sort();
            ids.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
            Ok(ids)
        }

        async fn delivery_ids_page(
            &self,
            project_id: ProjectId,
            filter: &ListFilter,
            after: Option<DeliveryId>,
            limit: i64,
        ) -> Result<Vec<DeliveryId>> {
            let deliveries = self.deliveries.read().await;
            let mut ids: Vec<DeliveryId> = deliveries
                .values()
                .filter(|d| d.project_id == project_id && d.deleted_at.is_none())
                .filter(|d| {
                    (filter.statuses.is_empty() || filter.statuses.contains(&d.status))
                        && (filter.endpoint_ids.is_empty()
                            || filter.endpoint_ids.contains(&d.endpoint_id))
                        && filter.event_id.is_none_or(|event_id| d.event_id == event_id)
                        && filter.created_at_start.is_none_or(|start| d.created_at >= start)
                        && filter.created_at_end.is_none_or(|end| d.created_at <= end)
                })
                .map(|d| d.id)
                .filter(|id| after.is_none_or(|after| *id > after))
                .collect();
            ids.sort();
            ids.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
            Ok(ids)
        }
    }
}
