//! Repository for event deliveries.
//!
//! Delivery rows are the unit of work for the dispatcher. Claims are a
//! compare-and-set on status so duplicate queue pulls (at-least-once) can
//! never run two attempts for one delivery concurrently.

use std::sync::Arc;

use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};

use super::{ListFilter, INSERT_PARTITION_SIZE};
use crate::{
    error::{CoreError, Result},
    models::{DeliveryId, DeliveryMetadata, DeliveryStatus, EventDelivery, EventId, ProjectId},
    pagination::{Pageable, PageDirection, PaginationData},
};

const DELIVERY_COLUMNS: &str = "ed.id, ed.project_id, ed.event_id, ed.endpoint_id, \
     ed.subscription_id, ed.device_id, ed.headers, ed.url_query_params, ed.idempotency_key, \
     ed.event_type, ed.status, ed.metadata, ed.description, \
     ed.created_at, ed.updated_at, ed.deleted_at";

/// Repository for event delivery database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts a batch of deliveries, chunked per statement.
    ///
    /// # Errors
    ///
    /// Returns an error if any insert fails.
    pub async fn create_many(&self, deliveries: &[EventDelivery]) -> Result<()> {
        if deliveries.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for chunk in deliveries.chunks(INSERT_PARTITION_SIZE) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO event_deliveries (
                    id, project_id, event_id, endpoint_id, subscription_id, device_id,
                    headers, url_query_params, idempotency_key, event_type, status,
                    metadata, description, created_at, updated_at
                ) ",
            );
            builder.push_values(chunk, |mut row, delivery| {
                row.push_bind(delivery.id)
                    .push_bind(delivery.project_id)
                    .push_bind(delivery.event_id)
                    .push_bind(delivery.endpoint_id)
                    .push_bind(delivery.subscription_id)
                    .push_bind(delivery.device_id)
                    .push_bind(&delivery.headers)
                    .push_bind(&delivery.url_query_params)
                    .push_bind(&delivery.idempotency_key)
                    .push_bind(&delivery.event_type)
                    .push_bind(delivery.status)
                    .push_bind(&delivery.metadata)
                    .push_bind(&delivery.description)
                    .push_bind(delivery.created_at)
                    .push_bind(delivery.updated_at);
            });
            builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;

        Ok(())
    }

    /// Finds a delivery by id within a project.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn find_by_id(
        &self,
        project_id: ProjectId,
        id: DeliveryId,
    ) -> Result<Option<EventDelivery>> {
        let delivery = sqlx::query_as::<_, EventDelivery>(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM event_deliveries ed
             WHERE ed.id = $1 AND ed.project_id = $2 AND ed.deleted_at IS NULL"
        ))
        .bind(id)
        .bind(project_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(delivery)
    }

    /// Finds a delivery by id, failing when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown or soft-deleted deliveries.
    pub async fn must_find_by_id(
        &self,
        project_id: ProjectId,
        id: DeliveryId,
    ) -> Result<EventDelivery> {
        self.find_by_id(project_id, id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("event delivery {id}")))
    }

    /// All deliveries of one event, ordered by endpoint id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn find_by_event(&self, event_id: EventId) -> Result<Vec<EventDelivery>> {
        let deliveries = sqlx::query_as::<_, EventDelivery>(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM event_deliveries ed
             WHERE ed.event_id = $1 AND ed.deleted_at IS NULL
             ORDER BY ed.endpoint_id ASC"
        ))
        .bind(event_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(deliveries)
    }

    /// Claims a delivery for an attempt: `scheduled`/`retry` -> `processing`.
    ///
    /// Compare-and-set on status; a duplicate queue pull gets `None` and
    /// drops its job. Returns the claimed row.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn claim_for_processing(&self, id: DeliveryId) -> Result<Option<EventDelivery>> {
        let delivery = sqlx::query_as::<_, EventDelivery>(&format!(
            "UPDATE event_deliveries ed
             SET status = 'processing', updated_at = NOW()
             WHERE ed.id = $1 AND ed.status IN ('scheduled', 'retry') AND ed.deleted_at IS NULL
             RETURNING {DELIVERY_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(delivery)
    }

    /// Updates status, metadata, and description after an attempt.
    ///
    /// Runs inside the caller's transaction so the state change commits
    /// atomically with the appended attempt row.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn update_outcome_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: DeliveryId,
        status: DeliveryStatus,
        metadata: &DeliveryMetadata,
        description: &str,
    ) -> Result<()> {
        sqlx::query(
            r"
            UPDATE event_deliveries
            SET status = $1, metadata = $2, description = $3, updated_at = NOW()
            WHERE id = $4
            ",
        )
        .bind(status)
        .bind(sqlx::types::Json(metadata))
        .bind(description)
        .bind(id)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Moves a delivery to a new status without touching metadata.
    ///
    /// Used by pre-check short-circuits (discard, back to scheduled).
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn update_status(
        &self,
        id: DeliveryId,
        status: DeliveryStatus,
        description: &str,
    ) -> Result<()> {
        sqlx::query(
            r"
            UPDATE event_deliveries
            SET status = $1, description = $2, updated_at = NOW()
            WHERE id = $3
            ",
        )
        .bind(status)
        .bind(description)
        .bind(id)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Resets a delivery for resend: `num_trials = 0`, status `scheduled`.
    ///
    /// Runs inside the caller's transaction so the reset commits atomically
    /// with the deletion of stale queue jobs. Returns the refreshed row.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn reset_for_resend_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: DeliveryId,
    ) -> Result<EventDelivery> {
        let delivery = sqlx::query_as::<_, EventDelivery>(&format!(
            "UPDATE event_deliveries ed
             SET status = 'scheduled',
                 metadata = jsonb_set(ed.metadata, '{{num_trials}}', '0'),
                 description = '',
                 updated_at = NOW()
             WHERE ed.id = $1 AND ed.deleted_at IS NULL
             RETURNING {DELIVERY_COLUMNS}"
        ))
        .bind(id)
        .fetch_one(&mut **tx)
        .await?;

        Ok(delivery)
    }

    /// Cursor-paged delivery listing, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if a query fails.
    pub async fn list_paged(
        &self,
        project_id: ProjectId,
        filter: &ListFilter,
        pageable: Pageable,
    ) -> Result<(Vec<EventDelivery>, PaginationData)> {
        let pageable = pageable.clamped();

        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {DELIVERY_COLUMNS} FROM event_deliveries ed WHERE "));
        push_delivery_filters(&mut builder, project_id, filter);

        if let Some(cursor) = pageable.cursor {
            match pageable.direction {
                PageDirection::Next => builder.push(" AND ed.id < ").push_bind(cursor),
                PageDirection::Prev => builder.push(" AND ed.id > ").push_bind(cursor),
            };
        }
        match pageable.direction {
            PageDirection::Next => builder.push(" ORDER BY ed.id DESC LIMIT "),
            PageDirection::Prev => builder.push(" ORDER BY ed.id ASC LIMIT "),
        };
        builder.push_bind(pageable.limit());

        let mut deliveries =
            builder.build_query_as::<EventDelivery>().fetch_all(&*self.pool).await?;

        // Trim the surplus row in query order, then reorder for display.
        let has_more = deliveries.len() as i64 > pageable.per_page;
        if has_more {
            deliveries.truncate(pageable.per_page as usize);
        }
        if pageable.direction == PageDirection::Prev {
            deliveries.reverse();
        }

        let ids: Vec<uuid::Uuid> = deliveries.iter().map(|d| d.id.0).collect();
        let prev_row_count = match deliveries.first() {
            Some(first) => {
                let mut count_builder: QueryBuilder<Postgres> =
                    QueryBuilder::new("SELECT COUNT(ed.id) FROM event_deliveries ed WHERE ");
                push_delivery_filters(&mut count_builder, project_id, filter);
                count_builder.push(" AND ed.id > ").push_bind(first.id);
                count_builder.build_query_scalar::<i64>().fetch_one(&*self.pool).await?
            },
            None => 0,
        };

        let pagination = PaginationData::build(&pageable, &ids, has_more, prev_row_count);
        Ok((deliveries, pagination))
    }

    /// Counts deliveries matching a filter.
    ///
    /// Backs the affected-row preview for batch retry.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn count(&self, project_id: ProjectId, filter: &ListFilter) -> Result<i64> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT COUNT(ed.id) FROM event_deliveries ed WHERE ");
        push_delivery_filters(&mut builder, project_id, filter);

        let count = builder.build_query_scalar::<i64>().fetch_one(&*self.pool).await?;
        Ok(count)
    }

    /// One ascending page of delivery ids for batch retry streaming.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn list_ids_ascending(
        &self,
        project_id: ProjectId,
        filter: &ListFilter,
        after: Option<DeliveryId>,
        limit: i64,
    ) -> Result<Vec<DeliveryId>> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT ed.id FROM event_deliveries ed WHERE ");
        push_delivery_filters(&mut builder, project_id, filter);
        if let Some(after) = after {
            builder.push(" AND ed.id > ").push_bind(after);
        }
        builder.push(" ORDER BY ed.id ASC LIMIT ").push_bind(limit);

        let ids = builder.build_query_scalar::<DeliveryId>().fetch_all(&*self.pool).await?;
        Ok(ids)
    }
}

/// Pushes the shared delivery-listing predicates onto a query builder.
fn push_delivery_filters(
    builder: &mut QueryBuilder<'_, Postgres>,
    project_id: ProjectId,
    filter: &ListFilter,
) {
    builder.push("ed.deleted_at IS NULL AND ed.project_id = ").push_bind(project_id);

    if !filter.endpoint_ids.is_empty() {
        builder.push(" AND ed.endpoint_id = ANY(").push_bind(filter.endpoint_ids.clone()).push(")");
    }
    if let Some(event_id) = filter.event_id {
        builder.push(" AND ed.event_id = ").push_bind(event_id);
    }
    if !filter.statuses.is_empty() {
        let statuses: Vec<String> = filter.statuses.iter().map(ToString::to_string).collect();
        builder.push(" AND ed.status = ANY(").push_bind(statuses).push(")");
    }
    if let Some(key) = &filter.idempotency_key {
        builder.push(" AND ed.idempotency_key = ").push_bind(key.clone());
    }
    if let Some(start) = filter.created_at_start {
        builder.push(" AND ed.created_at >= ").push_bind(start);
    }
    if let Some(end) = filter.created_at_end {
        builder.push(" AND ed.created_at <= ").push_bind(end);
    }
}
