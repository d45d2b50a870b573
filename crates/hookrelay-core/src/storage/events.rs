//! Repository for ingested events.
//!
//! Covers transactional creation with partitioned junction inserts,
//! idempotency lookups inside the dedup window, cursor-paged listings, the
//! tokenized search mirror, and retention deletes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};

use super::{ListFilter, INSERT_PARTITION_SIZE};
use crate::{
    error::{CoreError, Result},
    models::{Event, EventId, ProjectId},
    pagination::{Pageable, PageDirection, PaginationData},
};

const EVENT_COLUMNS: &str = "ev.id, ev.event_type, ev.project_id, ev.source_id, ev.endpoints, \
     ev.headers, ev.raw, ev.data, ev.url_query_params, ev.idempotency_key, \
     ev.is_duplicate_event, ev.acknowledged_at, ev.created_at, ev.updated_at, ev.deleted_at";

/// Repository for event database operations.
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

    /// Persists an event and its endpoint junction rows in one transaction.
    ///
    /// Junction inserts are partitioned at [`INSERT_PARTITION_SIZE`] rows
    /// per statement so very large fan-outs (tens of thousands of
    /// endpoints) stay within statement limits while remaining atomic.
    ///
    /// # Errors
    ///
    /// Returns an error if any insert fails; nothing is persisted then.
    pub async fn create_with_endpoints(&self, event: &Event) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        self.create_in_tx(&mut tx, event).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Persists an event and its junction rows inside a caller transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if any insert fails.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &Event,
    ) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO events (
                id, event_type, project_id, source_id, endpoints, headers, raw, data,
                url_query_params, idempotency_key, is_duplicate_event, acknowledged_at,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ",
        )
        .bind(event.id)
        .bind(&event.event_type)
        .bind(event.project_id)
        .bind(event.source_id)
        .bind(&event.endpoints)
        .bind(&event.headers)
        .bind(&event.raw)
        .bind(&event.data)
        .bind(&event.url_query_params)
        .bind(&event.idempotency_key)
        .bind(event.is_duplicate_event)
        .bind(event.acknowledged_at)
        .bind(event.created_at)
        .bind(event.updated_at)
        .execute(&mut **tx)
        .await?;

        for chunk in event.endpoints.chunks(INSERT_PARTITION_SIZE) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO events_endpoints (event_id, endpoint_id) ");
            builder.push_values(chunk, |mut row, endpoint_id| {
                row.push_bind(event.id).push_bind(*endpoint_id);
            });
            builder.build().execute(&mut **tx).await?;
        }

        Ok(())
    }

    /// Finds an event by id within a project.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn find_by_id(&self, project_id: ProjectId, id: EventId) -> Result<Option<Event>> {
        let event = sqlx::query_as::<_, Event>(&format!(
            "SELECT {EVENT_COLUMNS} FROM events ev
             WHERE ev.id = $1 AND ev.project_id = $2 AND ev.deleted_at IS NULL"
        ))
        .bind(id)
        .bind(project_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(event)
    }

    /// Finds an event by id, failing when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown or soft-deleted events.
    pub async fn must_find_by_id(&self, project_id: ProjectId, id: EventId) -> Result<Event> {
        self.find_by_id(project_id, id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("event {id}")))
    }

    /// Whether a non-duplicate event with this idempotency key already
    /// exists in the project inside the dedup window.
    ///
    /// Among all events in a project sharing one key inside the window,
    /// exactly one carries `is_duplicate_event = false`; this finds it.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn find_first_with_idempotency_key(
        &self,
        project_id: ProjectId,
        idempotency_key: &str,
        window_start: DateTime<Utc>,
    ) -> Result<Option<EventId>> {
        let id = sqlx::query_scalar::<_, EventId>(
            r"
            SELECT id FROM events
            WHERE idempotency_key = $1
              AND project_id = $2
              AND is_duplicate_event IS FALSE
              AND created_at >= $3
              AND deleted_at IS NULL
            ORDER BY id ASC
            LIMIT 1
            ",
        )
        .bind(idempotency_key)
        .bind(project_id)
        .bind(window_start)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(id)
    }

    /// Marks fan-out as completed for an event.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn acknowledge(&self, id: EventId) -> Result<()> {
        sqlx::query("UPDATE events SET acknowledged_at = NOW(), updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    /// Cursor-paged event listing, newest first.
    ///
    /// Fetches `per_page + 1` rows to derive `has_next` without a count,
    /// then counts the rows behind the page head for `prev_row_count`.
    /// When `filter.query` is set the listing reads from the tokenized
    /// search mirror instead of the primary table.
    ///
    /// # Errors
    ///
    /// Returns an error if a query fails.
    pub async fn list_paged(
        &self,
        project_id: ProjectId,
        filter: &ListFilter,
        pageable: Pageable,
    ) -> Result<(Vec<Event>, PaginationData)> {
        let pageable = pageable.clamped();
        let table = if filter.query.is_some() { "events_search" } else { "events" };

        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {EVENT_COLUMNS} FROM {table} ev WHERE "));
        push_event_filters(&mut builder, project_id, filter);

        if let Some(cursor) = pageable.cursor {
            match pageable.direction {
                PageDirection::Next => builder.push(" AND ev.id < ").push_bind(cursor),
                PageDirection::Prev => builder.push(" AND ev.id > ").push_bind(cursor),
            };
        }
        match pageable.direction {
            PageDirection::Next => builder.push(" ORDER BY ev.id DESC LIMIT "),
            PageDirection::Prev => builder.push(" ORDER BY ev.id ASC LIMIT "),
        };
        builder.push_bind(pageable.limit());

        let mut events = builder.build_query_as::<Event>().fetch_all(&*self.pool).await?;

        // Trim the surplus row in query order, then reorder for display.
        let has_more = events.len() as i64 > pageable.per_page;
        if has_more {
            events.truncate(pageable.per_page as usize);
        }
        if pageable.direction == PageDirection::Prev {
            events.reverse();
        }

        let ids: Vec<uuid::Uuid> = events.iter().map(|e| e.id.0).collect();
        let prev_row_count = match events.first() {
            Some(first) => {
                let mut count_builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                    "SELECT COUNT(DISTINCT ev.id) FROM {table} ev WHERE "
                ));
                push_event_filters(&mut count_builder, project_id, filter);
                count_builder.push(" AND ev.id > ").push_bind(first.id);
                count_builder.build_query_scalar::<i64>().fetch_one(&*self.pool).await?
            },
            None => 0,
        };

        let pagination = PaginationData::build(&pageable, &ids, has_more, prev_row_count);
        Ok((events, pagination))
    }

    /// Counts events matching a filter.
    ///
    /// Backs the affected-row preview for batch replay.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn count(&self, project_id: ProjectId, filter: &ListFilter) -> Result<i64> {
        let table = if filter.query.is_some() { "events_search" } else { "events" };
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT COUNT(DISTINCT ev.id) FROM {table} ev WHERE "));
        push_event_filters(&mut builder, project_id, filter);

        let count = builder.build_query_scalar::<i64>().fetch_one(&*self.pool).await?;
        Ok(count)
    }

    /// One ascending page of event ids for batch replay streaming.
    ///
    /// Batch operations walk the full result set in `created_at` order
    /// through repeated calls with the last id of the previous page.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn list_ids_ascending(
        &self,
        project_id: ProjectId,
        filter: &ListFilter,
        after: Option<EventId>,
        limit: i64,
    ) -> Result<Vec<EventId>> {
        let table = if filter.query.is_some() { "events_search" } else { "events" };
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT DISTINCT ev.id FROM {table} ev WHERE "));
        push_event_filters(&mut builder, project_id, filter);
        if let Some(after) = after {
            builder.push(" AND ev.id > ").push_bind(after);
        }
        builder.push(" ORDER BY ev.id ASC LIMIT ").push_bind(limit);

        let ids = builder.build_query_scalar::<EventId>().fetch_all(&*self.pool).await?;
        Ok(ids)
    }

    /// Mirrors an event into the tokenized search table.
    ///
    /// Handled by the `search-index` queue task after fan-out; the insert
    /// is idempotent so at-least-once job delivery is safe.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn index_event(&self, id: EventId) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO events_search (
                id, event_type, project_id, source_id, endpoints, headers, raw, data,
                url_query_params, idempotency_key, is_duplicate_event, acknowledged_at,
                created_at, updated_at, search_token
            )
            SELECT id, event_type, project_id, source_id, endpoints, headers, raw, data,
                   url_query_params, idempotency_key, is_duplicate_event, acknowledged_at,
                   created_at, updated_at,
                   to_tsvector('simple', event_type || ' ' || raw)
            FROM events WHERE id = $1 AND deleted_at IS NULL
            ON CONFLICT (id) DO NOTHING
            ",
        )
        .bind(id)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Soft-deletes project events inside an inclusive date range.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn soft_delete_project_events(
        &self,
        project_id: ProjectId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE events SET deleted_at = NOW()
            WHERE project_id = $1 AND created_at >= $2 AND created_at <= $3
              AND deleted_at IS NULL
            ",
        )
        .bind(project_id)
        .bind(start)
        .bind(end)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Hard-deletes project events past retention.
    ///
    /// Only removes events with no remaining deliveries; attempt history
    /// outlives the event otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn hard_delete_project_events(
        &self,
        project_id: ProjectId,
        before: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r"
            DELETE FROM events
            WHERE project_id = $1 AND created_at <= $2
              AND NOT EXISTS (
                  SELECT 1 FROM event_deliveries
                  WHERE event_deliveries.event_id = events.id
              )
            ",
        )
        .bind(project_id)
        .bind(before)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

/// Pushes the shared event-listing predicates onto a query builder.
///
/// Every listing and count goes through this one function so filters can
/// never drift between the page query, the behind-count, and the batch
/// stream.
fn push_event_filters(
    builder: &mut QueryBuilder<'_, Postgres>,
    project_id: ProjectId,
    filter: &ListFilter,
) {
    builder.push("ev.deleted_at IS NULL AND ev.project_id = ").push_bind(project_id);

    if !filter.endpoint_ids.is_empty() {
        builder
            .push(
                " AND EXISTS (SELECT 1 FROM events_endpoints ee \
                 WHERE ee.event_id = ev.id AND ee.endpoint_id = ANY(",
            )
            .push_bind(filter.endpoint_ids.clone())
            .push("))");
    }
    if !filter.source_ids.is_empty() {
        builder.push(" AND ev.source_id = ANY(").push_bind(filter.source_ids.clone()).push(")");
    }
    if let Some(key) = &filter.idempotency_key {
        builder.push(" AND ev.idempotency_key = ").push_bind(key.clone());
    }
    if let Some(start) = filter.created_at_start {
        builder.push(" AND ev.created_at >= ").push_bind(start);
    }
    if let Some(end) = filter.created_at_end {
        builder.push(" AND ev.created_at <= ").push_bind(end);
    }
    if let Some(query) = &filter.query {
        builder
            .push(" AND search_token @@ websearch_to_tsquery('simple', ")
            .push_bind(query.clone())
            .push(")");
    }
}
