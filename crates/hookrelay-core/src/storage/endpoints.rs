//! Repository for endpoint configuration and persisted breaker state.
//!
//! The circuit breaker counter lives on the endpoint row so it survives
//! restarts; the delivery crate owns the trip/reset policy and calls down
//! into the atomic updates here.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::{CoreError, Result},
    models::{Endpoint, EndpointId, EndpointStatus, ProjectId},
};

const ENDPOINT_COLUMNS: &str = "id, project_id, name, target_url, secrets, http_timeout_seconds, \
     rate_limit, rate_limit_duration_seconds, status, auth, alert_config, \
     breaker_failure_count, breaker_window_started_at, disabled_by_breaker, \
     created_at, updated_at, deleted_at";

/// Repository for endpoint database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Creates an endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn create(&self, endpoint: &Endpoint) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO endpoints (
                id, project_id, name, target_url, secrets, http_timeout_seconds,
                rate_limit, rate_limit_duration_seconds, status, auth, alert_config,
                breaker_failure_count, breaker_window_started_at, disabled_by_breaker,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ",
        )
        .bind(endpoint.id)
        .bind(endpoint.project_id)
        .bind(&endpoint.name)
        .bind(&endpoint.target_url)
        .bind(&endpoint.secrets)
        .bind(endpoint.http_timeout_seconds)
        .bind(endpoint.rate_limit)
        .bind(endpoint.rate_limit_duration_seconds)
        .bind(endpoint.status)
        .bind(&endpoint.auth)
        .bind(&endpoint.alert_config)
        .bind(endpoint.breaker_failure_count)
        .bind(endpoint.breaker_window_started_at)
        .bind(endpoint.disabled_by_breaker)
        .bind(endpoint.created_at)
        .bind(endpoint.updated_at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Finds an endpoint by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn find_by_id(&self, id: EndpointId) -> Result<Option<Endpoint>> {
        let endpoint = sqlx::query_as::<_, Endpoint>(&format!(
            "SELECT {ENDPOINT_COLUMNS} FROM endpoints WHERE id = $1 AND deleted_at IS NULL"
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(endpoint)
    }

    /// Finds an endpoint by id, failing when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown or soft-deleted endpoints.
    pub async fn must_find_by_id(&self, id: EndpointId) -> Result<Endpoint> {
        self.find_by_id(id).await?.ok_or_else(|| CoreError::not_found(format!("endpoint {id}")))
    }

    /// All endpoint ids in a project, ordered by id.
    ///
    /// Broadcast fan-out resolves "all endpoints" through this.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn find_ids_by_project(&self, project_id: ProjectId) -> Result<Vec<EndpointId>> {
        let ids = sqlx::query_scalar::<_, EndpointId>(
            r"
            SELECT id FROM endpoints
            WHERE project_id = $1 AND deleted_at IS NULL
            ORDER BY id ASC
            ",
        )
        .bind(project_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(ids)
    }

    /// Updates the lifecycle status of an endpoint.
    ///
    /// `disabled_by_breaker` records whether the transition was made by the
    /// circuit breaker, which force-resend consults before reviving
    /// discarded deliveries.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn update_status(
        &self,
        id: EndpointId,
        status: EndpointStatus,
        disabled_by_breaker: bool,
    ) -> Result<()> {
        sqlx::query(
            r"
            UPDATE endpoints
            SET status = $1, disabled_by_breaker = $2, updated_at = NOW()
            WHERE id = $3 AND deleted_at IS NULL
            ",
        )
        .bind(status)
        .bind(disabled_by_breaker)
        .bind(id)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Atomically advances the breaker failure counter.
    ///
    /// Starts a fresh window when none is open or when the current window
    /// began before `window_floor`. Returns the counter value after the
    /// increment so the caller can compare against the trip threshold.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn advance_breaker(
        &self,
        id: EndpointId,
        window_floor: DateTime<Utc>,
    ) -> Result<i32> {
        let count = sqlx::query_scalar::<_, i32>(
            r"
            UPDATE endpoints
            SET breaker_failure_count = CASE
                    WHEN breaker_window_started_at IS NULL
                      OR breaker_window_started_at < $2 THEN 1
                    ELSE breaker_failure_count + 1
                END,
                breaker_window_started_at = CASE
                    WHEN breaker_window_started_at IS NULL
                      OR breaker_window_started_at < $2 THEN NOW()
                    ELSE breaker_window_started_at
                END,
                updated_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL
            RETURNING breaker_failure_count
            ",
        )
        .bind(id)
        .bind(window_floor)
        .fetch_one(&*self.pool)
        .await?;

        Ok(count)
    }

    /// Resets the breaker counter and reactivates breaker-disabled
    /// endpoints.
    ///
    /// Returns `true` when the endpoint was reactivated by this call.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn reset_breaker(&self, id: EndpointId) -> Result<bool> {
        let reactivated = sqlx::query_scalar::<_, bool>(
            r"
            WITH prior AS (
                SELECT disabled_by_breaker FROM endpoints
                WHERE id = $1 AND deleted_at IS NULL
            )
            UPDATE endpoints
            SET breaker_failure_count = 0,
                breaker_window_started_at = NULL,
                status = CASE WHEN disabled_by_breaker THEN 'active' ELSE status END,
                disabled_by_breaker = FALSE,
                updated_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL
            RETURNING (SELECT disabled_by_breaker FROM prior)
            ",
        )
        .bind(id)
        .fetch_one(&*self.pool)
        .await?;

        Ok(reactivated)
    }

    /// Soft-deletes an endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn soft_delete(&self, id: EndpointId) -> Result<()> {
        sqlx::query(
            r"
            UPDATE endpoints SET deleted_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL
            ",
        )
        .bind(id)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }
}
