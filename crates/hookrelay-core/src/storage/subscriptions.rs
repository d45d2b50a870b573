//! Repository for subscription database operations.
//!
//! Filter bodies are validated here, at write time, so match time never
//! sees an unsupported operator or a malformed regex.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::Result,
    filter,
    models::{EndpointId, ProjectId, SourceId, Subscription, SubscriptionId},
};

const SUBSCRIPTION_COLUMNS: &str = "id, sub_type, project_id, name, endpoint_id, source_id, \
     device_id, filter_config, alert_config, retry_config, rate_limit_config, function, \
     created_at, updated_at, deleted_at";

/// Repository for subscription database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Creates a subscription after validating its filter bodies.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFilter` for unsupported operators or malformed
    /// regex, or a database error if the insert fails.
    pub async fn create(&self, subscription: &Subscription) -> Result<()> {
        filter::validate_filter(&subscription.filter_config.0.filter.body)?;
        filter::validate_filter(&subscription.filter_config.0.filter.headers)?;

        sqlx::query(
            r"
            INSERT INTO subscriptions (
                id, sub_type, project_id, name, endpoint_id, source_id, device_id,
                filter_config, alert_config, retry_config, rate_limit_config, function,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ",
        )
        .bind(subscription.id)
        .bind(subscription.sub_type)
        .bind(subscription.project_id)
        .bind(&subscription.name)
        .bind(subscription.endpoint_id)
        .bind(subscription.source_id)
        .bind(subscription.device_id)
        .bind(&subscription.filter_config)
        .bind(&subscription.alert_config)
        .bind(&subscription.retry_config)
        .bind(&subscription.rate_limit_config)
        .bind(&subscription.function)
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Finds a subscription by id within a project.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn find_by_id(
        &self,
        project_id: ProjectId,
        id: SubscriptionId,
    ) -> Result<Option<Subscription>> {
        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
             WHERE id = $1 AND project_id = $2 AND deleted_at IS NULL"
        ))
        .bind(id)
        .bind(project_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(subscription)
    }

    /// Candidate subscriptions for an outgoing fan-out: those bound to any
    /// of the given endpoints.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn find_by_endpoint_ids(
        &self,
        project_id: ProjectId,
        endpoint_ids: &[EndpointId],
    ) -> Result<Vec<Subscription>> {
        let subscriptions = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
             WHERE project_id = $1 AND endpoint_id = ANY($2) AND deleted_at IS NULL
             ORDER BY id ASC"
        ))
        .bind(project_id)
        .bind(endpoint_ids)
        .fetch_all(&*self.pool)
        .await?;

        Ok(subscriptions)
    }

    /// Candidate subscriptions for an incoming fan-out: those bound to the
    /// source, including broadcast subscriptions with no endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn find_by_source_id(
        &self,
        project_id: ProjectId,
        source_id: SourceId,
    ) -> Result<Vec<Subscription>> {
        let subscriptions = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
             WHERE project_id = $1 AND source_id = $2 AND deleted_at IS NULL
             ORDER BY id ASC"
        ))
        .bind(project_id)
        .bind(source_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(subscriptions)
    }

    /// Soft-deletes a subscription.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn soft_delete(&self, project_id: ProjectId, id: SubscriptionId) -> Result<()> {
        sqlx::query(
            r"
            UPDATE subscriptions SET deleted_at = NOW()
            WHERE id = $1 AND project_id = $2 AND deleted_at IS NULL
            ",
        )
        .bind(id)
        .bind(project_id)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }
}
