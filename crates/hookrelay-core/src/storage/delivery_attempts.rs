//! Repository for delivery attempt audit rows.
//!
//! Attempts are append-only. They commit in the same transaction as the
//! delivery state change, which is what keeps the attempt count equal to
//! `num_trials` at all times.

use std::sync::Arc;

use sqlx::{PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{DeliveryAttempt, DeliveryId},
};

const ATTEMPT_COLUMNS: &str = "id, delivery_id, endpoint_id, api_version, ip_address, \
     request_http_header, response_http_header, http_status, response_data, error, status, \
     created_at";

/// Repository for delivery attempt database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Appends an attempt inside the caller's transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        attempt: &DeliveryAttempt,
    ) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO delivery_attempts (
                id, delivery_id, endpoint_id, api_version, ip_address,
                request_http_header, response_http_header, http_status,
                response_data, error, status, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ",
        )
        .bind(attempt.id)
        .bind(attempt.delivery_id)
        .bind(attempt.endpoint_id)
        .bind(&attempt.api_version)
        .bind(&attempt.ip_address)
        .bind(&attempt.request_http_header)
        .bind(&attempt.response_http_header)
        .bind(attempt.http_status)
        .bind(&attempt.response_data)
        .bind(&attempt.error)
        .bind(attempt.status)
        .bind(attempt.created_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// All attempts of a delivery, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn find_by_delivery(&self, delivery_id: DeliveryId) -> Result<Vec<DeliveryAttempt>> {
        let attempts = sqlx::query_as::<_, DeliveryAttempt>(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM delivery_attempts
             WHERE delivery_id = $1
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(delivery_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(attempts)
    }

}
