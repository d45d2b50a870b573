//! Postgres-backed work queue.
//!
//! Jobs are rows claimed with `FOR UPDATE SKIP LOCKED`, so concurrent
//! workers never block each other and every ready job goes to exactly one
//! claimant at a time. A visibility timeout resurfaces jobs whose worker
//! died, which is where the at-least-once guarantee comes from.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::{CoreError, Result},
    models::DeliveryId,
    queue::{validate_delay, QueueJob, QueueName, TaskName, WorkQueue, VISIBILITY_TIMEOUT},
};

/// Postgres repository implementing [`WorkQueue`].
pub struct Repository {
    pool: Arc<PgPool>,
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    queue: String,
    task: String,
    payload: sqlx::types::Json<Value>,
    delivery_id: Option<DeliveryId>,
    run_at: DateTime<Utc>,
    attempts: i32,
    created_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for QueueJob {
    type Error = CoreError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            queue: row.queue.parse().map_err(CoreError::Database)?,
            task: row.task.parse().map_err(CoreError::Database)?,
            payload: row.payload.0,
            delivery_id: row.delivery_id,
            run_at: row.run_at,
            attempts: row.attempts,
            created_at: row.created_at,
        })
    }
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    fn delay_to_chrono(delay: Duration) -> chrono::Duration {
        chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

#[async_trait]
impl WorkQueue for Repository {
    async fn enqueue(
        &self,
        queue: QueueName,
        task: TaskName,
        payload: Value,
        delivery_id: Option<DeliveryId>,
        delay: Duration,
    ) -> Result<Uuid> {
        validate_delay(delay)?;

        let id = Uuid::now_v7();
        let run_at = Utc::now() + Self::delay_to_chrono(delay);

        sqlx::query(
            r"
            INSERT INTO queue_jobs (id, queue, task, payload, delivery_id, priority,
                                    run_at, attempts, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 0, NOW())
            ",
        )
        .bind(id)
        .bind(queue.as_str())
        .bind(task.as_str())
        .bind(sqlx::types::Json(payload))
        .bind(delivery_id)
        .bind(queue.priority())
        .bind(run_at)
        .execute(&*self.pool)
        .await?;

        Ok(id)
    }

    async fn claim(&self, batch: usize) -> Result<Vec<QueueJob>> {
        let mut tx = self.pool.begin().await?;

        let ids: Vec<Uuid> = sqlx::query_scalar(
            r"
            SELECT id FROM queue_jobs
            WHERE run_at <= NOW()
              AND (claimed_at IS NULL OR claimed_at <= NOW() - make_interval(secs => $1))
            ORDER BY priority ASC, run_at ASC, id ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            ",
        )
        .bind(VISIBILITY_TIMEOUT.as_secs_f64())
        .bind(i64::try_from(batch).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, JobRow>(
            r"
            UPDATE queue_jobs
            SET claimed_at = NOW(), attempts = attempts + 1
            WHERE id = ANY($1)
            RETURNING id, queue, task, payload, delivery_id, run_at, attempts, created_at
            ",
        )
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        rows.into_iter().map(QueueJob::try_from).collect()
    }

    async fn complete(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM queue_jobs WHERE id = $1")
            .bind(id)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    async fn release(&self, id: Uuid, delay: Duration) -> Result<()> {
        validate_delay(delay)?;

        sqlx::query(
            r"
            UPDATE queue_jobs
            SET claimed_at = NULL, run_at = $1
            WHERE id = $2
            ",
        )
        .bind(Utc::now() + Self::delay_to_chrono(delay))
        .bind(id)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    async fn delete_for_deliveries(&self, ids: &[DeliveryId]) -> Result<u64> {
        let result = sqlx::query("DELETE FROM queue_jobs WHERE delivery_id = ANY($1)")
            .bind(ids)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
