//! Work queue contract for deferred delivery jobs.
//!
//! Named queues with priority classes back the delivery pipeline: fan-out
//! enqueues delivery jobs, the dispatcher claims them, and the scheduler
//! re-enqueues retries with a delay. The contract is at-least-once —
//! duplicate claims are possible, so every handler is idempotent (delivery
//! handlers guard with a status compare-and-set).
//!
//! Priorities order claims without partitioning them: a claim takes any
//! ready job sorted by (priority, run_at), so a busy high-priority queue
//! delays but never starves lower classes — `run_at` is monotone and old
//! jobs surface eventually.

use std::{collections::HashMap, fmt, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    error::{CoreError, Result},
    models::DeliveryId,
};

/// Longest accepted enqueue delay: 7 days.
pub const MAX_DELAY: Duration = Duration::from_secs(7 * 24 * 3600);

/// How long a claimed job stays invisible before it can be re-claimed.
///
/// Covers worker crashes mid-job: the job resurfaces for another worker,
/// preserving at-least-once semantics.
pub const VISIBILITY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Named queue with a fixed priority class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    /// Event creation and fan-out planning.
    CreateEvent,
    /// First delivery attempt per (event, endpoint).
    Event,
    /// Deferred retry attempts.
    Retry,
    /// Tokenized search mirror maintenance.
    SearchIndex,
    /// Background maintenance (retention sweeps, requeues).
    Scheduled,
}

impl QueueName {
    /// Claim-ordering priority; lower sorts first.
    pub const fn priority(self) -> i16 {
        match self {
            Self::CreateEvent => 0,
            Self::Event => 1,
            Self::Retry => 2,
            Self::SearchIndex => 3,
            Self::Scheduled => 4,
        }
    }

    /// Stable textual name used in storage.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CreateEvent => "create-event",
            Self::Event => "event",
            Self::Retry => "retry",
            Self::SearchIndex => "search-index",
            Self::Scheduled => "scheduled",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "create-event" => Ok(Self::CreateEvent),
            "event" => Ok(Self::Event),
            "retry" => Ok(Self::Retry),
            "search-index" => Ok(Self::SearchIndex),
            "scheduled" => Ok(Self::Scheduled),
            _ => Err(format!("unknown queue: {s}")),
        }
    }
}

/// Handler routing key for a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskName {
    /// Run the fan-out planner for a raw event.
    CreateEventProcessor,
    /// Dispatch one event delivery.
    EventProcessor,
    /// Mirror an event into the tokenized search table.
    IndexDocument,
    /// Sweep soft-deleted events past retention.
    RetentionSweep,
}

impl TaskName {
    /// Stable textual name used in storage.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CreateEventProcessor => "create-event-processor",
            Self::EventProcessor => "event-processor",
            Self::IndexDocument => "index-document",
            Self::RetentionSweep => "retention-sweep",
        }
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskName {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "create-event-processor" => Ok(Self::CreateEventProcessor),
            "event-processor" => Ok(Self::EventProcessor),
            "index-document" => Ok(Self::IndexDocument),
            "retention-sweep" => Ok(Self::RetentionSweep),
            _ => Err(format!("unknown task: {s}")),
        }
    }
}

/// One queued unit of work.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct QueueJob {
    /// Unique job id.
    pub id: Uuid,
    /// Queue the job was enqueued on.
    pub queue: QueueName,
    /// Handler routing key.
    pub task: TaskName,
    /// Handler payload.
    pub payload: Value,
    /// Delivery the job belongs to, for bulk deletion by id set.
    pub delivery_id: Option<DeliveryId>,
    /// Earliest time the job may be claimed.
    pub run_at: DateTime<Utc>,
    /// Number of times the job has been claimed.
    pub attempts: i32,
    /// When the job was enqueued.
    pub created_at: DateTime<Utc>,
}

/// Delay-capable, at-least-once job queue.
///
/// The Postgres-backed implementation lives in the storage layer; an
/// in-memory implementation backs tests and single-process deployments.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueues a job, visible after `delay`.
    async fn enqueue(
        &self,
        queue: QueueName,
        task: TaskName,
        payload: Value,
        delivery_id: Option<DeliveryId>,
        delay: Duration,
    ) -> Result<Uuid>;

    /// Claims up to `batch` ready jobs, ordered by (priority, run_at).
    ///
    /// Claimed jobs become invisible for [`VISIBILITY_TIMEOUT`]; jobs not
    /// completed in time are re-claimable (at-least-once).
    async fn claim(&self, batch: usize) -> Result<Vec<QueueJob>>;

    /// Acknowledges a finished job, removing it permanently.
    async fn complete(&self, id: Uuid) -> Result<()>;

    /// Returns a claimed job to the queue, visible again after `delay`.
    async fn release(&self, id: Uuid, delay: Duration) -> Result<()>;

    /// Bulk-deletes pending jobs belonging to the given deliveries.
    /// Returns the number removed.
    ///
    /// Replay and force-resend purge stale retry jobs through this before
    /// re-enqueueing a revived delivery.
    async fn delete_for_deliveries(&self, ids: &[DeliveryId]) -> Result<u64>;
}

/// Checks an enqueue delay against [`MAX_DELAY`].
pub fn validate_delay(delay: Duration) -> Result<()> {
    if delay > MAX_DELAY {
        return Err(CoreError::validation(format!(
            "enqueue delay {}s exceeds the 7-day maximum",
            delay.as_secs()
        )));
    }
    Ok(())
}

/// In-memory work queue for tests and single-process deployments.
///
/// Honors the same ordering, delay, and visibility rules as the Postgres
/// implementation, minus durability.
#[derive(Default)]
pub struct MemoryWorkQueue {
    jobs: Arc<Mutex<HashMap<Uuid, MemoryJob>>>,
}

#[derive(Debug, Clone)]
struct MemoryJob {
    job: QueueJob,
    claimed_at: Option<DateTime<Utc>>,
}

impl MemoryWorkQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs currently queued or claimed.
    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    /// Whether the queue holds no jobs.
    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn enqueue(
        &self,
        queue: QueueName,
        task: TaskName,
        payload: Value,
        delivery_id: Option<DeliveryId>,
        delay: Duration,
    ) -> Result<Uuid> {
        validate_delay(delay)?;

        let now = Utc::now();
        let job = QueueJob {
            id: Uuid::now_v7(),
            queue,
            task,
            payload,
            delivery_id,
            run_at: now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero()),
            attempts: 0,
            created_at: now,
        };
        let id = job.id;
        self.jobs.lock().await.insert(id, MemoryJob { job, claimed_at: None });
        Ok(id)
    }

    async fn claim(&self, batch: usize) -> Result<Vec<QueueJob>> {
        let now = Utc::now();
        let visibility =
            chrono::Duration::from_std(VISIBILITY_TIMEOUT).unwrap_or(chrono::Duration::zero());

        let mut jobs = self.jobs.lock().await;
        let mut ready: Vec<&mut MemoryJob> = jobs
            .values_mut()
            .filter(|entry| {
                entry.job.run_at <= now
                    && entry.claimed_at.is_none_or(|claimed| claimed + visibility <= now)
            })
            .collect();
        ready.sort_by_key(|entry| (entry.job.queue.priority(), entry.job.run_at, entry.job.id));

        let mut claimed = Vec::new();
        for entry in ready.into_iter().take(batch) {
            entry.claimed_at = Some(now);
            entry.job.attempts += 1;
            claimed.push(entry.job.clone());
        }
        Ok(claimed)
    }

    async fn complete(&self, id: Uuid) -> Result<()> {
        self.jobs.lock().await.remove(&id);
        Ok(())
    }

    async fn release(&self, id: Uuid, delay: Duration) -> Result<()> {
        validate_delay(delay)?;
        let mut jobs = self.jobs.lock().await;
        if let Some(entry) = jobs.get_mut(&id) {
            entry.claimed_at = None;
            entry.job.run_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        }
        Ok(())
    }

    async fn delete_for_deliveries(&self, ids: &[DeliveryId]) -> Result<u64> {
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|_, entry| {
            entry.job.delivery_id.is_none_or(|delivery_id| !ids.contains(&delivery_id))
        });
        Ok((before - jobs.len()) as u64)
    }
}
