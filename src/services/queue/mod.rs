//! Durable job queue with priorities, delays, bounded retries and retention.
//!
//! The queue owns all job bookkeeping. Handlers only return success or a
//! [`JobError`]; the queue decides between retrying with backoff and the
//! terminal failure path.

pub mod backoff;
pub mod memory;
pub mod redis_store;
pub mod worker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::models::job::{JobKind, JobPayload, JobRecord, JobState, JobStatusView, PayloadError};

pub use backoff::Backoff;
pub use memory::MemoryJobStore;
pub use redis_store::RedisJobStore;
pub use worker::{JobHandler, WorkerHandle, WorkerOptions};

/// Largest accepted priority value (exclusive bound is 2^21).
pub const MAX_PRIORITY: u32 = (1 << 21) - 1;

/// How many finished jobs of one outcome to keep, and for how long.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeepPolicy {
    pub count: usize,
    pub age: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Retention {
    pub completed: KeepPolicy,
    pub failed: KeepPolicy,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            completed: KeepPolicy {
                count: 100,
                age: Duration::from_secs(24 * 3600),
            },
            failed: KeepPolicy {
                count: 1000,
                age: Duration::from_secs(7 * 24 * 3600),
            },
        }
    }
}

/// Queue-wide policy applied to every job it accepts.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub retention: Retention,
    /// Whether AI output that fails schema checks earns another attempt.
    pub retry_invalid_output: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
            retention: Retention::default(),
            retry_invalid_output: true,
        }
    }
}

/// Per-job enqueue options.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnqueueOptions {
    /// Lower runs first; defaults to 0.
    pub priority: Option<u32>,
    pub delay: Option<Duration>,
}

/// Number of jobs in each state for one kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Outcome of one failed attempt, as reported by a handler.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "class", content = "message", rename_all = "snake_case")]
pub enum JobError {
    /// Provider, storage or database hiccup. Retried.
    #[error("{0}")]
    Transient(String),

    /// Structurally invalid AI output. Retried only when the queue's
    /// `retry_invalid_output` policy allows it.
    #[error("Invalid output: {0}")]
    InvalidOutput(String),

    /// Retrying cannot help. Fails the job immediately.
    #[error("{0}")]
    Permanent(String),
}

/// What the queue does with a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    Retry(Duration),
    Fail,
}

/// Persistence for job records and the per-state indexes.
///
/// Every claim carries a lease token. Writes made on behalf of a claim
/// pass that token and are refused once the claim has been lost, so a job
/// recovered from a stalled consumer is never finished twice.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Next FIFO sequence number for `kind`.
    async fn next_seq(&self, kind: JobKind) -> Result<u64, QueueError>;

    /// Persist `record` and index it as waiting or delayed per its state,
    /// releasing any claim. With `lease`, succeeds only while that claim
    /// still holds the job.
    async fn schedule(&self, record: &JobRecord, lease: Option<Uuid>) -> Result<bool, QueueError>;

    /// Promote due delayed jobs, then claim the best waiting job under a
    /// fresh lease.
    async fn claim(&self, kind: JobKind, now: DateTime<Utc>) -> Result<Option<JobRecord>, QueueError>;

    /// Refresh the claim's heartbeat. Returns `false` once it is lost.
    async fn renew(&self, kind: JobKind, id: Uuid, lease: Uuid, now: DateTime<Utc>) -> Result<bool, QueueError>;

    /// Record a completed or failed job and trim that outcome's history.
    /// Succeeds only while `lease` still holds the job.
    async fn finish(&self, record: &JobRecord, lease: Uuid, keep: KeepPolicy) -> Result<bool, QueueError>;

    async fn load(&self, kind: JobKind, id: Uuid) -> Result<Option<JobRecord>, QueueError>;

    /// Active jobs whose last heartbeat is older than `heartbeat_before`,
    /// with their current lease.
    async fn stalled(&self, kind: JobKind, heartbeat_before: DateTime<Utc>) -> Result<Vec<JobRecord>, QueueError>;

    async fn counts(&self, kind: JobKind) -> Result<QueueCounts, QueueError>;

    async fn ping(&self) -> Result<(), QueueError>;
}

/// Job queue service. Each instance owns its backing store, so tests can
/// run several side by side.
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    options: QueueOptions,
}

fn delay_until(now: DateTime<Utc>, delay: Duration) -> Result<DateTime<Utc>, QueueError> {
    chrono::Duration::from_std(delay)
        .map(|d| now + d)
        .map_err(|e| QueueError::InvalidOptions(format!("delay out of range: {e}")))
}

/// Count the attempt that just ended, unless it was already counted when
/// its failure was first deferred.
fn count_attempt(record: &mut JobRecord) {
    if record.pending_failure.is_none() {
        record.attempts_made += 1;
    }
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, options: QueueOptions) -> Self {
        Self { store, options }
    }

    /// Redis-backed queue using `prefix` to namespace its keys.
    pub fn redis(redis_url: &str, prefix: &str, options: QueueOptions) -> Result<Self, QueueError> {
        let store = RedisJobStore::new(redis_url, prefix)?;
        Ok(Self::new(Arc::new(store), options))
    }

    pub fn in_memory(options: QueueOptions) -> Self {
        Self::new(Arc::new(MemoryJobStore::new()), options)
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    /// Validate and enqueue a job, returning its id.
    pub async fn enqueue(&self, payload: JobPayload, options: EnqueueOptions) -> Result<Uuid, QueueError> {
        payload.validate()?;

        let priority = options.priority.unwrap_or(0);
        if priority > MAX_PRIORITY {
            return Err(QueueError::InvalidOptions(format!(
                "priority {priority} exceeds {MAX_PRIORITY}"
            )));
        }

        let kind = payload.kind();
        let delay = options.delay.unwrap_or(Duration::ZERO);
        let now = Utc::now();
        let ready_at = delay_until(now, delay)?;
        let seq = self.store.next_seq(kind).await?;

        let record = JobRecord {
            id: Uuid::new_v4(),
            kind,
            payload,
            state: if delay.is_zero() { JobState::Waiting } else { JobState::Delayed },
            priority,
            seq,
            attempts_made: 0,
            max_attempts: self.options.max_attempts.max(1),
            backoff: self.options.backoff,
            created_at: now,
            ready_at,
            processed_at: None,
            finished_at: None,
            return_value: None,
            failed_reason: None,
            lease: None,
            pending_failure: None,
        };

        self.store.schedule(&record, None).await?;

        metrics::counter!("queue_jobs_enqueued_total", "kind" => kind.to_string()).increment(1);
        tracing::info!(
            job_id = %record.id,
            job_kind = %kind,
            item_id = %record.payload.item_id(),
            priority,
            delay_ms = delay.as_millis() as u64,
            "Job enqueued"
        );

        Ok(record.id)
    }

    /// Decode an untyped payload for `kind`; malformed payloads are rejected
    /// here and never reach a worker.
    pub async fn enqueue_json(
        &self,
        kind: JobKind,
        data: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<Uuid, QueueError> {
        let payload = JobPayload::from_json(kind, data)?;
        self.enqueue(payload, options).await
    }

    pub async fn job_status(&self, kind: JobKind, id: Uuid) -> Result<Option<JobStatusView>, QueueError> {
        Ok(self.store.load(kind, id).await?.map(|r| r.status_view()))
    }

    pub async fn counts(&self, kind: JobKind) -> Result<QueueCounts, QueueError> {
        self.store.counts(kind).await
    }

    /// Check backing store connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), QueueError> {
        self.store.ping().await
    }

    pub(crate) async fn claim(&self, kind: JobKind) -> Result<Option<JobRecord>, QueueError> {
        self.store.claim(kind, Utc::now()).await
    }

    /// Heartbeat for a claimed job. `false` means the claim was lost and
    /// whatever the attempt produces will be discarded.
    pub(crate) async fn renew(&self, record: &JobRecord) -> Result<bool, QueueError> {
        match record.lease {
            Some(lease) => self.store.renew(record.kind, record.id, lease, Utc::now()).await,
            None => Ok(false),
        }
    }

    /// Retry or fail, given the attempt that just failed.
    pub fn next_step(&self, record: &JobRecord, error: &JobError) -> NextStep {
        let attempts_made = record.attempts_made + 1;
        let retryable = match error {
            JobError::Transient(_) => true,
            JobError::InvalidOutput(_) => self.options.retry_invalid_output,
            JobError::Permanent(_) => false,
        };

        if retryable && attempts_made < record.max_attempts {
            NextStep::Retry(record.backoff.delay_for(attempts_made))
        } else {
            NextStep::Fail
        }
    }

    pub(crate) async fn complete(&self, mut record: JobRecord, value: serde_json::Value) -> Result<bool, QueueError> {
        let Some(lease) = record.lease.take() else {
            return Ok(false);
        };
        record.attempts_made += 1;
        record.state = JobState::Completed;
        record.finished_at = Some(Utc::now());
        record.return_value = Some(value);
        record.failed_reason = None;
        self.store.finish(&record, lease, self.options.retention.completed).await
    }

    pub(crate) async fn retry(&self, mut record: JobRecord, error: &JobError, delay: Duration) -> Result<bool, QueueError> {
        let Some(lease) = record.lease.take() else {
            return Ok(false);
        };
        record.attempts_made += 1;
        record.failed_reason = Some(error.to_string());
        record.state = if delay.is_zero() { JobState::Waiting } else { JobState::Delayed };
        record.ready_at = delay_until(Utc::now(), delay)?;
        self.store.schedule(&record, Some(lease)).await
    }

    /// Park a job whose failure hook did not succeed. It comes back after
    /// `delay` to run only the hook again.
    pub(crate) async fn defer_failure(
        &self,
        mut record: JobRecord,
        error: &JobError,
        delay: Duration,
    ) -> Result<bool, QueueError> {
        let Some(lease) = record.lease.take() else {
            return Ok(false);
        };
        count_attempt(&mut record);
        record.failed_reason = Some(error.to_string());
        record.pending_failure = Some(error.clone());
        record.state = if delay.is_zero() { JobState::Waiting } else { JobState::Delayed };
        record.ready_at = delay_until(Utc::now(), delay)?;
        self.store.schedule(&record, Some(lease)).await
    }

    pub(crate) async fn fail(&self, mut record: JobRecord, error: &JobError) -> Result<bool, QueueError> {
        let Some(lease) = record.lease.take() else {
            return Ok(false);
        };
        count_attempt(&mut record);
        record.pending_failure = None;
        record.state = JobState::Failed;
        record.finished_at = Some(Utc::now());
        record.failed_reason = Some(error.to_string());
        self.store.finish(&record, lease, self.options.retention.failed).await
    }

    /// Put jobs whose consumer stopped renewing its claim back on the
    /// waiting set. The lost attempt counts against `max_attempts`; a job
    /// with none left comes back only to run its failure hook.
    pub async fn recover_stalled(&self, kind: JobKind, stalled_after: Duration) -> Result<usize, QueueError> {
        let now = Utc::now();
        let cutoff = chrono::Duration::from_std(stalled_after)
            .map(|d| now - d)
            .map_err(|e| QueueError::InvalidOptions(format!("stall threshold out of range: {e}")))?;

        let mut recovered = 0;
        for mut record in self.store.stalled(kind, cutoff).await? {
            let Some(lease) = record.lease.take() else {
                continue;
            };

            if record.pending_failure.is_none() {
                let error = JobError::Transient("job stalled: worker stopped renewing its claim".to_string());
                record.attempts_made += 1;
                record.failed_reason = Some(error.to_string());
                if record.attempts_made >= record.max_attempts {
                    record.pending_failure = Some(error);
                }
            }
            record.state = JobState::Waiting;
            record.ready_at = now;
            record.processed_at = None;

            if self.store.schedule(&record, Some(lease)).await? {
                recovered += 1;
                tracing::warn!(
                    job_id = %record.id,
                    job_kind = %kind,
                    item_id = %record.payload.item_id(),
                    attempts_made = record.attempts_made,
                    exhausted = record.pending_failure.is_some(),
                    "Recovered stalled job"
                );
            }
        }
        Ok(recovered)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Invalid job payload: {0}")]
    InvalidPayload(#[from] PayloadError),

    #[error("Invalid enqueue options: {0}")]
    InvalidOptions(String),

    #[error("Worker task panicked: {0}")]
    WorkerPanicked(String),
}
