//! Worker pool consuming one job kind from a [`JobQueue`].

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::{JobError, JobQueue, NextStep, QueueError};
use crate::models::job::{JobKind, JobPayload, JobRecord};

/// Processes payloads of one job kind.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run one attempt. Errors go back to the queue, which decides
    /// between retry and terminal failure.
    async fn process(&self, payload: &JobPayload) -> Result<serde_json::Value, JobError>;

    /// Terminal failure hook, awaited before the job is recorded as failed.
    /// An error leaves the job parked and the hook runs again after a
    /// backoff; the job is never reprocessed.
    async fn on_failed(&self, payload: &JobPayload, error: &JobError) -> Result<(), JobError>;
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Number of independent consumers.
    pub concurrency: usize,
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Upper bound on waiting for in-flight attempts during close.
    pub shutdown_timeout: Duration,
    /// Active jobs without a heartbeat for this long are considered
    /// abandoned. Consumers renew their claim at a third of it.
    pub stalled_after: Duration,
    /// How often to look for abandoned jobs.
    pub stalled_check_interval: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval: Duration::from_millis(1000),
            shutdown_timeout: Duration::from_secs(30),
            stalled_after: Duration::from_secs(300),
            stalled_check_interval: Duration::from_secs(30),
        }
    }
}

impl WorkerOptions {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_stalled_after(mut self, stalled_after: Duration, check_interval: Duration) -> Self {
        self.stalled_after = stalled_after;
        self.stalled_check_interval = check_interval;
        self
    }

    fn heartbeat(&self) -> Duration {
        (self.stalled_after / 3).max(Duration::from_millis(10))
    }
}

/// Handle for a running worker pool.
pub struct WorkerHandle {
    kind: JobKind,
    shutdown_tx: watch::Sender<bool>,
    tasks: JoinSet<Result<(), QueueError>>,
    shutdown_timeout: Duration,
}

impl WorkerHandle {
    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Resolves when a consumer stops on its own, which only happens on a
    /// queue infrastructure error or a panic. The caller should treat this
    /// as fatal.
    pub async fn stopped(&mut self) -> Result<(), QueueError> {
        match self.tasks.join_next().await {
            Some(Ok(result)) => result,
            Some(Err(e)) => {
                error!(job_kind = %self.kind, error = %e, "Worker task panicked");
                Err(QueueError::WorkerPanicked(e.to_string()))
            }
            None => std::future::pending().await,
        }
    }

    /// Stop claiming new jobs, wait up to the shutdown timeout for in-flight
    /// attempts, then release the pool. Returns the first consumer error.
    pub async fn close(mut self) -> Result<(), QueueError> {
        info!(job_kind = %self.kind, "Closing worker pool");
        let _ = self.shutdown_tx.send(true);

        let mut first_error = None;
        let drained = tokio::time::timeout(self.shutdown_timeout, async {
            while let Some(joined) = self.tasks.join_next().await {
                let error = match joined {
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => e,
                    Err(e) => {
                        error!(job_kind = %self.kind, error = %e, "Worker task panicked");
                        QueueError::WorkerPanicked(e.to_string())
                    }
                };
                if first_error.is_none() {
                    first_error = Some(error);
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                job_kind = %self.kind,
                timeout_secs = self.shutdown_timeout.as_secs(),
                remaining = self.tasks.len(),
                "Shutdown timeout reached, aborting in-flight jobs"
            );
            self.tasks.abort_all();
        }

        info!(job_kind = %self.kind, "Worker pool stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl JobQueue {
    /// Start `options.concurrency` consumers for `kind`, plus a maintenance
    /// task that recovers stalled jobs.
    pub fn create_worker(
        self: &Arc<Self>,
        kind: JobKind,
        handler: Arc<dyn JobHandler>,
        options: WorkerOptions,
    ) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        let concurrency = options.concurrency.max(1);

        for consumer in 0..concurrency {
            let queue = Arc::clone(self);
            let handler = Arc::clone(&handler);
            let shutdown = shutdown_rx.clone();
            let poll_interval = options.poll_interval;
            let heartbeat = options.heartbeat();
            tasks.spawn(async move {
                consume(queue, kind, handler, poll_interval, heartbeat, shutdown, consumer).await
            });
        }

        let queue = Arc::clone(self);
        let shutdown = shutdown_rx.clone();
        let stalled_after = options.stalled_after;
        let interval = options.stalled_check_interval;
        tasks.spawn(async move { watch_stalled(queue, kind, stalled_after, interval, shutdown).await });

        info!(
            job_kind = %kind,
            concurrency,
            poll_interval_ms = options.poll_interval.as_millis() as u64,
            "Worker pool started"
        );

        WorkerHandle {
            kind,
            shutdown_tx,
            tasks,
            shutdown_timeout: options.shutdown_timeout,
        }
    }
}

/// One consumer: claim, process, report, repeat.
async fn consume(
    queue: Arc<JobQueue>,
    kind: JobKind,
    handler: Arc<dyn JobHandler>,
    poll_interval: Duration,
    heartbeat: Duration,
    mut shutdown: watch::Receiver<bool>,
    consumer: usize,
) -> Result<(), QueueError> {
    debug!(job_kind = %kind, consumer, "Consumer started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        match queue.claim(kind).await {
            Ok(Some(job)) => run_attempt(&queue, handler.as_ref(), job, heartbeat).await?,
            Ok(None) => {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = sleep(poll_interval) => {}
                }
            }
            Err(e) => {
                error!(job_kind = %kind, consumer, error = %e, "Failed to claim job");
                return Err(e);
            }
        }
    }

    debug!(job_kind = %kind, consumer, "Consumer stopped");
    Ok(())
}

/// Run one attempt to completion and hand the outcome to the queue.
async fn run_attempt(
    queue: &JobQueue,
    handler: &dyn JobHandler,
    job: JobRecord,
    heartbeat: Duration,
) -> Result<(), QueueError> {
    if let Some(error) = job.pending_failure.clone() {
        info!(
            job_id = %job.id,
            job_kind = %job.kind,
            item_id = %job.payload.item_id(),
            error = %error,
            "Running failure hook again"
        );
        return fail_job(queue, handler, job, error).await;
    }

    let attempt = job.attempts_made + 1;
    let kind = job.kind.to_string();
    let start = Instant::now();

    info!(
        job_id = %job.id,
        job_kind = %job.kind,
        item_id = %job.payload.item_id(),
        attempt,
        max_attempts = job.max_attempts,
        "Processing job"
    );

    let Some(result) = process_with_heartbeat(queue, handler, &job, heartbeat).await else {
        warn!(
            job_id = %job.id,
            item_id = %job.payload.item_id(),
            attempt,
            "Lost claim on job, attempt abandoned"
        );
        return Ok(());
    };
    metrics::histogram!("queue_job_processing_seconds", "kind" => kind.clone())
        .record(start.elapsed().as_secs_f64());

    let job_id = job.id;
    match result {
        Ok(value) => {
            info!(
                job_id = %job.id,
                item_id = %job.payload.item_id(),
                attempt,
                duration_ms = start.elapsed().as_millis() as u64,
                "Job completed"
            );
            if queue.complete(job, value).await? {
                metrics::counter!("queue_jobs_completed_total", "kind" => kind).increment(1);
            } else {
                warn!(%job_id, "Lost claim on job, outcome dropped");
            }
        }
        Err(error) => match queue.next_step(&job, &error) {
            NextStep::Retry(delay) => {
                warn!(
                    job_id = %job.id,
                    item_id = %job.payload.item_id(),
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %error,
                    "Job attempt failed, retry scheduled"
                );
                if queue.retry(job, &error, delay).await? {
                    metrics::counter!("queue_jobs_retried_total", "kind" => kind).increment(1);
                } else {
                    warn!(%job_id, "Lost claim on job, outcome dropped");
                }
            }
            NextStep::Fail => {
                error!(
                    job_id = %job.id,
                    item_id = %job.payload.item_id(),
                    attempt,
                    error = %error,
                    "Job failed permanently"
                );
                fail_job(queue, handler, job, error).await?;
            }
        },
    }

    Ok(())
}

/// Drive one `process` call, renewing the claim every `heartbeat`.
/// Returns `None` once the claim is lost to stall recovery.
async fn process_with_heartbeat(
    queue: &JobQueue,
    handler: &dyn JobHandler,
    job: &JobRecord,
    heartbeat: Duration,
) -> Option<Result<serde_json::Value, JobError>> {
    let process = handler.process(&job.payload);
    tokio::pin!(process);

    let mut ticker = tokio::time::interval(heartbeat);
    ticker.tick().await;

    loop {
        tokio::select! {
            result = &mut process => return Some(result),
            _ = ticker.tick() => match queue.renew(job).await {
                Ok(true) => {}
                Ok(false) => return None,
                Err(e) => warn!(job_id = %job.id, error = %e, "Failed to renew job claim"),
            },
        }
    }
}

/// Run the failure hook, then record the failure. If the hook errors the
/// job is parked and comes back to run only the hook.
async fn fail_job(
    queue: &JobQueue,
    handler: &dyn JobHandler,
    job: JobRecord,
    error: JobError,
) -> Result<(), QueueError> {
    let job_id = job.id;
    let kind = job.kind.to_string();

    if !queue.renew(&job).await? {
        warn!(%job_id, "Lost claim on job, failure hook skipped");
        return Ok(());
    }

    match handler.on_failed(&job.payload, &error).await {
        Ok(()) => {
            if queue.fail(job, &error).await? {
                metrics::counter!("queue_jobs_failed_total", "kind" => kind).increment(1);
            } else {
                warn!(%job_id, "Lost claim on job, outcome dropped");
            }
        }
        Err(hook_error) => {
            let delay = job.backoff.delay_for(job.attempts_made.max(1));
            warn!(
                %job_id,
                item_id = %job.payload.item_id(),
                retry_in_ms = delay.as_millis() as u64,
                error = %hook_error,
                "Failure hook failed, job parked"
            );
            if !queue.defer_failure(job, &error, delay).await? {
                warn!(%job_id, "Lost claim on job, outcome dropped");
            }
        }
    }
    Ok(())
}

async fn watch_stalled(
    queue: Arc<JobQueue>,
    kind: JobKind,
    stalled_after: Duration,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), QueueError> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = sleep(interval) => {}
        }
        if *shutdown.borrow() {
            break;
        }

        match queue.recover_stalled(kind, stalled_after).await {
            Ok(0) => {}
            Ok(recovered) => info!(job_kind = %kind, recovered, "Recovered stalled jobs"),
            Err(e) => warn!(job_kind = %kind, error = %e, "Stalled job check failed"),
        }
    }
    Ok(())
}
