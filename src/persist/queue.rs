//! Durable Retry Queue
//!
//! Persists pending jobs to a JSON file and drains them on a background
//! tokio task every `interval`. A job that does not complete is kept and
//! retried on the next pass until its retry budget is spent.
//!
//! # Job lifecycle
//!
//! ```text
//! put ──▶ pending ──run──▶ Done ──▶ removed
//!            ▲               │
//!            └─ RetryLater ◀─┤
//!            └─ Failed     ◀─┘   (attempts > max_retries ──▶ dropped)
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{read_json, write_json_atomic};
use crate::error::{Error, Result};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the retry queue
#[derive(Debug, Clone)]
pub struct RetryQueueConfig {
    /// Interval between drain passes
    pub interval: Duration,

    /// Failed executions tolerated before a job is dropped (None = unbounded)
    pub max_retries: Option<u32>,
}

impl Default for RetryQueueConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60), // 1 hour
            max_retries: None,
        }
    }
}

// =============================================================================
// Jobs
// =============================================================================

/// A job as stored in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob<J> {
    pub id: Uuid,
    pub job: J,
    /// Number of executions that did not complete
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Outcome of one job execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Finished, remove from the queue
    Done,
    /// Expected "not ready yet" condition, try again next pass
    RetryLater(String),
    /// Unexpected failure, try again next pass
    Failed(String),
}

/// Executes queued jobs.
#[async_trait]
pub trait JobRunner<J>: Send + Sync {
    async fn run(&self, job: &J) -> JobOutcome;
}

/// Summary of a drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub completed: usize,
    pub retried: usize,
    pub dropped: usize,
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

// =============================================================================
// Retry Queue
// =============================================================================

/// Durable job queue with a background drain worker.
pub struct RetryQueue<J> {
    config: RetryQueueConfig,
    path: Option<PathBuf>,
    jobs: Mutex<Vec<QueuedJob<J>>>,
    worker: Mutex<Option<Worker>>,
}

impl<J> RetryQueue<J>
where
    J: Clone + std::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Open (or create) a queue persisted at `path`.
    pub fn open(path: &Path, config: RetryQueueConfig) -> Result<Self> {
        let jobs: Vec<QueuedJob<J>> = read_json(path)?.unwrap_or_default();

        debug!(
            path = %path.display(),
            pending = jobs.len(),
            "Opened retry queue"
        );

        Ok(Self {
            config,
            path: Some(path.to_path_buf()),
            jobs: Mutex::new(jobs),
            worker: Mutex::new(None),
        })
    }

    /// Create a queue that lives only in memory.
    pub fn in_memory(config: RetryQueueConfig) -> Self {
        Self {
            config,
            path: None,
            jobs: Mutex::new(Vec::new()),
            worker: Mutex::new(None),
        }
    }

    /// Enqueue a job, returning its id.
    pub fn put(&self, job: J) -> Result<Uuid> {
        let mut jobs = self.jobs.lock();
        self.push_locked(&mut jobs, job)
    }

    /// Enqueue a job unless a pending one matches `is_same`.
    ///
    /// Returns `None` when a matching job was already queued.
    pub fn put_unless_pending<F>(&self, job: J, is_same: F) -> Result<Option<Uuid>>
    where
        F: Fn(&J) -> bool,
    {
        let mut jobs = self.jobs.lock();
        if let Some(existing) = jobs.iter().find(|queued| is_same(&queued.job)) {
            debug!(job_id = %existing.id, "Matching job already pending");
            return Ok(None);
        }
        self.push_locked(&mut jobs, job).map(Some)
    }

    fn push_locked(&self, jobs: &mut Vec<QueuedJob<J>>, job: J) -> Result<Uuid> {
        let queued = QueuedJob {
            id: Uuid::new_v4(),
            job,
            attempts: 0,
            enqueued_at: Utc::now(),
            last_error: None,
        };
        let id = queued.id;

        jobs.push(queued);
        if let Err(e) = self.persist(jobs) {
            jobs.pop();
            return Err(e);
        }

        debug!(job_id = %id, pending = jobs.len(), "Queued job");
        Ok(id)
    }

    /// Copy of the pending jobs in queue order.
    pub fn pending(&self) -> Vec<QueuedJob<J>> {
        self.jobs.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    /// Start the background worker. Starting a running queue is a no-op.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<R>(self: &Arc<Self>, runner: Arc<R>) -> Result<()>
    where
        R: JobRunner<J> + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Config(format!("retry queue needs a tokio runtime: {}", e)))?;

        let mut worker = self.worker.lock();
        if worker.is_some() {
            debug!("Retry queue worker already running");
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let handle = runtime.spawn(run_worker(self.clone(), runner, cancel.clone()));
        *worker = Some(Worker { cancel, handle });

        info!(
            interval = ?self.config.interval,
            max_retries = ?self.config.max_retries,
            "Started retry queue worker"
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Stop the worker and wait until it has finished its current pass.
    pub async fn stop(&self) {
        let worker = self.worker.lock().take();
        let Some(worker) = worker else {
            return;
        };

        worker.cancel.cancel();
        if let Err(e) = worker.handle.await {
            error!("Retry queue worker ended abnormally: {}", e);
        }
        info!("Stopped retry queue worker");
    }

    /// Ask the worker to stop without waiting for it.
    pub(crate) fn signal_stop(&self) {
        if let Some(worker) = self.worker.lock().as_ref() {
            worker.cancel.cancel();
        }
    }

    /// Run every currently pending job once.
    pub async fn drain<R>(&self, runner: &R) -> DrainReport
    where
        R: JobRunner<J> + ?Sized,
    {
        let batch = self.pending();
        let mut report = DrainReport::default();

        for queued in batch {
            match runner.run(&queued.job).await {
                JobOutcome::Done => {
                    debug!(job_id = %queued.id, "Job completed");
                    self.complete(queued.id);
                    report.completed += 1;
                }
                JobOutcome::RetryLater(reason) => {
                    debug!(job_id = %queued.id, reason = %reason, "Job deferred");
                    if self.record_failure(queued.id, reason) {
                        report.dropped += 1;
                    } else {
                        report.retried += 1;
                    }
                }
                JobOutcome::Failed(reason) => {
                    warn!(job_id = %queued.id, error = %reason, "Job failed");
                    if self.record_failure(queued.id, reason) {
                        report.dropped += 1;
                    } else {
                        report.retried += 1;
                    }
                }
            }
        }

        report
    }

    fn complete(&self, id: Uuid) {
        let mut jobs = self.jobs.lock();
        jobs.retain(|queued| queued.id != id);
        if let Err(e) = self.persist(&jobs) {
            error!(job_id = %id, "Failed to persist completed job: {}", e);
        }
    }

    /// Count a failed execution. Returns true when the job was dropped.
    fn record_failure(&self, id: Uuid, reason: String) -> bool {
        let mut jobs = self.jobs.lock();
        let Some(index) = jobs.iter().position(|queued| queued.id == id) else {
            return false;
        };

        let queued = &mut jobs[index];
        queued.attempts += 1;
        queued.last_error = Some(reason);

        let exhausted = self
            .config
            .max_retries
            .is_some_and(|max| queued.attempts > max);
        if exhausted {
            let dropped = jobs.remove(index);
            warn!(
                job_id = %dropped.id,
                job = ?dropped.job,
                attempts = dropped.attempts,
                "Retry budget exhausted, dropping job"
            );
        }

        if let Err(e) = self.persist(&jobs) {
            error!(job_id = %id, "Failed to persist job retry state: {}", e);
        }
        exhausted
    }

    fn persist(&self, jobs: &[QueuedJob<J>]) -> Result<()> {
        match &self.path {
            Some(path) => write_json_atomic(path, &jobs),
            None => Ok(()),
        }
    }
}

impl<J> std::fmt::Debug for RetryQueue<J> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryQueue")
            .field("config", &self.config)
            .field("path", &self.path)
            .field("pending", &self.jobs.lock().len())
            .field("running", &self.worker.lock().is_some())
            .finish()
    }
}

async fn run_worker<J, R>(queue: Arc<RetryQueue<J>>, runner: Arc<R>, cancel: CancellationToken)
where
    J: Clone + std::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
    R: JobRunner<J> + 'static,
{
    // First pass one interval after start
    let period = queue.config.interval;
    let mut tick = interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Retry queue worker shutting down");
                break;
            }

            _ = tick.tick() => {
                if queue.is_empty() {
                    continue;
                }

                let report = queue.drain(runner.as_ref()).await;
                info!(
                    completed = report.completed,
                    retried = report.retried,
                    dropped = report.dropped,
                    "Retry queue pass finished"
                );
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
