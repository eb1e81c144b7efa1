//! Transfer engine: job queue, admission gate, state transitions, retention.
//!
//! Every task of every job waits on one process-wide semaphore of size
//! `max_concurrency` before it may stream. A task is marked `transferring`
//! only once it holds a permit, and it releases the permit only after its
//! terminal state is recorded, so the number of `transferring` tasks never
//! exceeds the limit.
//!
//! Each job record is mutated under its own lock. Every mutation goes through
//! [`JobRecord::apply`], which re-derives the job aggregate and publishes the
//! resulting progress event before the lock is released.

use ferry_core::config::TransferConfig;
use ferry_core::types::{ConflictPolicy, StorageLocation, TransferRef};
use ferry_core::{FerryError, FerryResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::executor::{TaskObserver, TransferExecutor};
use crate::job::{
    now_secs, JobProgress, JobStatus, TaskSpec, TaskStatus, TransferJob, TransferTask,
};
use crate::progress::{JobSubscription, ProgressBroadcaster, Resync, TaskEvent};

/// Capacity of the process-wide lifecycle channel
const LIFECYCLE_BUFFER: usize = 1024;

/// Returned by [`TransferEngine::submit`].
///
/// `progress_channel` identifies the job's progress stream for
/// [`TransferEngine::subscribe`]; it is the job id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub job_id: String,
    pub progress_channel: String,
}

/// Emitted on the process-wide lifecycle stream whenever a job's derived
/// status changes (including its creation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: JobProgress,
}

#[derive(Debug, Clone)]
struct Settings {
    max_concurrency: usize,
    retention_secs: u64,
    max_retained: usize,
    progress_buffer: usize,
}

struct JobRecord {
    job: Mutex<TransferJob>,
    cancel: CancellationToken,
    progress: ProgressBroadcaster,
    lifecycle: broadcast::Sender<JobEvent>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl JobRecord {
    fn snapshot(&self) -> TransferJob {
        lock(&self.job).clone()
    }

    /// Mutate task `index`; if `f` reports a change, refresh the aggregate
    /// and publish while still holding the lock.
    fn apply<F>(&self, index: usize, f: F) -> bool
    where
        F: FnOnce(&mut TransferTask, u64) -> bool,
    {
        let now = now_secs();
        let mut job = lock(&self.job);
        let before = job.status;
        let changed = match job.tasks.get_mut(index) {
            Some(task) => f(task, now),
            None => false,
        };
        if !changed {
            return false;
        }

        job.refresh(now);
        if let Some(event) = TaskEvent::from_job(&job, index) {
            self.progress.publish(event);
        }
        if job.status != before {
            info!(
                job_id = %job.job_id,
                status = %job.status,
                loaded = job.progress.loaded_bytes,
                total = job.progress.total_bytes,
                "job status changed"
            );
            let _ = self.lifecycle.send(JobEvent {
                job_id: job.job_id.clone(),
                status: job.status,
                progress: job.progress,
            });
        }
        true
    }

    /// Move a queued task to `transferring`. `None` if it was cancelled first.
    ///
    /// `cancel` fires the token under the job lock, so checking it here under
    /// the same lock means a task queued at cancellation never starts.
    fn begin(&self, index: usize) -> Option<TransferTask> {
        let cancel = &self.cancel;
        let started = self.apply(index, |task, now| {
            !cancel.is_cancelled()
                && task.status == TaskStatus::Queued
                && task.transition(TaskStatus::Transferring, now)
        });
        if !started {
            return None;
        }
        lock(&self.job).tasks.get(index).cloned()
    }

    fn subscription(self: &Arc<Self>) -> JobSubscription {
        let record = self.clone();
        let resync: Resync = Arc::new(move || {
            let job = lock(&record.job);
            (job.clone(), record.progress.receiver())
        });
        let (snapshot, rx) = resync();
        JobSubscription::new(snapshot, rx, resync)
    }
}

/// [`TaskObserver`] bound to one task of one job
struct TaskSlot {
    record: Arc<JobRecord>,
    index: usize,
}

impl TaskObserver for TaskSlot {
    fn size_known(&self, size: u64) {
        self.record.apply(self.index, |task, _| task.record_size(size));
    }

    fn destination_changed(&self, dest: &TransferRef) {
        self.record.apply(self.index, |task, _| {
            if task.status != TaskStatus::Transferring || task.dest == *dest {
                return false;
            }
            task.dest = dest.clone();
            true
        });
    }

    fn destination_opened(&self) {
        self.record.apply(self.index, |task, _| {
            if task.partial_destination || task.status != TaskStatus::Transferring {
                return false;
            }
            task.partial_destination = true;
            true
        });
    }

    fn progress(&self, bytes_transferred: u64) {
        self.record
            .apply(self.index, |task, _| task.record_progress(bytes_transferred));
    }
}

struct EngineInner {
    executor: TransferExecutor,
    admission: Arc<Semaphore>,
    jobs: Mutex<HashMap<String, Arc<JobRecord>>>,
    lifecycle: broadcast::Sender<JobEvent>,
    settings: Settings,
}

/// Owns all jobs. Cheap to clone.
#[derive(Clone)]
pub struct TransferEngine {
    inner: Arc<EngineInner>,
}

impl TransferEngine {
    pub fn new(executor: TransferExecutor, config: &TransferConfig) -> FerryResult<Self> {
        config.validate()?;
        let settings = Settings {
            max_concurrency: config.max_concurrency,
            retention_secs: config.job_retention_secs,
            max_retained: config.max_retained_jobs,
            progress_buffer: config.progress_buffer,
        };
        info!(
            max_concurrency = settings.max_concurrency,
            retention_secs = settings.retention_secs,
            max_retained = settings.max_retained,
            "transfer engine ready"
        );
        let (lifecycle, _) = broadcast::channel(LIFECYCLE_BUFFER);
        Ok(Self {
            inner: Arc::new(EngineInner {
                executor,
                admission: Arc::new(Semaphore::new(settings.max_concurrency)),
                jobs: Mutex::new(HashMap::new()),
                lifecycle,
                settings,
            }),
        })
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.settings.max_concurrency
    }

    pub fn executor(&self) -> &TransferExecutor {
        &self.inner.executor
    }

    /// All locations: local first, then object.
    pub async fn locations(&self) -> Vec<StorageLocation> {
        self.inner.executor.locations().await
    }

    // ── Submission ────────────────────────────────────────────────────────────

    /// Create a job with every task queued and start admitting its tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn submit(&self, specs: Vec<TaskSpec>, policy: ConflictPolicy) -> FerryResult<SubmitReceipt> {
        if specs.is_empty() {
            return Err(FerryError::InvalidRequest(
                "a job needs at least one task".into(),
            ));
        }
        self.purge_expired();

        let job_id = uuid::Uuid::new_v4().to_string();
        let job = TransferJob::new(job_id.clone(), specs, policy, now_secs());
        let task_count = job.tasks.len();
        let created = JobEvent {
            job_id: job_id.clone(),
            status: job.status,
            progress: job.progress,
        };

        let record = Arc::new(JobRecord {
            job: Mutex::new(job),
            cancel: CancellationToken::new(),
            progress: ProgressBroadcaster::new(self.inner.settings.progress_buffer),
            lifecycle: self.inner.lifecycle.clone(),
        });
        lock(&self.inner.jobs).insert(job_id.clone(), record.clone());
        let _ = self.inner.lifecycle.send(created);
        info!(job_id = %job_id, tasks = task_count, ?policy, "job submitted");

        for index in 0..task_count {
            tokio::spawn(run_task(self.inner.clone(), record.clone(), index));
        }

        Ok(SubmitReceipt {
            progress_channel: job_id.clone(),
            job_id,
        })
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    fn record(&self, job_id: &str) -> FerryResult<Arc<JobRecord>> {
        lock(&self.inner.jobs)
            .get(job_id)
            .cloned()
            .ok_or_else(|| FerryError::NotFound(format!("job {job_id}")))
    }

    /// Consistent snapshot of a job.
    pub fn get(&self, job_id: &str) -> FerryResult<TransferJob> {
        Ok(self.record(job_id)?.snapshot())
    }

    /// Snapshots of every retained job, newest first.
    pub fn list_jobs(&self) -> Vec<TransferJob> {
        let records: Vec<Arc<JobRecord>> = lock(&self.inner.jobs).values().cloned().collect();
        let mut jobs: Vec<TransferJob> = records.iter().map(|r| r.snapshot()).collect();
        jobs.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        jobs
    }

    /// Jobs not yet in a terminal status
    pub fn active_jobs(&self) -> usize {
        let records: Vec<Arc<JobRecord>> = lock(&self.inner.jobs).values().cloned().collect();
        records
            .iter()
            .filter(|r| !lock(&r.job).status.is_terminal())
            .count()
    }

    /// Attach an observer to a job's progress stream.
    pub fn subscribe(&self, job_id: &str) -> FerryResult<JobSubscription> {
        Ok(self.record(job_id)?.subscription())
    }

    /// Process-wide job lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.lifecycle.subscribe()
    }

    /// Which of `names` already exist under the destination directory `dir`.
    pub async fn check_conflicts(
        &self,
        dir: &TransferRef,
        names: &[String],
    ) -> FerryResult<Vec<String>> {
        self.inner.executor.check_conflicts(dir, names).await
    }

    // ── Cancellation and cleanup ──────────────────────────────────────────────

    /// Cancel a job.
    ///
    /// Queued tasks become `cancelled` immediately and are never admitted.
    /// In-flight tasks stop at their next chunk boundary. Partial destination
    /// artifacts are left in place (see [`cleanup_partial`](Self::cleanup_partial)).
    ///
    /// Returns `Ok(false)` if the job had already finished, `InvalidState` if
    /// it was already cancelled, `NotFound` for an unknown id.
    pub fn cancel(&self, job_id: &str) -> FerryResult<bool> {
        let record = self.record(job_id)?;

        let queued: Vec<usize> = {
            let job = lock(&record.job);
            if record.cancel.is_cancelled() {
                return Err(FerryError::InvalidState(format!(
                    "job {job_id} is already cancelled"
                )));
            }
            if job.status.is_terminal() {
                debug!(job_id = %job_id, status = %job.status, "cancel of finished job ignored");
                return Ok(false);
            }
            record.cancel.cancel();
            job.tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Queued)
                .map(|t| t.index)
                .collect()
        };

        for index in &queued {
            record.apply(*index, |task, now| {
                task.status == TaskStatus::Queued && task.transition(TaskStatus::Cancelled, now)
            });
        }
        info!(job_id = %job_id, queued_cancelled = queued.len(), "job cancelled");
        Ok(true)
    }

    /// Remove destination files left behind by tasks that were cancelled or
    /// failed after their destination was opened. Only valid once the job is
    /// terminal. Returns the destinations removed.
    pub async fn cleanup_partial(&self, job_id: &str) -> FerryResult<Vec<TransferRef>> {
        let job = self.get(job_id)?;
        if !job.status.is_terminal() {
            return Err(FerryError::InvalidState(format!(
                "job {job_id} is still {}",
                job.status
            )));
        }

        let mut removed = Vec::new();
        for task in &job.tasks {
            let leftover = matches!(task.status, TaskStatus::Cancelled | TaskStatus::Failed)
                && task.partial_destination;
            if !leftover {
                continue;
            }
            if self.inner.executor.remove(&task.dest).await? {
                info!(job_id = %job_id, task = task.index, dest = %task.dest, "partial destination removed");
                removed.push(task.dest.clone());
            }
        }
        Ok(removed)
    }

    // ── Retention ─────────────────────────────────────────────────────────────

    /// Drop terminal jobs past their retention period, then the oldest
    /// terminal jobs beyond the retained-job cap. Returns how many were purged.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(now_secs())
    }

    /// [`purge_expired`](Self::purge_expired) against an explicit clock.
    pub fn purge_expired_at(&self, now: u64) -> usize {
        let settings = &self.inner.settings;
        let mut jobs = lock(&self.inner.jobs);

        let mut terminal: Vec<(String, u64, u64)> = jobs
            .iter()
            .filter_map(|(id, record)| {
                let job = lock(&record.job);
                let completed = job.completed_at?;
                job.status
                    .is_terminal()
                    .then(|| (id.clone(), completed, job.created_at))
            })
            .collect();

        let before = jobs.len();
        terminal.retain(|(id, completed, _)| {
            let expired = now.saturating_sub(*completed) > settings.retention_secs;
            if expired {
                jobs.remove(id);
            }
            !expired
        });

        if terminal.len() > settings.max_retained {
            terminal.sort_by_key(|(_, completed, created)| (*completed, *created));
            let excess = terminal.len() - settings.max_retained;
            for (id, _, _) in terminal.iter().take(excess) {
                jobs.remove(id);
            }
        }

        let purged = before - jobs.len();
        if purged > 0 {
            debug!(purged, retained = jobs.len(), "purged finished jobs");
        }
        purged
    }
}

/// Admission and execution of one task.
async fn run_task(inner: Arc<EngineInner>, record: Arc<JobRecord>, index: usize) {
    let permit = tokio::select! {
        biased;
        // Queued tasks of a cancelled job are settled by `cancel` itself
        _ = record.cancel.cancelled() => return,
        permit = inner.admission.clone().acquire_owned() => permit,
    };
    let permit = match permit {
        Ok(p) => p,
        Err(_) => {
            warn!(task = index, "admission gate closed");
            return;
        }
    };

    let Some(task) = record.begin(index) else {
        return;
    };
    let job_id = lock(&record.job).job_id.clone();
    debug!(job_id = %job_id, task = index, source = %task.source, dest = %task.dest, "task admitted");

    let observer = Arc::new(TaskSlot {
        record: record.clone(),
        index,
    });
    let result = inner
        .executor
        .execute(&task, &record.cancel, observer)
        .await;

    record.apply(index, |task, now| match &result {
        Ok(outcome) => {
            if outcome.skipped {
                task.skipped = true;
                task.size_bytes = Some(0);
                task.bytes_transferred = 0;
            } else {
                task.size_bytes.get_or_insert(outcome.bytes);
                task.bytes_transferred = task.bytes_transferred.max(outcome.bytes);
            }
            task.transition(TaskStatus::Completed, now)
        }
        Err(e) if e.is_cancelled() => task.transition(TaskStatus::Cancelled, now),
        Err(e) => {
            task.error = Some(e.to_string());
            task.error_kind = Some(e.kind().to_string());
            task.transition(TaskStatus::Failed, now)
        }
    });

    match &result {
        Ok(outcome) => {
            info!(job_id = %job_id, task = index, bytes = outcome.bytes, skipped = outcome.skipped, "task completed")
        }
        Err(e) if e.is_cancelled() => info!(job_id = %job_id, task = index, "task cancelled"),
        Err(e) => warn!(job_id = %job_id, task = index, kind = e.kind(), "task failed: {e}"),
    }

    drop(permit);
}
