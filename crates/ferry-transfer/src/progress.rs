//! Per-job progress fan-out.
//!
//! Each job owns one bounded `tokio::sync::broadcast` channel. The engine
//! publishes a [`TaskEvent`] for every task-state change while holding the job
//! lock, so channel order matches state order. Observers attach through a
//! [`JobSubscription`], which starts with a full snapshot, then follows the
//! channel until the job reaches a terminal status.
//!
//! An observer that falls behind by more than the channel capacity is resynced
//! with a fresh snapshot instead of being disconnected. Dropping a
//! subscription has no effect on the job.

use ferry_core::types::TransferRef;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

use crate::job::{JobProgress, JobStatus, TaskStatus, TransferJob};

/// One task-state change, with the job aggregate it produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub job_id: String,
    pub task_index: usize,
    pub source: TransferRef,
    pub dest: TransferRef,
    pub bytes_transferred: u64,
    pub total_bytes: Option<u64>,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub job_status: JobStatus,
    pub job_progress: JobProgress,
}

impl TaskEvent {
    /// Event for `job.tasks[index]` as the job stands now.
    pub fn from_job(job: &TransferJob, index: usize) -> Option<Self> {
        let task = job.tasks.get(index)?;
        Some(Self {
            job_id: job.job_id.clone(),
            task_index: index,
            source: task.source.clone(),
            dest: task.dest.clone(),
            bytes_transferred: task.bytes_transferred,
            total_bytes: task.size_bytes,
            status: task.status,
            error: task.error.clone(),
            job_status: job.status,
            job_progress: job.progress,
        })
    }
}

/// Item delivered to an observer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// Full job state: sent on attach and after a resync
    Snapshot(TransferJob),
    Task(TaskEvent),
}

impl ProgressEvent {
    pub fn job_status(&self) -> JobStatus {
        match self {
            ProgressEvent::Snapshot(job) => job.status,
            ProgressEvent::Task(ev) => ev.job_status,
        }
    }
}

/// Atomically captures a job snapshot together with a fresh receiver.
pub type Resync = Arc<dyn Fn() -> (TransferJob, broadcast::Receiver<TaskEvent>) + Send + Sync>;

/// Sending half of a job's progress channel
#[derive(Debug, Clone)]
pub struct ProgressBroadcaster {
    tx: broadcast::Sender<TaskEvent>,
}

impl ProgressBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no observers is not an error.
    pub fn publish(&self, event: TaskEvent) {
        let _ = self.tx.send(event);
    }

    /// New receiver positioned after everything published so far.
    ///
    /// Call while holding the job lock, together with taking the snapshot.
    pub fn receiver(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// One observer's view of a job
pub struct JobSubscription {
    snapshot: Option<TransferJob>,
    rx: broadcast::Receiver<TaskEvent>,
    resync: Resync,
    finished: bool,
}

impl JobSubscription {
    pub fn new(snapshot: TransferJob, rx: broadcast::Receiver<TaskEvent>, resync: Resync) -> Self {
        Self {
            snapshot: Some(snapshot),
            rx,
            resync,
            finished: false,
        }
    }

    /// Next event, or `None` once the job reached a terminal status.
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        if let Some(snapshot) = self.snapshot.take() {
            self.finished = snapshot.status.is_terminal();
            return Some(ProgressEvent::Snapshot(snapshot));
        }
        if self.finished {
            return None;
        }

        match self.rx.recv().await {
            Ok(event) => {
                self.finished = event.job_status.is_terminal();
                Some(ProgressEvent::Task(event))
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                let (snapshot, rx) = (self.resync)();
                warn!(job_id = %snapshot.job_id, missed, "progress observer lagged, resynced");
                self.rx = rx;
                self.finished = snapshot.status.is_terminal();
                Some(ProgressEvent::Snapshot(snapshot))
            }
            Err(broadcast::error::RecvError::Closed) => {
                self.finished = true;
                None
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            let event = sub.next().await?;
            Some((event, sub))
        })
    }
}
