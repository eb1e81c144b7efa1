//! Job and task records plus the pure functions derived from them.
//!
//! Records are plain data. Only the engine mutates them, through the guarded
//! transitions on [`TransferTask`] followed by [`TransferJob::refresh`].

use ferry_core::types::{ConflictPolicy, TransferRef};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Transferring,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Allowed edges of the task state machine. Terminal states have none.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Queued, Transferring)
                | (Queued, Cancelled)
                | (Transferring, Completed)
                | (Transferring, Failed)
                | (Transferring, Cancelled)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job status as a function of the task-status multiset.
///
/// - every task queued: `Queued`
/// - any task not yet terminal: `Active`
/// - all terminal: `Failed` if any failed, else `Cancelled` if any was
///   cancelled, else `Completed`
pub fn derive_status<I>(statuses: I) -> JobStatus
where
    I: IntoIterator<Item = TaskStatus>,
{
    let mut all_queued = true;
    let mut any_open = false;
    let mut any_failed = false;
    let mut any_cancelled = false;

    for status in statuses {
        all_queued &= status == TaskStatus::Queued;
        match status {
            TaskStatus::Queued | TaskStatus::Transferring => any_open = true,
            TaskStatus::Failed => any_failed = true,
            TaskStatus::Cancelled => any_cancelled = true,
            TaskStatus::Completed => {}
        }
    }

    if any_open {
        if all_queued {
            JobStatus::Queued
        } else {
            JobStatus::Active
        }
    } else if any_failed {
        JobStatus::Failed
    } else if any_cancelled {
        JobStatus::Cancelled
    } else {
        JobStatus::Completed
    }
}

/// Aggregate byte counts for a job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub total_bytes: u64,
    pub loaded_bytes: u64,
    /// `round(100 * loaded / total)`, 0 when the total is 0, capped at 100
    pub percentage: u8,
}

impl JobProgress {
    pub fn from_tasks(tasks: &[TransferTask]) -> Self {
        let total_bytes: u64 = tasks.iter().filter_map(|t| t.size_bytes).sum();
        let loaded_bytes: u64 = tasks.iter().map(|t| t.bytes_transferred).sum();
        Self {
            total_bytes,
            loaded_bytes,
            percentage: percentage(loaded_bytes, total_bytes),
        }
    }
}

fn percentage(loaded: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (loaded as f64 * 100.0 / total as f64).round();
    pct.min(100.0) as u8
}

/// A caller's request for one file movement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub source: TransferRef,
    pub dest: TransferRef,
    /// Known size, if the caller already has it
    #[serde(default)]
    pub size: Option<u64>,
    /// Overrides the job's conflict policy for this entry
    #[serde(default)]
    pub policy: Option<ConflictPolicy>,
}

impl TaskSpec {
    pub fn new(source: TransferRef, dest: TransferRef) -> Self {
        Self {
            source,
            dest,
            size: None,
            policy: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = Some(policy);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTask {
    pub index: usize,
    pub source: TransferRef,
    /// Rewritten by the `rename` policy before any byte moves
    pub dest: TransferRef,
    pub policy: ConflictPolicy,
    pub size_bytes: Option<u64>,
    pub bytes_transferred: u64,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// `FerryError::kind()` of the failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    /// Destination left untouched because it already existed (`skip`)
    #[serde(default)]
    pub skipped: bool,
    /// A destination file was created or truncated for this task
    #[serde(default)]
    pub partial_destination: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<u64>,
}

impl TransferTask {
    pub fn queued(index: usize, spec: TaskSpec, job_policy: ConflictPolicy) -> Self {
        Self {
            index,
            policy: spec.policy.unwrap_or(job_policy),
            source: spec.source,
            dest: spec.dest,
            size_bytes: spec.size,
            bytes_transferred: 0,
            status: TaskStatus::Queued,
            error: None,
            error_kind: None,
            skipped: false,
            partial_destination: false,
            started_at: None,
            finished_at: None,
        }
    }

    /// Apply a status change if the state machine allows it.
    pub fn transition(&mut self, next: TaskStatus, now: u64) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        if next == TaskStatus::Transferring {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        true
    }

    /// Record cumulative bytes. Ignored unless transferring and larger than
    /// what was already recorded.
    pub fn record_progress(&mut self, bytes: u64) -> bool {
        if self.status != TaskStatus::Transferring || bytes <= self.bytes_transferred {
            return false;
        }
        self.bytes_transferred = bytes;
        true
    }

    pub fn record_size(&mut self, size: u64) -> bool {
        if self.status.is_terminal() || self.size_bytes == Some(size) {
            return false;
        }
        self.size_bytes = Some(size);
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferJob {
    pub job_id: String,
    pub conflict_policy: ConflictPolicy,
    pub tasks: Vec<TransferTask>,
    pub status: JobStatus,
    pub progress: JobProgress,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
}

impl TransferJob {
    /// A new job with every task queued.
    pub fn new(
        job_id: impl Into<String>,
        specs: Vec<TaskSpec>,
        policy: ConflictPolicy,
        now: u64,
    ) -> Self {
        let tasks = specs
            .into_iter()
            .enumerate()
            .map(|(i, spec)| TransferTask::queued(i, spec, policy))
            .collect();
        let mut job = Self {
            job_id: job_id.into(),
            conflict_policy: policy,
            tasks,
            status: JobStatus::Queued,
            progress: JobProgress::default(),
            created_at: now,
            started_at: None,
            completed_at: None,
        };
        job.refresh(now);
        job
    }

    /// Status derived from the current task snapshot
    pub fn derived_status(&self) -> JobStatus {
        derive_status(self.tasks.iter().map(|t| t.status))
    }

    /// Recompute the derived fields after a task update.
    pub fn refresh(&mut self, now: u64) {
        self.status = self.derived_status();
        self.progress = JobProgress::from_tasks(&self.tasks);
        if self.started_at.is_none() && self.status != JobStatus::Queued {
            self.started_at = Some(now);
        }
        if self.completed_at.is_none() && self.status.is_terminal() {
            self.completed_at = Some(now);
        }
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }
}

/// Unix seconds
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
