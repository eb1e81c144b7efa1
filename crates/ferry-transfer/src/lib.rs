//! ferry-transfer: bounded-concurrency transfer engine
//!
//! - [`engine::TransferEngine`] owns every job, admits tasks through one
//!   process-wide semaphore and derives job state from task state
//! - [`executor::TransferExecutor`] moves the bytes, choosing a strategy from
//!   the (source kind, destination kind) pair
//! - [`progress::ProgressBroadcaster`] fans per-job task updates out to observers

pub mod conflict;
pub mod engine;
pub mod executor;
pub mod job;
pub mod progress;
pub mod tap;

pub use engine::{JobEvent, SubmitReceipt, TransferEngine};
pub use executor::{Strategy, TaskObserver, TaskOutcome, TransferExecutor};
pub use job::{JobProgress, JobStatus, TaskSpec, TaskStatus, TransferJob, TransferTask};
pub use progress::{JobSubscription, ProgressBroadcaster, ProgressEvent, TaskEvent};
