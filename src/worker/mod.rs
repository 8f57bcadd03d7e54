//! Worker-side handles: the pluggable work function, the consumer actor
//! that negotiates with a board, and progress reporting.
//!
//! # Components
//!
//! - [`JobWorker`]: the work function a consumer executes, with a
//!   `can_do` capability predicate
//! - [`JobConsumer`]: receives candidate-job lists, picks one, executes,
//!   reports the outcome
//! - [`ProgressState`] / [`ProgressMonitor`]: periodic progress broadcast
//!   for long-running jobs
//! - [`ReportingWorker`]: adapts a plain work closure plus a progress
//!   source into a `JobWorker` that attaches a monitor per job

pub mod consumer;
pub mod progress;

use async_trait::async_trait;

use crate::job::JobRecord;

pub use consumer::{ConsumerHandle, JobConsumer};
pub use progress::{ProgressMonitor, ProgressSource, ProgressState, ReportingWorker};

/// How a finished work function left its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Job fully complete.
    Done,
    /// This worker finished its part; the job returns to the board for
    /// another worker to continue.
    PartlyDone,
    /// Job failed; the board decides whether to retry.
    Failed,
}

/// The pluggable work function a [`JobConsumer`] runs.
#[async_trait]
pub trait JobWorker: Send + Sync + 'static {
    /// Whether this worker can take `job`. Consulted per candidate, in list
    /// order, when an offer arrives.
    fn can_do(&self, _job: &JobRecord) -> bool {
        true
    }

    /// Execute the job. An `Err` is reported as a failure, as is a panic.
    async fn run(&self, job: &JobRecord) -> crate::error::Result<JobOutcome>;
}
