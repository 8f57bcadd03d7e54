use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire-level unit of work handed from producers to the board and on to a
/// worker. The `request` payload is opaque to everything in this crate; only
/// the worker that picks the job interprets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique, caller-assigned id.
    pub id: String,
    /// Capability tag used for worker matching.
    pub job_type: String,
    /// Job-specific parameters, never interpreted by the scheduler.
    pub request: Value,
    /// May this job be silently marked stale if an input is redone after it
    /// completed?
    pub updatable: bool,
    /// Topic a progress monitor broadcasts to, if any.
    pub progress_addr: Option<String>,
    /// Poll interval for the progress monitor; 0 disables polling.
    pub progress_poll_interval_secs: u32,
}

impl JobRecord {
    pub fn new(id: impl Into<String>, job_type: impl Into<String>, request: Value) -> Self {
        Self {
            id: id.into(),
            job_type: job_type.into(),
            request,
            updatable: true,
            progress_addr: None,
            progress_poll_interval_secs: 0,
        }
    }

    pub fn with_updatable(mut self, updatable: bool) -> Self {
        self.updatable = updatable;
        self
    }

    /// Attach a progress channel: workers broadcast `ProgressState` updates
    /// to `addr` every `poll_interval_secs` while the job runs.
    pub fn with_progress_addr(mut self, addr: impl Into<String>, poll_interval_secs: u32) -> Self {
        self.progress_addr = Some(addr.into());
        self.progress_poll_interval_secs = poll_interval_secs;
        self
    }
}

impl std::fmt::Display for JobRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobRecord[id={}, type={}]", self.id, self.job_type)
    }
}
