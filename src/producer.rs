use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::board::ItemState;
use crate::error::{JobGraphError, Result};
use crate::job::JobRecord;
use crate::transport::{Bus, Protocol, TransportError};
use crate::worker::ProgressState;

/// A live progress snapshot for a job on the board.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub record: JobRecord,
    pub state: ItemState,
    pub progress: Option<ProgressState>,
}

/// Client-facing handle for submitting jobs to a [`JobBoard`](crate::board::JobBoard)
/// and receiving its completion/failure notices.
///
/// Construction registers a completion and a failure address on the bus; the
/// dependency layer takes the corresponding streams once and consumes them
/// for the life of the service.
pub struct JobProducer {
    bus: Arc<dyn Bus>,
    board_addr: String,
    completion_addr: String,
    failure_addr: String,
    retry_limit: u32,
    request_timeout: Duration,
    completions: Option<mpsc::Receiver<JobRecord>>,
    failures: Option<mpsc::Receiver<JobRecord>>,
}

impl JobProducer {
    pub fn new(bus: Arc<dyn Bus>, board_addr: impl Into<String>) -> Self {
        Self::with_retry_limit(bus, board_addr, 0)
    }

    pub fn with_retry_limit(
        bus: Arc<dyn Bus>,
        board_addr: impl Into<String>,
        retry_limit: u32,
    ) -> Self {
        let board_addr = board_addr.into();
        let id = uuid::Uuid::new_v4();
        let completion_addr = format!("producer.{id}.complete");
        let failure_addr = format!("producer.{id}.failed");

        let completions = Self::forward_notices(&bus, &completion_addr);
        let failures = Self::forward_notices(&bus, &failure_addr);

        Self {
            bus,
            board_addr,
            completion_addr,
            failure_addr,
            retry_limit,
            request_timeout: Duration::from_secs(10),
            completions: Some(completions),
            failures: Some(failures),
        }
    }

    /// Register `addr` on the bus and forward the job records of the notices
    /// arriving there.
    fn forward_notices(bus: &Arc<dyn Bus>, addr: &str) -> mpsc::Receiver<JobRecord> {
        let mut mailbox = bus.register(addr, 32);
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            while let Some(delivery) = mailbox.recv().await {
                match delivery.msg {
                    Protocol::Completion { record } | Protocol::Failure { record } => {
                        if tx.send(record).await.is_err() {
                            break;
                        }
                    }
                    other => {
                        tracing::warn!(msg = ?other, "Unexpected message at producer notice address");
                    }
                }
            }
        });
        rx
    }

    /// Stream of completion notices. May be taken once.
    pub fn take_completions(&mut self) -> Option<mpsc::Receiver<JobRecord>> {
        self.completions.take()
    }

    /// Stream of failure notices (retry limit exhausted). May be taken once.
    pub fn take_failures(&mut self) -> Option<mpsc::Receiver<JobRecord>> {
        self.failures.take()
    }

    pub async fn add_job(&self, record: JobRecord) -> Result<()> {
        tracing::debug!(job_id = %record.id, "Adding job to board");
        let reply = self
            .bus
            .request(
                &self.board_addr,
                Protocol::AddJob {
                    record,
                    completion_addr: Some(self.completion_addr.clone()),
                    failure_addr: Some(self.failure_addr.clone()),
                    retry_limit: self.retry_limit,
                },
                self.request_timeout,
            )
            .await
            .map_err(reject_or_transport)?;
        match reply {
            Protocol::Ack => Ok(()),
            _ => Err(JobGraphError::UnexpectedReply("add_job")),
        }
    }

    pub async fn remove_job(&self, job_id: &str) -> Result<()> {
        tracing::debug!(job_id, "Removing job from board");
        let reply = self
            .bus
            .request(
                &self.board_addr,
                Protocol::RemoveJob {
                    job_id: job_id.to_string(),
                },
                self.request_timeout,
            )
            .await
            .map_err(reject_or_transport)?;
        match reply {
            Protocol::Ack => Ok(()),
            _ => Err(JobGraphError::UnexpectedReply("remove_job")),
        }
    }

    pub async fn get_progress(&self, job_id: &str) -> Result<ProgressSnapshot> {
        let reply = self
            .bus
            .request(
                &self.board_addr,
                Protocol::GetProgress {
                    job_id: job_id.to_string(),
                },
                self.request_timeout,
            )
            .await
            .map_err(reject_or_transport)?;
        match reply {
            Protocol::Progress {
                record,
                state,
                progress,
            } => Ok(ProgressSnapshot {
                record,
                state,
                progress,
            }),
            _ => Err(JobGraphError::UnexpectedReply("get_progress")),
        }
    }
}

fn reject_or_transport(e: TransportError) -> JobGraphError {
    match e {
        TransportError::Rejected(rejection) => JobGraphError::Rejected(rejection),
        other => JobGraphError::Transport(other),
    }
}
