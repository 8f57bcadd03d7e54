use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ConsumerConfig;
use crate::job::JobRecord;
use crate::transport::{Bus, Protocol};
use crate::worker::{JobOutcome, JobWorker};

/// Result of one executed job, posted back into the consumer's mailbox.
struct ExecFinished {
    record: JobRecord,
    outcome: JobOutcome,
}

/// Handle to a running consumer actor.
pub struct ConsumerHandle {
    addr: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub async fn join(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Worker-facing handle that negotiates with a board.
///
/// On a candidate list it applies the worker's `can_do` predicate in list
/// order and replies with the first acceptable job immediately, before
/// executing anything, so the board's negotiation never times out on a busy
/// work function. Execution starts only once the board acknowledges the
/// pick. At most one job is in flight; offers arriving while busy are
/// declined.
pub struct JobConsumer {
    bus: Arc<dyn Bus>,
    addr: String,
    board_addr: String,
    job_type: Option<String>,
    worker: Arc<dyn JobWorker>,
    config: ConsumerConfig,
}

impl JobConsumer {
    pub fn new(
        bus: Arc<dyn Bus>,
        addr: impl Into<String>,
        board_addr: impl Into<String>,
        job_type: Option<String>,
        worker: Arc<dyn JobWorker>,
    ) -> Self {
        Self {
            bus,
            addr: addr.into(),
            board_addr: board_addr.into(),
            job_type,
            worker,
            config: ConsumerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    /// Register with the board and start the actor.
    pub fn spawn(self) -> ConsumerHandle {
        let addr = self.addr.clone();
        let cancel = CancellationToken::new();
        let actor_cancel = cancel.clone();

        let mut mailbox = self.bus.register(&self.addr, self.config.mailbox_capacity);
        let (exec_tx, mut exec_rx) = mpsc::channel::<ExecFinished>(4);

        let task = tokio::spawn(async move {
            tracing::info!(addr = %self.addr, job_type = ?self.job_type, "Consumer ready");

            if let Err(e) = self
                .bus
                .send(
                    &self.board_addr,
                    Protocol::Register {
                        worker_addr: self.addr.clone(),
                        worker_type: self.job_type.clone(),
                    },
                )
                .await
            {
                tracing::error!(error = %e, "Could not register with board");
                return;
            }

            // The job this consumer has picked (awaiting ack) or is running.
            let mut in_flight: Option<JobRecord> = None;

            loop {
                tokio::select! {
                    _ = actor_cancel.cancelled() => break,
                    delivery = mailbox.recv() => {
                        let Some(delivery) = delivery else { break };
                        let (msg, replier) = delivery.split();
                        match msg {
                            Protocol::Offer { jobs } => {
                                if in_flight.is_some() {
                                    tracing::debug!(addr = %self.addr, "Busy; declining offer");
                                    replier.reply(Protocol::Pick { job: None });
                                    continue;
                                }
                                let picked = jobs.into_iter().find(|j| self.worker.can_do(j));
                                match &picked {
                                    Some(job) => {
                                        tracing::info!(addr = %self.addr, job_id = %job.id, "Picked job")
                                    }
                                    None => tracing::info!(addr = %self.addr, "No acceptable job in offer"),
                                }
                                in_flight = picked.clone();
                                // Reply before doing anything else so the
                                // negotiation doesn't time out.
                                replier.reply(Protocol::Pick { job: picked });
                            }
                            Protocol::PickAck { job_id, proceed } => {
                                match in_flight.take() {
                                    Some(record) if record.id == job_id => {
                                        if proceed {
                                            self.start_execution(record.clone(), exec_tx.clone());
                                            in_flight = Some(record);
                                        } else {
                                            // Job was removed or claimed while
                                            // we were picking; stay idle.
                                            tracing::info!(addr = %self.addr, job_id, "Pick refused by board");
                                        }
                                    }
                                    other => {
                                        tracing::warn!(addr = %self.addr, job_id, "Ack for a job we did not pick");
                                        in_flight = other;
                                    }
                                }
                            }
                            other => {
                                tracing::warn!(addr = %self.addr, msg = ?other, "Unexpected message at consumer");
                            }
                        }
                    }
                    Some(finished) = exec_rx.recv() => {
                        // Free before reporting: the report makes the board
                        // offer us more jobs.
                        in_flight = None;
                        self.report(finished).await;
                    }
                }
            }

            if let Err(e) = self
                .bus
                .send(
                    &self.board_addr,
                    Protocol::Unregister {
                        worker_addr: self.addr.clone(),
                    },
                )
                .await
            {
                tracing::debug!(error = %e, "Unregister on shutdown failed");
            }
            self.bus.unregister(&self.addr);
            tracing::info!(addr = %self.addr, "Consumer stopped");
        });

        ConsumerHandle { addr, cancel, task }
    }

    /// Run the work function off the actor loop; a panic counts as failure.
    fn start_execution(&self, record: JobRecord, exec_tx: mpsc::Sender<ExecFinished>) {
        let worker = Arc::clone(&self.worker);
        let addr = self.addr.clone();
        tokio::spawn(async move {
            let run_record = record.clone();
            let run = tokio::spawn(async move { worker.run(&run_record).await });
            let outcome = match run.await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    tracing::error!(addr = %addr, job_id = %record.id, error = %e, "Work function failed");
                    JobOutcome::Failed
                }
                Err(join_err) => {
                    tracing::error!(
                        addr = %addr,
                        job_id = %record.id,
                        error = %join_err,
                        "Work function panicked; reporting job failed"
                    );
                    JobOutcome::Failed
                }
            };
            let _ = exec_tx.send(ExecFinished { record, outcome }).await;
        });
    }

    async fn report(&self, finished: ExecFinished) {
        let ExecFinished { record, outcome } = finished;
        let msg = match outcome {
            JobOutcome::Done => Protocol::Done {
                worker_addr: self.addr.clone(),
                record,
            },
            JobOutcome::PartlyDone => Protocol::PartlyDone {
                worker_addr: self.addr.clone(),
                record,
            },
            JobOutcome::Failed => Protocol::Fail {
                worker_addr: self.addr.clone(),
                record,
            },
        };
        if let Err(e) = self.bus.send(&self.board_addr, msg).await {
            tracing::error!(addr = %self.addr, error = %e, "Could not report job outcome");
        }
    }
}
