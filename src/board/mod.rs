//! The negotiating broker.
//!
//! A [`JobBoard`] owns the pool of available jobs and idle workers for one
//! service type. Producers add jobs; workers register and are offered the
//! candidate jobs matching their declared type. The board negotiates with
//! one worker at a time so two workers can never claim the same job.

mod item;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::BoardConfig;
use crate::job::JobRecord;
use crate::transport::{Bus, Delivery, Protocol, Replier, TransportError};

pub use item::{ItemState, JobItem, Worker, WorkerPool};

/// Rejection codes the board sends back to producers and workers.
pub mod reject {
    /// Add of a job id that is currently claimed by a worker.
    pub const JOB_RUNNING: i32 = -11;
    /// Remove of an unknown job id.
    pub const JOB_NOT_FOUND: i32 = -12;
    /// Progress query for an unknown job id.
    pub const PROGRESS_NOT_FOUND: i32 = -13;
    /// Remove of a job that is currently claimed by a worker.
    pub const REMOVE_RUNNING: i32 = -121;
    /// Pick of a job that vanished or was claimed between offer and pick.
    pub const PICK_REJECTED: i32 = -123;
}

/// Outcome of one offer round-trip, posted back into the board's mailbox by
/// the task that awaited the worker's reply.
struct PickOutcome {
    worker_addr: String,
    result: Result<Protocol, TransportError>,
}

/// Handle to a running board actor.
pub struct BoardHandle {
    addr: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl BoardHandle {
    /// Bus address producers and workers talk to.
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

pub struct JobBoard {
    service_type: String,
    addr: String,
    config: BoardConfig,
    bus: Arc<dyn Bus>,
    jobs: HashMap<String, JobItem>,
    next_seq: u64,
    workers: WorkerPool,
    /// Negotiate with one worker at a time so workers don't choose the same
    /// job. Serializes outgoing offers only; inbound handling is already
    /// serialized by the actor loop.
    negotiating: bool,
    /// Raised by any add that lands while an offer round-trip is in flight.
    job_added: bool,
    remove_counter: u64,
    pick_tx: Option<mpsc::Sender<PickOutcome>>,
    prev_status_line: Option<String>,
    same_line_count: u32,
}

impl JobBoard {
    pub fn new(
        bus: Arc<dyn Bus>,
        addr: impl Into<String>,
        service_type: impl Into<String>,
        config: BoardConfig,
    ) -> Self {
        Self {
            service_type: service_type.into(),
            addr: addr.into(),
            config,
            bus,
            jobs: HashMap::new(),
            next_seq: 0,
            workers: WorkerPool::default(),
            negotiating: false,
            job_added: false,
            remove_counter: 0,
            pick_tx: None,
            prev_status_line: None,
            same_line_count: 0,
        }
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    /// Start the actor; all further interaction goes through the bus.
    pub fn spawn(mut self) -> BoardHandle {
        let addr = self.addr.clone();
        let cancel = CancellationToken::new();
        let actor_cancel = cancel.clone();

        let mut mailbox = self.bus.register(&self.addr, self.config.mailbox_capacity);
        let (pick_tx, mut pick_rx) = mpsc::channel::<PickOutcome>(16);
        self.pick_tx = Some(pick_tx);

        let task = tokio::spawn(async move {
            let status_period = self.config.status_log_interval;
            let mut status = tokio::time::interval(
                status_period.unwrap_or_else(|| Duration::from_secs(3600)),
            );
            status.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            status.tick().await;

            tracing::info!(
                addr = %self.addr,
                service_type = %self.service_type,
                "Job board ready"
            );

            loop {
                tokio::select! {
                    _ = actor_cancel.cancelled() => break,
                    delivery = mailbox.recv() => {
                        match delivery {
                            Some(delivery) => self.handle_delivery(delivery).await,
                            None => break,
                        }
                    }
                    Some(outcome) = pick_rx.recv() => {
                        self.handle_pick_outcome(outcome).await;
                    }
                    _ = status.tick() => {
                        if status_period.is_some() {
                            self.log_status();
                        }
                    }
                }
            }
            self.bus.unregister(&self.addr);
            tracing::info!(addr = %self.addr, "Job board stopped");
        });

        BoardHandle { addr, cancel, task }
    }

    async fn handle_delivery(&mut self, delivery: Delivery) {
        let (msg, replier) = delivery.split();
        match msg {
            Protocol::Register {
                worker_addr,
                worker_type,
            } => {
                tracing::info!(worker = %worker_addr, job_type = ?worker_type, "Worker registered");
                self.workers.register(&worker_addr, worker_type);
                replier.reply(Protocol::Ack);
                self.negotiate_with(worker_addr).await;
            }
            Protocol::Unregister { worker_addr } => {
                if !self.workers.remove_idle(&worker_addr) {
                    tracing::warn!(worker = %worker_addr, "Unregister of a worker that was not idle");
                }
                replier.reply(Protocol::Ack);
            }
            Protocol::AddJob {
                record,
                completion_addr,
                failure_addr,
                retry_limit,
            } => {
                self.handle_add_job(record, completion_addr, failure_addr, retry_limit, replier)
                    .await;
            }
            Protocol::RemoveJob { job_id } => {
                self.handle_remove_job(&job_id, replier);
            }
            Protocol::SetProgress { record, progress } => {
                match self.jobs.get_mut(&record.id) {
                    Some(item) => {
                        if item.state.is_claimed() {
                            item.state = ItemState::Progressing;
                        } else {
                            tracing::warn!(
                                job_id = %record.id,
                                state = %item.state,
                                "Progress reported for an unclaimed job"
                            );
                        }
                        item.progress = Some(progress);
                        replier.reply(Protocol::Ack);
                    }
                    None => {
                        replier.fail(
                            reject::PROGRESS_NOT_FOUND,
                            format!("Cannot find job with id={}", record.id),
                        );
                    }
                }
            }
            Protocol::GetProgress { job_id } => match self.jobs.get(&job_id) {
                Some(item) => {
                    replier.reply(Protocol::Progress {
                        record: item.record.clone(),
                        state: item.state,
                        progress: item.progress.clone(),
                    });
                }
                None => {
                    replier.fail(
                        reject::PROGRESS_NOT_FOUND,
                        format!("Cannot find job with id={job_id}"),
                    );
                }
            },
            Protocol::PartlyDone {
                worker_addr,
                record,
            } => {
                self.worker_ended(&record.id, ItemState::Available, &worker_addr);
                replier.reply(Protocol::Ack);
                self.negotiate_with(worker_addr).await;
            }
            Protocol::Done {
                worker_addr,
                record,
            } => {
                let notice = self
                    .worker_ended(&record.id, ItemState::Done, &worker_addr)
                    .map(|item| (item.completion_addr.clone(), item.record.clone()));
                replier.reply(Protocol::Ack);
                self.negotiate_with(worker_addr).await;

                if let Some((Some(completion_addr), record)) = notice {
                    tracing::debug!(job_id = %record.id, to = %completion_addr, "Notifying completion");
                    if let Err(e) = self
                        .bus
                        .send(&completion_addr, Protocol::Completion { record })
                        .await
                    {
                        tracing::warn!(error = %e, "Completion notice undeliverable");
                    }
                }
            }
            Protocol::Fail {
                worker_addr,
                record,
            } => {
                self.handle_fail(worker_addr, record, replier).await;
            }
            other => {
                tracing::warn!(msg = ?other, "Unexpected message at board address");
                replier.fail(reject::JOB_NOT_FOUND, "unexpected message kind");
            }
        }
    }

    async fn handle_add_job(
        &mut self,
        record: JobRecord,
        completion_addr: Option<String>,
        failure_addr: Option<String>,
        retry_limit: u32,
        replier: Replier,
    ) {
        if let Some(existing) = self.jobs.get(&record.id) {
            if existing.state.is_claimed() {
                replier.fail(
                    reject::JOB_RUNNING,
                    format!(
                        "Job with id={} already exists and has started",
                        record.id
                    ),
                );
                return;
            }
            tracing::info!(
                job_id = %record.id,
                state = %existing.state,
                "Job id already exists; adding job again"
            );
        }

        self.next_seq += 1;
        let item = JobItem::new(record, completion_addr, failure_addr, retry_limit, self.next_seq);
        tracing::info!(job_id = %item.id(), job_type = %item.record.job_type, "Adding job");
        self.jobs.insert(item.id().to_string(), item);
        replier.reply(Protocol::Ack);

        // In case an offer round-trip is in flight.
        self.job_added = true;

        self.workers.wake_picky();
        self.negotiate_with_next_idle().await;
    }

    fn handle_remove_job(&mut self, job_id: &str, replier: Replier) {
        match self.jobs.get(job_id) {
            None => {
                replier.fail(
                    reject::JOB_NOT_FOUND,
                    format!("Cannot find job with id={job_id}"),
                );
            }
            Some(item) if item.state.is_claimed() => {
                replier.fail(
                    reject::REMOVE_RUNNING,
                    format!("Cannot remove job id={job_id} with state={}", item.state),
                );
            }
            Some(_) => {
                self.jobs.remove(job_id);
                self.remove_counter += 1;
                replier.reply(Protocol::Ack);
            }
        }
    }

    async fn handle_fail(&mut self, worker_addr: String, record: JobRecord, replier: Replier) {
        let end_state = match self.jobs.get_mut(&record.id) {
            Some(item) => {
                item.fail_count += 1;
                if item.fail_count > item.retry_limit {
                    ItemState::Failed
                } else {
                    ItemState::Available
                }
            }
            None => {
                tracing::warn!(job_id = %record.id, "Failure reported for unknown job");
                replier.fail(
                    reject::JOB_NOT_FOUND,
                    format!("Cannot find job with id={}", record.id),
                );
                return;
            }
        };

        let notice = self
            .worker_ended(&record.id, end_state, &worker_addr)
            .map(|item| (item.failure_addr.clone(), item.record.clone()));
        replier.reply(Protocol::Ack);
        self.negotiate_with(worker_addr).await;

        if end_state == ItemState::Failed {
            if let Some((Some(failure_addr), record)) = notice {
                tracing::info!(job_id = %record.id, to = %failure_addr, "Notifying failure");
                if let Err(e) = self
                    .bus
                    .send(&failure_addr, Protocol::Failure { record })
                    .await
                {
                    tracing::warn!(error = %e, "Failure notice undeliverable");
                }
            }
        }
    }

    /// Terminate a worker's claim: return it to the idle pool and move the
    /// item to `new_state`.
    fn worker_ended(
        &mut self,
        job_id: &str,
        new_state: ItemState,
        worker_addr: &str,
    ) -> Option<&JobItem> {
        if !self.workers.make_idle(worker_addr) {
            tracing::error!(worker = %worker_addr, "Worker reporting an ended job was already idle");
        }
        match self.jobs.get_mut(job_id) {
            Some(item) => {
                tracing::info!(
                    job_id,
                    from = %item.state,
                    to = %new_state,
                    "Job state change"
                );
                item.state = new_state;
                Some(&*item)
            }
            None => {
                tracing::warn!(job_id, "Ended job is unknown to the board");
                None
            }
        }
    }

    /// Candidate jobs for a worker: AVAILABLE items matching its declared
    /// type (a worker without a type matches everything), FIFO by insertion.
    fn available_jobs_for(&self, worker_addr: &str) -> Vec<JobRecord> {
        let job_type = match self.workers.job_type_of(worker_addr) {
            Some(t) => t.clone(),
            None => {
                tracing::error!(worker = %worker_addr, "Candidate list requested for unknown worker");
                return Vec::new();
            }
        };
        let mut items: Vec<&JobItem> = self
            .jobs
            .values()
            .filter(|item| item.state == ItemState::Available)
            .filter(|item| match &job_type {
                None => true,
                Some(t) => *t == item.record.job_type,
            })
            .collect();
        items.sort_by_key(|item| item.seq);
        items.into_iter().map(|item| item.record.clone()).collect()
    }

    async fn negotiate_with_next_idle(&mut self) {
        let Some(worker) = self.workers.first_idle().map(str::to_string) else {
            return; // no workers available
        };
        self.negotiate_with(worker).await;
    }

    async fn negotiate_with(&mut self, worker_addr: String) {
        if self.negotiating {
            tracing::debug!(worker = %worker_addr, "Currently negotiating; skipping");
            return;
        }
        let jobs = self.available_jobs_for(&worker_addr);
        self.send_jobs_to(worker_addr, jobs).await;
    }

    /// Offer `jobs` to one worker. An empty list moves the worker to the
    /// picky pool and the negotiation passes to the next idle worker;
    /// otherwise the offer round-trip starts and `negotiating` stays raised
    /// until its outcome is handled.
    async fn send_jobs_to(&mut self, worker_addr: String, jobs: Vec<JobRecord>) {
        self.job_added = false;

        if jobs.is_empty() {
            tracing::debug!(worker = %worker_addr, "No candidate jobs; worker turns picky");
            self.workers.make_picky(&worker_addr);
            self.negotiating = false;
            Box::pin(self.negotiate_with_next_idle()).await;
            return;
        }

        tracing::debug!(
            worker = %worker_addr,
            candidates = jobs.len(),
            "Offering candidate jobs"
        );
        self.negotiating = true;

        let bus = self.bus.clone();
        let timeout = self.config.negotiation_timeout;
        let pick_tx = self
            .pick_tx
            .clone()
            .expect("board actor running without pick channel");
        tokio::spawn(async move {
            let result = bus
                .request(&worker_addr, Protocol::Offer { jobs }, timeout)
                .await;
            let _ = pick_tx.send(PickOutcome {
                worker_addr,
                result,
            })
            .await;
        });
    }

    async fn handle_pick_outcome(&mut self, outcome: PickOutcome) {
        let PickOutcome {
            worker_addr,
            result,
        } = outcome;

        match result {
            Err(e) => {
                tracing::warn!(
                    worker = %worker_addr,
                    error = %e,
                    "Offer reply failed; removing worker permanently -- it must register again"
                );
                if !self.workers.remove_idle(&worker_addr) {
                    tracing::error!(worker = %worker_addr, "Could not remove worker from idle pool");
                }
                self.close_negotiation().await;
            }
            Ok(Protocol::Pick { job: None }) => {
                if self.job_added {
                    // The candidate list changed while the worker deliberated;
                    // stay with this worker and resend the current list.
                    tracing::info!(worker = %worker_addr, "Job list has changed; resending offer");
                    let jobs = self.available_jobs_for(&worker_addr);
                    self.negotiating = false;
                    Box::pin(self.send_jobs_to(worker_addr, jobs)).await;
                } else {
                    tracing::debug!(worker = %worker_addr, "Worker did not choose a job");
                    self.workers.make_picky(&worker_addr);
                    self.close_negotiation().await;
                }
            }
            Ok(Protocol::Pick { job: Some(picked) }) => {
                self.handle_pick(worker_addr, picked).await;
            }
            Ok(other) => {
                tracing::warn!(
                    worker = %worker_addr,
                    reply = ?other,
                    "Unexpected offer reply; removing worker"
                );
                self.workers.remove_idle(&worker_addr);
                self.close_negotiation().await;
            }
        }
    }

    async fn handle_pick(&mut self, worker_addr: String, picked: JobRecord) {
        let claimable = self
            .jobs
            .get(&picked.id)
            .is_some_and(|item| item.state == ItemState::Available);

        if claimable {
            if let Some(item) = self.jobs.get_mut(&picked.id) {
                item.state = ItemState::Started;
            }
            tracing::debug!(worker = %worker_addr, job_id = %picked.id, "Job started");
            if !self.workers.remove_idle(&worker_addr) {
                tracing::error!(worker = %worker_addr, "Could not remove worker from idle pool");
            }

            let ack = Protocol::PickAck {
                job_id: picked.id.clone(),
                proceed: true,
            };
            if let Err(e) = self.bus.send(&worker_addr, ack).await {
                // The worker never learns it may proceed; undo the claim.
                tracing::warn!(
                    worker = %worker_addr,
                    job_id = %picked.id,
                    error = %e,
                    "Pick acknowledgment undeliverable; releasing claim"
                );
                if let Some(item) = self.jobs.get_mut(&picked.id) {
                    item.state = ItemState::Available;
                }
            }
            self.close_negotiation().await;
        } else {
            // The job vanished or was claimed while the worker was picking;
            // refuse the pick and resend the refreshed list to the same worker.
            tracing::info!(
                worker = %worker_addr,
                job_id = %picked.id,
                "Picked job no longer available; resending offer"
            );
            let nack = Protocol::PickAck {
                job_id: picked.id.clone(),
                proceed: false,
            };
            if let Err(e) = self.bus.send(&worker_addr, nack).await {
                tracing::warn!(worker = %worker_addr, error = %e, "Pick refusal undeliverable");
                self.workers.remove_idle(&worker_addr);
                self.close_negotiation().await;
                return;
            }
            let jobs = self.available_jobs_for(&worker_addr);
            self.negotiating = false;
            Box::pin(self.send_jobs_to(worker_addr, jobs)).await;
        }
    }

    async fn close_negotiation(&mut self) {
        self.negotiating = false;
        self.negotiate_with_next_idle().await;
    }

    fn log_status(&mut self) {
        let count = |state: ItemState| self.jobs.values().filter(|i| i.state == state).count();
        let line = format!(
            "{} avail -> {} started .. {} processing -> {} done, {} failed, {} removed :: {} idle vs {} picky of {} workers",
            count(ItemState::Available),
            count(ItemState::Started),
            count(ItemState::Progressing),
            count(ItemState::Done),
            count(ItemState::Failed),
            self.remove_counter,
            self.workers.idle_count(),
            self.workers.picky_count(),
            self.workers.known_count(),
        );
        if self.prev_status_line.as_deref() != Some(line.as_str()) {
            let avail: Vec<String> = self
                .jobs
                .values()
                .filter(|i| i.state == ItemState::Available)
                .map(|i| format!("{} type={}", i.id(), i.record.job_type))
                .collect();
            tracing::info!(service_type = %self.service_type, avail = ?avail, "{line}");
            self.prev_status_line = Some(line);
            self.same_line_count = 0;
        } else {
            self.same_line_count += 1;
            if self.same_line_count > self.config.same_log_threshold {
                self.prev_status_line = None;
            }
        }
    }
}
