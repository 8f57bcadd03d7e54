use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::SchedulerConfig;
use crate::error::{JobGraphError, Result};
use crate::graph::{GraphStore, GraphTxn};
use crate::job::JobRecord;
use crate::producer::JobProducer;
use crate::scheduler::node::{
    dependent_jobs, input_jobs, node_order, node_state, node_updatable, set_node_order,
    set_node_state, set_node_updatable, JobState, INPUT_EDGE,
};
use crate::worker::ProgressState;

/// Snapshot returned by [`DepJobService::query_job_stats`].
#[derive(Debug, Clone)]
pub struct JobStats {
    /// `None` means the job was staged but never submitted.
    pub state: Option<JobState>,
    pub progress: Option<ProgressState>,
}

/// Records the scheduler holds outside the graph, keyed by job id.
#[derive(Default)]
struct Core {
    /// Monotonic submission counter; lower order wins readiness ties.
    counter: u64,
    waiting: HashMap<String, JobRecord>,
    submitted: HashMap<String, JobRecord>,
    unsubmitted: HashMap<String, JobRecord>,
}

/// What an insert or re-add decided to do with the record, applied after
/// the transaction committed.
enum QueuePlan {
    Submit,
    Wait,
    Hold,
    OrderBumped,
}

/// The dependency-graph scheduler.
///
/// Owns a durable DAG of job nodes and a [`JobProducer`] to one board. Every
/// externally-visible operation runs under one lock and performs its graph
/// mutations inside one transaction, so a failure mid-operation leaves no
/// partially-applied edges or states behind.
pub struct DepJobService {
    store: Arc<dyn GraphStore>,
    producer: JobProducer,
    config: SchedulerConfig,
    core: Mutex<Core>,
}

impl DepJobService {
    /// Build the service and start consuming the producer's completion and
    /// failure notices.
    pub fn spawn(
        store: Arc<dyn GraphStore>,
        mut producer: JobProducer,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        let completions = producer.take_completions();
        let failures = producer.take_failures();

        let service = Arc::new(Self {
            store,
            producer,
            config,
            core: Mutex::new(Core::default()),
        });

        if let Some(mut rx) = completions {
            let weak = Arc::downgrade(&service);
            tokio::spawn(async move {
                while let Some(record) = rx.recv().await {
                    let Some(svc) = weak.upgrade() else { break };
                    svc.handle_completion(record).await;
                }
            });
        }
        if let Some(mut rx) = failures {
            let weak = Arc::downgrade(&service);
            tokio::spawn(async move {
                while let Some(record) = rx.recv().await {
                    let Some(svc) = weak.upgrade() else { break };
                    svc.handle_failure(record).await;
                }
            });
        }

        service
    }

    /// Add a job with zero or more prerequisites and submit it when ready.
    pub async fn add_job(&self, record: JobRecord, input_ids: &[&str]) -> Result<()> {
        self.insert_job(record, input_ids, true).await
    }

    /// Add a job without submitting it; `re_add_job` queues it later.
    pub async fn stage_job(&self, record: JobRecord, input_ids: &[&str]) -> Result<()> {
        self.insert_job(record, input_ids, false).await
    }

    async fn insert_job(&self, record: JobRecord, input_ids: &[&str], enqueue: bool) -> Result<()> {
        let mut core = self.core.lock().await;
        let id = record.id.clone();
        tracing::info!(job_id = %id, inputs = ?input_ids, "DISPATCHER: add job");

        let order = core.counter + 1;
        let plan = self.with_txn(|txn| {
            if txn.node_exists(&id)? {
                return Err(JobGraphError::DuplicateJob(id.clone()));
            }
            txn.create_node(&id)?;
            set_node_updatable(txn, &id, record.updatable)?;
            set_node_order(txn, &id, order)?;
            wire_inputs(txn, &id, input_ids)?;
            if !enqueue {
                return Ok(QueuePlan::Hold);
            }
            queue_for_submission(txn, &id)
        })?;
        core.counter = order;

        self.apply_plan(&mut core, plan, record).await;
        Ok(())
    }

    /// Add further prerequisite edges to an existing job. Edges added once a
    /// job is already running or finished may arrive too late to affect it.
    pub async fn add_dependent_jobs(&self, id: &str, input_ids: &[&str]) -> Result<()> {
        let _core = self.core.lock().await;
        tracing::info!(job_id = id, inputs = ?input_ids, "DISPATCHER: add dependent jobs");
        self.with_txn(|txn| {
            if !txn.node_exists(id)? {
                return Err(JobGraphError::JobNotFound(id.to_string()));
            }
            if let Some(state) = node_state(txn, id)? {
                match state {
                    JobState::Cancelled
                    | JobState::Done
                    | JobState::Failed
                    | JobState::Submitted
                    | JobState::Processing => {
                        tracing::warn!(
                            job_id = id,
                            state = %state,
                            "Adding dependent jobs at this point may be ineffectual"
                        );
                    }
                    JobState::Waiting | JobState::NeedsUpdate => {}
                }
            }
            wire_inputs(txn, id, input_ids)
        })
    }

    /// Resubmit a finished, cancelled, invalidated, or staged job. A job
    /// still waiting merely moves to the back of the readiness tie-break.
    pub async fn re_add_job(&self, id: &str) -> Result<()> {
        let mut core = self.core.lock().await;
        tracing::info!(job_id = id, "DISPATCHER: re-add job");

        let next_order = core.counter + 1;
        let record_of = |core: &Core, staged: bool| {
            if staged {
                core.unsubmitted.get(id).cloned()
            } else {
                core.submitted.get(id).cloned()
            }
        };

        let mut record = None;
        let plan = self.with_txn(|txn| {
            if !txn.node_exists(id)? {
                return Err(JobGraphError::JobNotFound(id.to_string()));
            }
            let staged = match node_state(txn, id)? {
                None => true,
                Some(
                    JobState::Cancelled
                    | JobState::Done
                    | JobState::Failed
                    | JobState::NeedsUpdate,
                ) => false,
                Some(JobState::Waiting) => {
                    set_node_order(txn, id, next_order)?;
                    return Ok(QueuePlan::OrderBumped);
                }
                Some(state @ (JobState::Submitted | JobState::Processing)) => {
                    return Err(JobGraphError::InvalidState {
                        action: "re-add",
                        id: id.to_string(),
                        state: state.to_string(),
                    });
                }
            };
            record = record_of(&core, staged);
            if record.is_none() {
                return Err(JobGraphError::Internal(format!(
                    "No record retained for job {id}"
                )));
            }
            queue_for_submission(txn, id)
        })?;

        if matches!(plan, QueuePlan::OrderBumped) {
            core.counter = next_order;
            tracing::info!(
                job_id = id,
                order = next_order,
                "Job is currently waiting; adjusted order"
            );
            return Ok(());
        }

        core.unsubmitted.remove(id);
        let Some(record) = record else {
            return Err(JobGraphError::Internal(format!(
                "No record retained for job {id}"
            )));
        };
        self.apply_plan(&mut core, plan, record).await;
        Ok(())
    }

    async fn apply_plan(&self, core: &mut Core, plan: QueuePlan, record: JobRecord) {
        match plan {
            QueuePlan::Submit => {
                tracing::info!(job_id = %record.id, "DISPATCHER: submitting job");
                core.submitted.insert(record.id.clone(), record.clone());
                self.dispatch(record).await;
            }
            QueuePlan::Wait => {
                tracing::info!(
                    job_id = %record.id,
                    "DISPATCHER: input not ready; job waits"
                );
                core.waiting.insert(record.id.clone(), record);
            }
            QueuePlan::Hold => {
                core.unsubmitted.insert(record.id.clone(), record);
            }
            QueuePlan::OrderBumped => {}
        }
    }

    /// Hand a record to the board. Failures are logged, not propagated: the
    /// graph already carries the SUBMITTED state and a later re-add retries.
    async fn dispatch(&self, record: JobRecord) {
        if let Err(e) = self.producer.add_job(record.clone()).await {
            tracing::error!(job_id = %record.id, error = %e, "Submitting job to board failed");
        }
    }

    /// Cancel one job. Returns whether the job actually moved to CANCELLED.
    /// A job being processed cannot be cancelled from here; signal the
    /// worker out-of-band.
    pub async fn cancel_job(&self, id: &str) -> Result<bool> {
        let mut core = self.core.lock().await;
        tracing::info!(job_id = id, "DISPATCHER: cancel job");

        let mut board_removals = Vec::new();
        let cancelled =
            self.with_txn(|txn| cancel_one(&mut core, txn, id, &mut board_removals))?;
        self.remove_from_board(board_removals).await;
        Ok(cancelled)
    }

    /// Recursively cancel every transitive dependent of `id`. Returns the
    /// ids that actually moved to CANCELLED.
    pub async fn cancel_jobs_dependent_on(&self, id: &str) -> Result<Vec<String>> {
        let mut core = self.core.lock().await;
        tracing::info!(job_id = id, "DISPATCHER: cancel jobs dependent on");

        let mut cancelled = Vec::new();
        let mut board_removals = Vec::new();
        self.with_txn(|txn| {
            cancel_dependents(&mut core, txn, id, &mut cancelled, &mut board_removals)
        })?;
        self.remove_from_board(board_removals).await;
        Ok(cancelled)
    }

    async fn remove_from_board(&self, job_ids: Vec<String>) {
        for job_id in job_ids {
            // Best effort: the worker may have claimed it meanwhile.
            if let Err(e) = self.producer.remove_job(&job_id).await {
                tracing::info!(job_id = %job_id, error = %e, "Board removal failed");
            }
        }
    }

    /// Mark `id` DONE and fan its completion out to dependents: waiting jobs
    /// that became ready are submitted oldest-first; already-running or
    /// finished updatable dependents are invalidated, not re-run.
    ///
    /// Normally driven by the producer's completion stream.
    pub async fn job_done(&self, id: &str) -> Result<()> {
        let mut core = self.core.lock().await;
        let ready = self.with_txn(|txn| {
            if !txn.node_exists(id)? {
                return Err(JobGraphError::JobNotFound(id.to_string()));
            }
            set_node_state(txn, id, JobState::Done)?;
            mark_dependents(txn, id)
        })?;

        let mut to_dispatch = Vec::new();
        for ready_id in ready {
            match core.waiting.remove(&ready_id) {
                Some(record) => {
                    core.submitted.insert(ready_id.clone(), record.clone());
                    to_dispatch.push(record);
                }
                None => {
                    tracing::error!(job_id = %ready_id, "Ready job has no waiting record");
                }
            }
        }
        if !core.waiting.is_empty() {
            tracing::debug!(waiting = ?core.waiting.keys().collect::<Vec<_>>(), "Waiting jobs");
        }
        for record in to_dispatch {
            tracing::info!(job_id = %record.id, "Waiting job is now ready; submitting");
            self.dispatch(record).await;
        }
        Ok(())
    }

    /// Mark `id` FAILED. Dependents are not touched here; the failure
    /// handler cancels them explicitly before calling this.
    ///
    /// Normally driven by the producer's failure stream.
    pub async fn job_failed(&self, id: &str) -> Result<()> {
        let _core = self.core.lock().await;
        self.with_txn(|txn| {
            if !txn.node_exists(id)? {
                return Err(JobGraphError::JobNotFound(id.to_string()));
            }
            set_node_state(txn, id, JobState::Failed)
        })
    }

    /// Current stored state; `None` means staged but never submitted.
    pub async fn get_job_status(&self, id: &str) -> Result<Option<JobState>> {
        let _core = self.core.lock().await;
        self.with_txn(|txn| {
            if !txn.node_exists(id)? {
                return Err(JobGraphError::JobNotFound(id.to_string()));
            }
            node_state(txn, id)
        })
    }

    /// Stored state plus, for a job the board is working on, a live progress
    /// snapshot (bounded by the configured query timeout; the stored state
    /// is returned if the board cannot answer in time). A job observed
    /// running is promoted to PROCESSING.
    pub async fn query_job_stats(&self, id: &str) -> Result<JobStats> {
        let stored = self.get_job_status(id).await?;
        if !matches!(stored, Some(JobState::Submitted | JobState::Processing)) {
            return Ok(JobStats {
                state: stored,
                progress: None,
            });
        }

        let snapshot = match tokio::time::timeout(
            self.config.progress_query_timeout,
            self.producer.get_progress(id),
        )
        .await
        {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => {
                tracing::warn!(job_id = id, error = %e, "Progress query failed");
                return Ok(JobStats {
                    state: stored,
                    progress: None,
                });
            }
            Err(_) => {
                tracing::warn!(job_id = id, "Progress query timed out");
                return Ok(JobStats {
                    state: stored,
                    progress: None,
                });
            }
        };

        let mut state = stored;
        if snapshot.state.is_claimed() {
            let _core = self.core.lock().await;
            self.with_txn(|txn| {
                if matches!(
                    node_state(txn, id)?,
                    Some(JobState::Submitted | JobState::Processing)
                ) {
                    set_node_state(txn, id, JobState::Processing)?;
                }
                Ok(())
            })?;
            state = Some(JobState::Processing);
        }
        Ok(JobStats {
            state,
            progress: snapshot.progress,
        })
    }

    /// Ids of all jobs, or of the jobs currently in `state`.
    pub async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<String>> {
        let _core = self.core.lock().await;
        self.with_txn(|txn| {
            let mut ids = Vec::new();
            for id in txn.node_ids()? {
                match state {
                    None => ids.push(id),
                    Some(wanted) => {
                        if node_state(txn, &id)? == Some(wanted) {
                            ids.push(id);
                        }
                    }
                }
            }
            Ok(ids)
        })
    }

    pub async fn has_job(&self, id: &str) -> Result<bool> {
        let _core = self.core.lock().await;
        self.with_txn(|txn| Ok(txn.node_exists(id)?))
    }

    async fn handle_completion(&self, record: JobRecord) {
        tracing::info!(job_id = %record.id, "DISPATCHER: job complete");
        if self.config.remove_on_completion {
            if let Err(e) = self.producer.remove_job(&record.id).await {
                tracing::debug!(job_id = %record.id, error = %e, "Board removal after completion failed");
            }
        }
        if let Err(e) = self.job_done(&record.id).await {
            tracing::error!(job_id = %record.id, error = %e, "Completion fan-out failed");
        }
    }

    async fn handle_failure(&self, record: JobRecord) {
        tracing::warn!(job_id = %record.id, "DISPATCHER: job failed");
        if self.config.remove_on_failure {
            if let Err(e) = self.producer.remove_job(&record.id).await {
                tracing::debug!(job_id = %record.id, error = %e, "Board removal after failure failed");
            }
        }
        match self.cancel_jobs_dependent_on(&record.id).await {
            Ok(cancelled) if !cancelled.is_empty() => {
                tracing::info!(job_id = %record.id, ?cancelled, "Cancelled dependents of failed job");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(job_id = %record.id, error = %e, "Cancelling dependents failed");
            }
        }
        if let Err(e) = self.job_failed(&record.id).await {
            tracing::error!(job_id = %record.id, error = %e, "Marking job failed failed");
        }
    }

    /// Run `f` inside one transaction: commit on success, roll back on any
    /// error so no partial mutation is ever visible.
    fn with_txn<R>(&self, f: impl FnOnce(&mut dyn GraphTxn) -> Result<R>) -> Result<R> {
        let mut txn = self.store.begin();
        match f(txn.as_mut()) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                txn.rollback();
                Err(e)
            }
        }
    }
}

/// Wire prerequisite edges, failing on any unknown input id.
fn wire_inputs(txn: &mut dyn GraphTxn, id: &str, input_ids: &[&str]) -> Result<()> {
    for input_id in input_ids {
        if !txn.node_exists(input_id)? {
            return Err(JobGraphError::UnknownInput(input_id.to_string()));
        }
        txn.add_edge(id, input_id, INPUT_EDGE)?;
    }
    Ok(())
}

/// A job is ready iff every prerequisite is DONE.
fn is_ready(txn: &dyn GraphTxn, id: &str) -> Result<bool> {
    for input_id in input_jobs(txn, id)? {
        if node_state(txn, &input_id)? != Some(JobState::Done) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Decide between SUBMITTED and WAITING for a job entering the queue.
fn queue_for_submission(txn: &mut dyn GraphTxn, id: &str) -> Result<QueuePlan> {
    if is_ready(txn, id)? {
        set_node_state(txn, id, JobState::Submitted)?;
        Ok(QueuePlan::Submit)
    } else {
        set_node_state(txn, id, JobState::Waiting)?;
        Ok(QueuePlan::Wait)
    }
}

/// Scan the dependents of a just-completed job. Waiting jobs that became
/// ready are marked SUBMITTED and returned in ascending order; updatable
/// dependents that already ran (or are running) are invalidated.
fn mark_dependents(txn: &mut dyn GraphTxn, done_id: &str) -> Result<Vec<String>> {
    let mut ready: BTreeMap<u64, String> = BTreeMap::new();
    for out_id in dependent_jobs(txn, done_id)? {
        match node_state(txn, &out_id)? {
            None => {
                tracing::info!(
                    job_id = %out_id,
                    "Not marking job: it has not been submitted yet"
                );
            }
            Some(JobState::Submitted) | Some(JobState::Done) => {
                if node_updatable(txn, &out_id)? {
                    tracing::info!(
                        done = done_id,
                        job_id = %out_id,
                        "Dependent already ran; marking NEEDS_UPDATE"
                    );
                    set_node_state(txn, &out_id, JobState::NeedsUpdate)?;
                }
            }
            Some(JobState::Processing) => {
                if node_updatable(txn, &out_id)? {
                    tracing::info!(
                        done = done_id,
                        job_id = %out_id,
                        "Dependent is processing; marking NEEDS_UPDATE"
                    );
                    set_node_state(txn, &out_id, JobState::NeedsUpdate)?;
                }
            }
            Some(JobState::NeedsUpdate) => {}
            Some(JobState::Waiting) => {
                if is_ready(txn, &out_id)? {
                    ready.insert(node_order(txn, &out_id)?, out_id.clone());
                }
            }
            Some(state @ (JobState::Cancelled | JobState::Failed)) => {
                tracing::info!(job_id = %out_id, %state, "Not marking job in terminal state");
            }
        }
    }
    for ready_id in ready.values() {
        set_node_state(txn, ready_id, JobState::Submitted)?;
    }
    Ok(ready.into_values().collect())
}

/// Cancel one job in the current transaction. Board removals are collected
/// for the caller to perform once the transaction has committed.
fn cancel_one(
    core: &mut Core,
    txn: &mut dyn GraphTxn,
    id: &str,
    board_removals: &mut Vec<String>,
) -> Result<bool> {
    if !txn.node_exists(id)? {
        return Err(JobGraphError::JobNotFound(id.to_string()));
    }
    match node_state(txn, id)? {
        None => {
            // Keep the record reachable so a later re-add can resubmit.
            if let Some(record) = core.unsubmitted.remove(id) {
                core.submitted.insert(id.to_string(), record);
            }
            set_node_state(txn, id, JobState::Cancelled)?;
            tracing::info!(job_id = id, "Cancelled staged job");
            Ok(true)
        }
        Some(JobState::Waiting) => {
            if let Some(record) = core.waiting.remove(id) {
                core.submitted.insert(id.to_string(), record);
            }
            set_node_state(txn, id, JobState::Cancelled)?;
            tracing::info!(job_id = id, "Cancelled waiting job");
            Ok(true)
        }
        Some(JobState::Submitted) => {
            // The record stays in the submitted map for a later re-add.
            tracing::info!(job_id = id, "Attempting to cancel submitted job");
            board_removals.push(id.to_string());
            set_node_state(txn, id, JobState::Cancelled)?;
            Ok(true)
        }
        Some(state @ JobState::Processing) => {
            tracing::info!(
                job_id = id,
                %state,
                "Not cancelling: ask the job processor to cancel"
            );
            Ok(false)
        }
        Some(
            state @ (JobState::Cancelled
            | JobState::Failed
            | JobState::NeedsUpdate
            | JobState::Done),
        ) => {
            tracing::info!(job_id = id, %state, "Not cancelling");
            Ok(false)
        }
    }
}

/// Recursive cancellation of every transitive dependent.
fn cancel_dependents(
    core: &mut Core,
    txn: &mut dyn GraphTxn,
    id: &str,
    cancelled: &mut Vec<String>,
    board_removals: &mut Vec<String>,
) -> Result<()> {
    if !txn.node_exists(id)? {
        return Err(JobGraphError::JobNotFound(id.to_string()));
    }
    for out_id in dependent_jobs(txn, id)? {
        if cancel_one(core, txn, &out_id, board_removals)? {
            cancelled.push(out_id.clone());
        }
        cancel_dependents(core, txn, &out_id, cancelled, board_removals)?;
    }
    Ok(())
}
