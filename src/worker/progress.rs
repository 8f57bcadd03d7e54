use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::job::JobRecord;
use crate::transport::{Bus, Protocol};
use crate::worker::{JobOutcome, JobWorker};

const START_TIME: &str = "startTime";
const ELAPSED_MILLIS: &str = "elapsedMillis";

/// Progress of one running job. Percent is within [-100, 100]; a negative
/// value encodes failure with partial progress.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressState {
    pub percent: i32,
    pub message: Option<String>,
    pub metrics: HashMap<String, Value>,
    pub job_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
}

impl ProgressState {
    pub fn new(percent: i32, message: impl Into<String>) -> Self {
        Self {
            percent,
            message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Mark the job as started: percent 1, start time recorded.
    pub fn starting(&mut self, job_id: impl Into<String>, msg: Option<String>) {
        let job_id = job_id.into();
        let now = Utc::now();
        self.metrics.clear();
        self.metrics
            .insert(START_TIME.to_string(), Value::String(now.to_rfc3339()));
        self.start_time = Some(now);
        self.percent = 1;
        let msg = msg.unwrap_or_else(|| format!("Starting {job_id} at {now}"));
        tracing::info!("JOB: Starting: {msg}");
        self.message = Some(msg);
        self.job_id = Some(job_id);
    }

    /// Mark the job done: percent 100, elapsed time recorded.
    pub fn done(&mut self, msg: Option<String>) {
        self.percent = 100;
        self.record_elapsed();
        let msg = msg.unwrap_or_else(|| {
            format!(
                "{} done in {} seconds.",
                self.job_id.as_deref().unwrap_or("job"),
                self.elapsed_millis() / 1000
            )
        });
        tracing::info!("JOB: Done: {msg}");
        self.message = Some(msg);
    }

    /// Mark the job failed: percent forced negative, elapsed time recorded.
    pub fn failed(&mut self, msg: impl Into<String>) {
        if self.percent == 0 {
            self.percent = -1;
        } else if self.percent > 0 {
            self.percent = -self.percent;
        }
        let msg = msg.into();
        tracing::warn!(
            job_id = ?self.job_id,
            metrics = ?self.metrics,
            "JOB: Failed: {msg}"
        );
        self.message = Some(msg);
        self.record_elapsed();
    }

    fn elapsed_millis(&self) -> i64 {
        self.start_time
            .map(|t| (Utc::now() - t).num_milliseconds())
            .unwrap_or(0)
    }

    fn record_elapsed(&mut self) {
        self.metrics.insert(
            ELAPSED_MILLIS.to_string(),
            Value::from(self.elapsed_millis()),
        );
    }
}

/// Anything that can report the current progress of a running job.
pub trait ProgressSource: Send + Sync + 'static {
    fn progress(&self) -> ProgressState;
}

impl ProgressSource for Arc<Mutex<ProgressState>> {
    fn progress(&self) -> ProgressState {
        self.lock().expect("progress lock poisoned").clone()
    }
}

/// Broadcasts a job's [`ProgressState`] to its progress topic plus any
/// additionally registered listener topics.
///
/// If the job asked for polling (`progress_poll_interval_secs > 0`), a
/// poller task reads the source on that interval and publishes each
/// snapshot. An update with percent at or beyond the terminal bounds stops
/// the poller; stopping is idempotent.
pub struct ProgressMonitor {
    bus: Arc<dyn Bus>,
    job_id: String,
    topic: String,
    extra_topics: Vec<String>,
    poll_interval: Duration,
    cancel: CancellationToken,
    last_percent_sent: Mutex<i32>,
}

impl ProgressMonitor {
    pub fn new(
        bus: Arc<dyn Bus>,
        job_id: impl Into<String>,
        topic: impl Into<String>,
        poll_interval_secs: u32,
    ) -> Self {
        Self {
            bus,
            job_id: job_id.into(),
            topic: topic.into(),
            extra_topics: Vec::new(),
            poll_interval: Duration::from_secs(poll_interval_secs.into()),
            cancel: CancellationToken::new(),
            last_percent_sent: Mutex::new(0),
        }
    }

    /// Also broadcast every update to `topic`.
    pub fn add_listener_topic(&mut self, topic: impl Into<String>) {
        self.extra_topics.push(topic.into());
    }

    /// Start the poller, if the job asked for one.
    pub fn watch(self: Arc<Self>, source: Arc<dyn ProgressSource>) {
        if self.poll_interval.is_zero() {
            tracing::warn!(job_id = %self.job_id, "Polling not started: poll interval is zero");
            return;
        }
        let monitor = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = monitor.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let state = source.progress();
                        tracing::debug!(job_id = %monitor.job_id, percent = state.percent, "Progress poll");
                        monitor.update(state).await;
                    }
                }
            }
        });
    }

    /// Broadcast one progress snapshot. Terminal percent values stop the
    /// poller.
    pub async fn update(&self, state: ProgressState) {
        self.check_against_last_percent(&state);
        if state.percent < 0 || state.percent >= 100 {
            self.stop();
        }
        self.broadcast(state).await;
    }

    /// Cancel the poller. Safe to call more than once.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    async fn broadcast(&self, state: ProgressState) {
        let msg = Protocol::ProgressUpdate { state };
        if let Err(e) = self.bus.publish(&self.topic, msg.clone()).await {
            tracing::warn!(topic = %self.topic, error = %e, "Progress broadcast failed");
        }
        for topic in &self.extra_topics {
            if let Err(e) = self.bus.publish(topic, msg.clone()).await {
                tracing::warn!(topic = %topic, error = %e, "Progress broadcast failed");
            }
        }
    }

    // Sanity check only; a regression is logged, never fatal.
    fn check_against_last_percent(&self, state: &ProgressState) {
        let mut last = self.last_percent_sent.lock().expect("percent lock poisoned");
        if state.percent > 0 && state.percent < *last {
            tracing::warn!(
                job_id = %self.job_id,
                "Not expecting to send {} < {}",
                state.percent,
                *last
            );
        }
        if state.percent > 100 {
            tracing::warn!(job_id = %self.job_id, "Not expecting percent > 100: {}", state.percent);
        }
        *last = state.percent;
    }
}

type WorkFn =
    Arc<dyn Fn(&JobRecord) -> std::result::Result<(), String> + Send + Sync + 'static>;
type CanDoFn = Arc<dyn Fn(&JobRecord) -> bool + Send + Sync + 'static>;

/// A [`JobWorker`] built from a plain work closure and a shared progress
/// state. Per job it attaches a [`ProgressMonitor`] (when the record names a
/// progress channel), marks the shared state starting/done/failed around the
/// closure, and reports the outcome.
pub struct ReportingWorker {
    bus: Arc<dyn Bus>,
    state: Arc<Mutex<ProgressState>>,
    work: WorkFn,
    can_do: CanDoFn,
}

impl ReportingWorker {
    pub fn new(
        bus: Arc<dyn Bus>,
        work: impl Fn(&JobRecord) -> std::result::Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            bus,
            state: Arc::new(Mutex::new(ProgressState::default())),
            work: Arc::new(work),
            can_do: Arc::new(|_| true),
        }
    }

    pub fn with_can_do(
        mut self,
        can_do: impl Fn(&JobRecord) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.can_do = Arc::new(can_do);
        self
    }

    /// Shared progress state the work closure may update from inside.
    pub fn progress_state(&self) -> Arc<Mutex<ProgressState>> {
        Arc::clone(&self.state)
    }

    fn monitor_for(&self, job: &JobRecord) -> Option<Arc<ProgressMonitor>> {
        job.progress_addr.as_ref().map(|addr| {
            Arc::new(ProgressMonitor::new(
                Arc::clone(&self.bus),
                job.id.clone(),
                addr.clone(),
                job.progress_poll_interval_secs,
            ))
        })
    }
}

#[async_trait]
impl JobWorker for ReportingWorker {
    fn can_do(&self, job: &JobRecord) -> bool {
        (self.can_do)(job)
    }

    async fn run(&self, job: &JobRecord) -> Result<JobOutcome> {
        let monitor = self.monitor_for(job);
        if let Some(monitor) = &monitor {
            Arc::clone(monitor).watch(Arc::new(Arc::clone(&self.state)));
        }

        self.state
            .lock()
            .expect("progress lock poisoned")
            .starting(&job.id, None);

        let outcome = (self.work)(job);

        let final_state = {
            let mut state = self.state.lock().expect("progress lock poisoned");
            match &outcome {
                Ok(()) => state.done(None),
                Err(reason) => {
                    tracing::error!(job_id = %job.id, reason = %reason, "WORKER: Error during job processing");
                    state.failed(reason.clone());
                }
            }
            state.clone()
        };

        if let Some(monitor) = &monitor {
            monitor.update(final_state).await;
            monitor.stop();
        }

        Ok(match outcome {
            Ok(()) => JobOutcome::Done,
            Err(_) => JobOutcome::Failed,
        })
    }
}
