use std::time::Duration;

/// Configuration for a [`JobBoard`](crate::board::JobBoard).
///
/// One board serves one service type; producers and consumers find it by its
/// bus address.
#[derive(Debug, Clone)]
pub struct BoardConfig {
    /// How long the board waits for a worker to answer a job offer before
    /// dropping that worker from the idle pool.
    pub negotiation_timeout: Duration,
    /// Interval for the periodic status summary log. `None` disables it.
    pub status_log_interval: Option<Duration>,
    /// Consecutive identical status lines suppressed before re-logging.
    pub same_log_threshold: u32,
    /// Mailbox capacity for the board actor.
    pub mailbox_capacity: usize,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout: Duration::from_secs(10),
            status_log_interval: None,
            same_log_threshold: 10,
            mailbox_capacity: 64,
        }
    }
}

impl BoardConfig {
    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    pub fn with_status_log(mut self, interval: Duration, same_log_threshold: u32) -> Self {
        self.status_log_interval = Some(interval);
        self.same_log_threshold = same_log_threshold;
        self
    }
}

/// Configuration for a [`DepJobService`](crate::scheduler::DepJobService).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Remove the board's job item once its completion is processed.
    pub remove_on_completion: bool,
    /// Remove the board's job item once its failure is processed.
    pub remove_on_failure: bool,
    /// Bound on the live progress query made by `query_job_stats`.
    pub progress_query_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            remove_on_completion: true,
            remove_on_failure: false,
            progress_query_timeout: Duration::from_secs(10),
        }
    }
}

/// Configuration for a [`JobConsumer`](crate::worker::JobConsumer).
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Request timeout for reports sent to the board.
    pub report_timeout: Duration,
    /// Mailbox capacity for the consumer actor.
    pub mailbox_capacity: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            report_timeout: Duration::from_secs(10),
            mailbox_capacity: 16,
        }
    }
}
