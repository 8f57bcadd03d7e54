use serde::{Deserialize, Serialize};

use crate::job::JobRecord;
use crate::worker::ProgressState;

/// Lifecycle of a job item on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemState {
    Available,
    Started,
    Progressing,
    Done,
    Failed,
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemState::Available => write!(f, "AVAILABLE"),
            ItemState::Started => write!(f, "STARTED"),
            ItemState::Progressing => write!(f, "PROGRESSING"),
            ItemState::Done => write!(f, "DONE"),
            ItemState::Failed => write!(f, "FAILED"),
        }
    }
}

impl ItemState {
    /// A claimed item; it cannot be replaced or removed while in this state.
    pub fn is_claimed(&self) -> bool {
        matches!(self, ItemState::Started | ItemState::Progressing)
    }
}

/// One outstanding job on the board. Never auto-deleted; the producer
/// decides when a finished item goes away.
#[derive(Debug)]
pub struct JobItem {
    pub record: JobRecord,
    pub completion_addr: Option<String>,
    pub failure_addr: Option<String>,
    /// Retries allowed after the first failing attempt; 0 means don't retry.
    pub retry_limit: u32,
    pub fail_count: u32,
    /// Insertion order, used to offer candidates FIFO by submission.
    pub seq: u64,
    pub state: ItemState,
    pub progress: Option<ProgressState>,
}

impl JobItem {
    pub fn new(
        record: JobRecord,
        completion_addr: Option<String>,
        failure_addr: Option<String>,
        retry_limit: u32,
        seq: u64,
    ) -> Self {
        Self {
            record,
            completion_addr,
            failure_addr,
            retry_limit,
            fail_count: 0,
            seq,
            state: ItemState::Available,
            progress: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }
}

/// A worker known to the board: its reply address and declared capability.
/// `job_type == None` matches every job.
#[derive(Debug, Clone)]
pub struct Worker {
    pub addr: String,
    pub job_type: Option<String>,
}

/// Tracks the board's workers across three disjoint groups: everything that
/// ever registered, the idle pool offers go to, and the picky pool of idle
/// workers that declined the latest offer and wait for a new job.
#[derive(Debug, Default)]
pub struct WorkerPool {
    known: std::collections::HashMap<String, Worker>,
    idle: Vec<String>,
    picky: Vec<String>,
}

impl WorkerPool {
    /// Register a worker and mark it idle. Idempotent.
    pub fn register(&mut self, addr: &str, job_type: Option<String>) {
        if self.known.contains_key(addr) {
            tracing::info!(addr, "Worker already registered");
        } else {
            self.known.insert(
                addr.to_string(),
                Worker {
                    addr: addr.to_string(),
                    job_type,
                },
            );
        }
        self.make_idle(addr);
    }

    pub fn job_type_of(&self, addr: &str) -> Option<&Option<String>> {
        self.known.get(addr).map(|w| &w.job_type)
    }

    /// Add to the idle pool, preserving insertion order. Returns false if
    /// the worker was already idle.
    pub fn make_idle(&mut self, addr: &str) -> bool {
        if self.idle.iter().any(|a| a == addr) {
            return false;
        }
        self.idle.push(addr.to_string());
        true
    }

    /// Remove from the idle pool. Returns false if it was not idle.
    pub fn remove_idle(&mut self, addr: &str) -> bool {
        let before = self.idle.len();
        self.idle.retain(|a| a != addr);
        before != self.idle.len()
    }

    /// Move an idle worker to the picky pool.
    pub fn make_picky(&mut self, addr: &str) {
        if !self.remove_idle(addr) {
            tracing::error!(addr, idle = ?self.idle, "Could not remove worker from idle pool");
            return;
        }
        if self.picky.iter().any(|a| a == addr) {
            tracing::error!(addr, "Worker already in picky pool");
        } else {
            self.picky.push(addr.to_string());
        }
    }

    /// Move every picky worker back to idle; a new job may interest them.
    pub fn wake_picky(&mut self) {
        for addr in std::mem::take(&mut self.picky) {
            if self.idle.iter().all(|a| *a != addr) {
                self.idle.push(addr);
            }
        }
    }

    pub fn first_idle(&self) -> Option<&str> {
        self.idle.first().map(String::as_str)
    }

    pub fn is_idle(&self, addr: &str) -> bool {
        self.idle.iter().any(|a| a == addr)
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    pub fn picky_count(&self) -> usize {
        self.picky.len()
    }

    pub fn known_count(&self) -> usize {
        self.known.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent() {
        let mut pool = WorkerPool::default();
        pool.register("w1", Some("index".into()));
        pool.register("w1", Some("index".into()));
        assert_eq!(pool.known_count(), 1);
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn picky_workers_wake_on_demand() {
        let mut pool = WorkerPool::default();
        pool.register("w1", None);
        pool.register("w2", None);

        pool.make_picky("w1");
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.picky_count(), 1);
        assert_eq!(pool.first_idle(), Some("w2"));

        pool.wake_picky();
        assert_eq!(pool.idle_count(), 2);
        assert_eq!(pool.picky_count(), 0);
    }

    #[test]
    fn idle_order_is_insertion_order() {
        let mut pool = WorkerPool::default();
        pool.register("w1", None);
        pool.register("w2", None);
        pool.register("w3", None);
        assert_eq!(pool.first_idle(), Some("w1"));
        pool.remove_idle("w1");
        assert_eq!(pool.first_idle(), Some("w2"));
        pool.make_idle("w1");
        assert_eq!(pool.first_idle(), Some("w2"));
    }

    #[test]
    fn claimed_states() {
        assert!(ItemState::Started.is_claimed());
        assert!(ItemState::Progressing.is_claimed());
        assert!(!ItemState::Available.is_claimed());
        assert!(!ItemState::Done.is_claimed());
        assert!(!ItemState::Failed.is_claimed());
    }
}
