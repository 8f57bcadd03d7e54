//! Message transport between producers, boards, and workers.
//!
//! The scheduling core only needs a narrow contract: addressable ordered
//! delivery, request/reply with a timeout, and topic broadcast. [`Bus`]
//! captures that contract; [`LocalBus`] is the in-process implementation
//! used by the binary and the test suite. A deployment that spans processes
//! supplies its own `Bus`.

pub mod local;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::board::ItemState;
use crate::job::JobRecord;
use crate::worker::ProgressState;

pub use local::LocalBus;

/// Message kinds exchanged between the scheduling components. Payloads are
/// opaque to the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Protocol {
    // worker -> board
    Register {
        worker_addr: String,
        worker_type: Option<String>,
    },
    Unregister {
        worker_addr: String,
    },
    SetProgress {
        record: JobRecord,
        progress: ProgressState,
    },
    PartlyDone {
        worker_addr: String,
        record: JobRecord,
    },
    Done {
        worker_addr: String,
        record: JobRecord,
    },
    Fail {
        worker_addr: String,
        record: JobRecord,
    },

    // producer -> board
    AddJob {
        record: JobRecord,
        completion_addr: Option<String>,
        failure_addr: Option<String>,
        retry_limit: u32,
    },
    RemoveJob {
        job_id: String,
    },
    GetProgress {
        job_id: String,
    },

    // board -> worker
    Offer {
        jobs: Vec<JobRecord>,
    },
    PickAck {
        job_id: String,
        proceed: bool,
    },

    // worker -> board (reply to Offer)
    Pick {
        job: Option<JobRecord>,
    },

    // board -> producer
    Completion {
        record: JobRecord,
    },
    Failure {
        record: JobRecord,
    },

    // replies
    Ack,
    Progress {
        record: JobRecord,
        state: ItemState,
        progress: Option<ProgressState>,
    },

    // monitor -> listeners
    ProgressUpdate {
        state: ProgressState,
    },
}

/// Application-level refusal of a request, carried back to the requester
/// with a code and a human-readable reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rejection {
    pub code: i32,
    pub reason: String,
}

impl Rejection {
    pub fn new(code: i32, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.reason)
    }
}

impl std::error::Error for Rejection {}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("No endpoint registered at {0}")]
    Unreachable(String),

    #[error("Endpoint {0} closed its mailbox")]
    Closed(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Request dropped without a reply")]
    NoReply,

    #[error("Request rejected: {0}")]
    Rejected(Rejection),
}

type ReplyTx = oneshot::Sender<std::result::Result<Protocol, Rejection>>;

/// One inbound message plus, for requests, the channel to answer on.
#[derive(Debug)]
pub struct Delivery {
    pub msg: Protocol,
    reply: Option<ReplyTx>,
}

impl Delivery {
    pub fn new(msg: Protocol, reply: Option<ReplyTx>) -> Self {
        Self { msg, reply }
    }

    /// Whether the sender is waiting on a reply.
    pub fn expects_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Take the message apart from its reply channel.
    pub fn split(self) -> (Protocol, Replier) {
        (self.msg, Replier(self.reply))
    }

    /// Answer the request. A reply to a plain send is silently dropped, as
    /// is a reply whose requester has already given up.
    pub fn reply(&mut self, msg: Protocol) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(Ok(msg));
        }
    }

    /// Refuse the request with a code and reason.
    pub fn fail(&mut self, code: i32, reason: impl Into<String>) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(Err(Rejection::new(code, reason)));
        }
    }
}

/// Reply half of a [`Delivery`].
#[derive(Debug)]
pub struct Replier(Option<ReplyTx>);

impl Replier {
    pub fn expects_reply(&self) -> bool {
        self.0.is_some()
    }

    pub fn reply(mut self, msg: Protocol) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(Ok(msg));
        }
    }

    pub fn fail(mut self, code: i32, reason: impl Into<String>) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(Err(Rejection::new(code, reason)));
        }
    }
}

/// Addressable, ordered, at-least-once message transport with request/reply
/// and topic broadcast.
#[async_trait]
pub trait Bus: Send + Sync + 'static {
    /// Deliver `msg` to `addr`, fire-and-forget.
    async fn send(&self, addr: &str, msg: Protocol) -> Result<(), TransportError>;

    /// Deliver `msg` to `addr` and await its reply for at most `timeout`.
    async fn request(
        &self,
        addr: &str,
        msg: Protocol,
        timeout: Duration,
    ) -> Result<Protocol, TransportError>;

    /// Broadcast `msg` to every current subscriber of `topic`.
    async fn publish(&self, topic: &str, msg: Protocol) -> Result<(), TransportError>;

    /// Claim `addr` and return its mailbox. A later registration of the same
    /// address replaces the earlier one.
    fn register(&self, addr: &str, capacity: usize) -> mpsc::Receiver<Delivery>;

    /// Release `addr`; subsequent sends to it fail as unreachable.
    fn unregister(&self, addr: &str);

    /// Listen to a broadcast topic.
    fn subscribe(&self, topic: &str, capacity: usize) -> mpsc::Receiver<Protocol>;
}
