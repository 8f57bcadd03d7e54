use thiserror::Error;

use crate::graph::StoreError;
use crate::transport::{Rejection, TransportError};

#[derive(Error, Debug)]
pub enum JobGraphError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job already exists: {0}")]
    DuplicateJob(String),

    #[error("Unknown prerequisite job: {0}")]
    UnknownInput(String),

    #[error("Cannot {action} job {id} in state {state}")]
    InvalidState {
        action: &'static str,
        id: String,
        state: String,
    },

    #[error("Rejected by board: {0}")]
    Rejected(#[from] Rejection),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Graph store error: {0}")]
    Store(#[from] StoreError),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Unexpected reply to {0}")]
    UnexpectedReply(&'static str),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, JobGraphError>;
