use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{JobGraphError, Result};
use crate::graph::GraphTxn;

/// Property keys of a job node in the dependency graph.
pub(crate) const STATE_KEY: &str = "state";
pub(crate) const ORDER_KEY: &str = "order";
pub(crate) const UPDATABLE_KEY: &str = "updatable";

/// Label of the dependency edge, pointing from a job to one of its
/// prerequisites. Dependents are found by walking the same edges backwards,
/// so the two directions can never disagree.
pub(crate) const INPUT_EDGE: &str = "input";

/// Lifecycle of a job node in the dependency graph. A node with no stored
/// state has never been through a submission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Waiting,
    Submitted,
    Processing,
    Done,
    Failed,
    Cancelled,
    NeedsUpdate,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Waiting => "WAITING",
            JobState::Submitted => "SUBMITTED",
            JobState::Processing => "PROCESSING",
            JobState::Done => "DONE",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
            JobState::NeedsUpdate => "NEEDS_UPDATE",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobState {
    type Err = JobGraphError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "WAITING" => Ok(JobState::Waiting),
            "SUBMITTED" => Ok(JobState::Submitted),
            "PROCESSING" => Ok(JobState::Processing),
            "DONE" => Ok(JobState::Done),
            "FAILED" => Ok(JobState::Failed),
            "CANCELLED" => Ok(JobState::Cancelled),
            "NEEDS_UPDATE" => Ok(JobState::NeedsUpdate),
            other => Err(JobGraphError::Internal(format!(
                "Unknown job state stored in graph: {other}"
            ))),
        }
    }
}

/// Read a node's state; `None` means the node was never submitted.
pub(crate) fn node_state(txn: &dyn GraphTxn, id: &str) -> Result<Option<JobState>> {
    match txn.prop(id, STATE_KEY)? {
        Some(value) => match value.as_str() {
            Some(s) => Ok(Some(s.parse()?)),
            None => Err(JobGraphError::Internal(format!(
                "Non-string state on node {id}: {value}"
            ))),
        },
        None => Ok(None),
    }
}

pub(crate) fn set_node_state(txn: &mut dyn GraphTxn, id: &str, state: JobState) -> Result<()> {
    txn.put_prop(id, STATE_KEY, json!(state.to_string()))?;
    Ok(())
}

pub(crate) fn node_order(txn: &dyn GraphTxn, id: &str) -> Result<u64> {
    Ok(txn
        .prop(id, ORDER_KEY)?
        .and_then(|v| v.as_u64())
        .unwrap_or(0))
}

pub(crate) fn set_node_order(txn: &mut dyn GraphTxn, id: &str, order: u64) -> Result<()> {
    txn.put_prop(id, ORDER_KEY, json!(order))?;
    Ok(())
}

pub(crate) fn node_updatable(txn: &dyn GraphTxn, id: &str) -> Result<bool> {
    Ok(txn
        .prop(id, UPDATABLE_KEY)?
        .and_then(|v| v.as_bool())
        .unwrap_or(false))
}

pub(crate) fn set_node_updatable(txn: &mut dyn GraphTxn, id: &str, updatable: bool) -> Result<()> {
    txn.put_prop(id, UPDATABLE_KEY, json!(updatable))?;
    Ok(())
}

/// Prerequisites of `id`.
pub(crate) fn input_jobs(txn: &dyn GraphTxn, id: &str) -> Result<Vec<String>> {
    Ok(txn.out_neighbors(id, INPUT_EDGE)?)
}

/// Jobs depending on `id`.
pub(crate) fn dependent_jobs(txn: &dyn GraphTxn, id: &str) -> Result<Vec<String>> {
    Ok(txn.in_neighbors(id, INPUT_EDGE)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphStore, MemoryGraph};

    #[test]
    fn state_round_trips_through_properties() {
        let graph = MemoryGraph::new();
        let mut txn = graph.begin();
        txn.create_node("a").unwrap();

        assert_eq!(node_state(&*txn, "a").unwrap(), None);
        set_node_state(&mut *txn, "a", JobState::NeedsUpdate).unwrap();
        assert_eq!(
            node_state(&*txn, "a").unwrap(),
            Some(JobState::NeedsUpdate)
        );
    }

    #[test]
    fn display_and_parse_agree() {
        for state in [
            JobState::Waiting,
            JobState::Submitted,
            JobState::Processing,
            JobState::Done,
            JobState::Failed,
            JobState::Cancelled,
            JobState::NeedsUpdate,
        ] {
            assert_eq!(state.to_string().parse::<JobState>().unwrap(), state);
        }
    }

    #[test]
    fn edges_expose_inputs_and_dependents_consistently() {
        let graph = MemoryGraph::new();
        let mut txn = graph.begin();
        txn.create_node("a").unwrap();
        txn.create_node("b").unwrap();
        txn.add_edge("b", "a", INPUT_EDGE).unwrap();

        assert_eq!(input_jobs(&*txn, "b").unwrap(), vec!["a"]);
        assert_eq!(dependent_jobs(&*txn, "a").unwrap(), vec!["b"]);
    }
}
