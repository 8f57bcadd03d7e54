use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{GraphStore, GraphTxn, PropValue, StoreError, StoreResult};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Edge {
    from: String,
    to: String,
    label: String,
}

#[derive(Debug, Clone, Default)]
struct GraphData {
    nodes: HashMap<String, HashMap<String, PropValue>>,
    edges: Vec<Edge>,
}

/// In-memory [`GraphStore`] with snapshot-isolation transactions: a
/// transaction works on a copy of the data and the outermost commit swaps
/// it in whole, so readers never observe a partially-applied operation.
#[derive(Debug, Default)]
pub struct MemoryGraph {
    data: Arc<Mutex<GraphData>>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GraphStore for MemoryGraph {
    fn begin(&self) -> Box<dyn GraphTxn> {
        let working = self.data.lock().expect("graph lock poisoned").clone();
        Box::new(MemoryTxn {
            data: Arc::clone(&self.data),
            working,
            depth: 1,
            rolled_back: false,
            closed: false,
        })
    }
}

pub struct MemoryTxn {
    data: Arc<Mutex<GraphData>>,
    working: GraphData,
    depth: u32,
    rolled_back: bool,
    closed: bool,
}

impl MemoryTxn {
    fn check_open(&self) -> StoreResult<()> {
        if self.closed {
            Err(StoreError::TxnClosed)
        } else {
            Ok(())
        }
    }

    fn check_node(&self, id: &str) -> StoreResult<()> {
        if self.working.nodes.contains_key(id) {
            Ok(())
        } else {
            Err(StoreError::NodeNotFound(id.to_string()))
        }
    }
}

impl GraphTxn for MemoryTxn {
    fn create_node(&mut self, id: &str) -> StoreResult<()> {
        self.check_open()?;
        if self.working.nodes.contains_key(id) {
            return Err(StoreError::NodeExists(id.to_string()));
        }
        self.working.nodes.insert(id.to_string(), HashMap::new());
        Ok(())
    }

    fn delete_node(&mut self, id: &str) -> StoreResult<()> {
        self.check_open()?;
        if self.working.nodes.remove(id).is_none() {
            return Err(StoreError::NodeNotFound(id.to_string()));
        }
        self.working.edges.retain(|e| e.from != id && e.to != id);
        Ok(())
    }

    fn node_exists(&self, id: &str) -> StoreResult<bool> {
        self.check_open()?;
        Ok(self.working.nodes.contains_key(id))
    }

    fn node_ids(&self) -> StoreResult<Vec<String>> {
        self.check_open()?;
        Ok(self.working.nodes.keys().cloned().collect())
    }

    fn put_prop(&mut self, id: &str, key: &str, value: PropValue) -> StoreResult<()> {
        self.check_open()?;
        match self.working.nodes.get_mut(id) {
            Some(props) => {
                props.insert(key.to_string(), value);
                Ok(())
            }
            None => Err(StoreError::NodeNotFound(id.to_string())),
        }
    }

    fn prop(&self, id: &str, key: &str) -> StoreResult<Option<PropValue>> {
        self.check_open()?;
        self.check_node(id)?;
        Ok(self
            .working
            .nodes
            .get(id)
            .and_then(|props| props.get(key))
            .cloned())
    }

    fn add_edge(&mut self, from: &str, to: &str, label: &str) -> StoreResult<()> {
        self.check_open()?;
        self.check_node(from)?;
        self.check_node(to)?;
        let edge = Edge {
            from: from.to_string(),
            to: to.to_string(),
            label: label.to_string(),
        };
        if !self.working.edges.contains(&edge) {
            self.working.edges.push(edge);
        }
        Ok(())
    }

    fn has_edge(&self, from: &str, to: &str, label: &str) -> StoreResult<bool> {
        self.check_open()?;
        Ok(self
            .working
            .edges
            .iter()
            .any(|e| e.from == from && e.to == to && e.label == label))
    }

    fn out_neighbors(&self, id: &str, label: &str) -> StoreResult<Vec<String>> {
        self.check_open()?;
        self.check_node(id)?;
        Ok(self
            .working
            .edges
            .iter()
            .filter(|e| e.from == id && e.label == label)
            .map(|e| e.to.clone())
            .collect())
    }

    fn in_neighbors(&self, id: &str, label: &str) -> StoreResult<Vec<String>> {
        self.check_open()?;
        self.check_node(id)?;
        Ok(self
            .working
            .edges
            .iter()
            .filter(|e| e.to == id && e.label == label)
            .map(|e| e.from.clone())
            .collect())
    }

    fn begin_nested(&mut self) {
        if !self.closed {
            self.depth += 1;
        }
    }

    fn commit(&mut self) -> StoreResult<bool> {
        self.check_open()?;
        self.depth -= 1;
        if self.depth > 0 {
            return Ok(false);
        }
        self.closed = true;
        if self.rolled_back {
            tracing::warn!("Rolling back outermost graph transaction");
            return Ok(false);
        }
        *self.data.lock().expect("graph lock poisoned") = std::mem::take(&mut self.working);
        Ok(true)
    }

    fn rollback(&mut self) {
        if self.closed {
            return;
        }
        self.rolled_back = true;
        self.depth = self.depth.saturating_sub(1);
        if self.depth == 0 {
            self.closed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn commit_makes_mutations_visible() {
        let graph = MemoryGraph::new();
        {
            let mut txn = graph.begin();
            txn.create_node("a").unwrap();
            txn.put_prop("a", "state", json!("WAITING")).unwrap();
            assert!(txn.commit().unwrap());
        }
        let txn = graph.begin();
        assert!(txn.node_exists("a").unwrap());
        assert_eq!(txn.prop("a", "state").unwrap(), Some(json!("WAITING")));
    }

    #[test]
    fn rollback_discards_everything() {
        let graph = MemoryGraph::new();
        {
            let mut txn = graph.begin();
            txn.create_node("a").unwrap();
            txn.rollback();
        }
        let txn = graph.begin();
        assert!(!txn.node_exists("a").unwrap());
    }

    #[test]
    fn dropped_open_transaction_discards() {
        let graph = MemoryGraph::new();
        {
            let mut txn = graph.begin();
            txn.create_node("a").unwrap();
            // dropped without commit
        }
        let txn = graph.begin();
        assert!(!txn.node_exists("a").unwrap());
    }

    #[test]
    fn nested_commit_is_a_no_op_against_the_outer_transaction() {
        let graph = MemoryGraph::new();
        let mut txn = graph.begin();
        txn.create_node("a").unwrap();

        txn.begin_nested();
        txn.create_node("b").unwrap();
        assert!(!txn.commit().unwrap()); // inner: nothing applied yet

        {
            let peek = graph.begin();
            assert!(!peek.node_exists("a").unwrap());
        }

        assert!(txn.commit().unwrap()); // outermost applies both
        let txn = graph.begin();
        assert!(txn.node_exists("a").unwrap());
        assert!(txn.node_exists("b").unwrap());
    }

    #[test]
    fn nested_rollback_poisons_the_outer_commit() {
        let graph = MemoryGraph::new();
        let mut txn = graph.begin();
        txn.create_node("a").unwrap();

        txn.begin_nested();
        txn.create_node("b").unwrap();
        txn.rollback(); // inner rollback

        assert!(!txn.commit().unwrap()); // outer commit discards
        let txn = graph.begin();
        assert!(!txn.node_exists("a").unwrap());
        assert!(!txn.node_exists("b").unwrap());
    }

    #[test]
    fn operations_after_close_fail() {
        let graph = MemoryGraph::new();
        let mut txn = graph.begin();
        txn.commit().unwrap();
        assert!(matches!(txn.create_node("a"), Err(StoreError::TxnClosed)));
    }

    #[test]
    fn edges_are_deduplicated_and_traversable_both_ways() {
        let graph = MemoryGraph::new();
        let mut txn = graph.begin();
        txn.create_node("b").unwrap();
        txn.create_node("a").unwrap();
        txn.add_edge("b", "a", "input").unwrap();
        txn.add_edge("b", "a", "input").unwrap();

        assert_eq!(txn.out_neighbors("b", "input").unwrap(), vec!["a"]);
        assert_eq!(txn.in_neighbors("a", "input").unwrap(), vec!["b"]);
        assert!(txn.has_edge("b", "a", "input").unwrap());
        assert!(!txn.has_edge("a", "b", "input").unwrap());
    }

    #[test]
    fn delete_node_removes_its_edges() {
        let graph = MemoryGraph::new();
        let mut txn = graph.begin();
        txn.create_node("a").unwrap();
        txn.create_node("b").unwrap();
        txn.add_edge("b", "a", "input").unwrap();
        txn.delete_node("a").unwrap();
        assert_eq!(txn.out_neighbors("b", "input").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn duplicate_node_is_an_error() {
        let graph = MemoryGraph::new();
        let mut txn = graph.begin();
        txn.create_node("a").unwrap();
        assert!(matches!(
            txn.create_node("a"),
            Err(StoreError::NodeExists(_))
        ));
    }

    #[test]
    fn edge_to_unknown_node_is_an_error() {
        let graph = MemoryGraph::new();
        let mut txn = graph.begin();
        txn.create_node("a").unwrap();
        assert!(matches!(
            txn.add_edge("a", "missing", "input"),
            Err(StoreError::NodeNotFound(_))
        ));
    }
}
