//! The durable graph store the dependency scheduler writes through.
//!
//! The scheduler only needs nodes with string-keyed properties, directed
//! labeled edges, and transactions. [`GraphStore`] captures that contract;
//! [`MemoryGraph`] is the in-memory implementation shipped here. Nesting is
//! tracked on the transaction handle itself: an inner begin/commit pair is a
//! no-op against the outer transaction, and a rollback anywhere wins when
//! the outermost level closes.

pub mod memory;

use thiserror::Error;

pub use memory::MemoryGraph;

/// Property values stored on graph nodes.
pub type PropValue = serde_json::Value;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Transaction is closed")]
    TxnClosed,

    #[error("Store backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// One transaction against a [`GraphStore`].
///
/// Every mutation between `begin` and the outermost `commit` becomes
/// visible atomically; `rollback` at any nesting level discards the whole
/// transaction. Dropping an open handle discards it too.
pub trait GraphTxn: Send {
    fn create_node(&mut self, id: &str) -> StoreResult<()>;
    fn delete_node(&mut self, id: &str) -> StoreResult<()>;
    fn node_exists(&self, id: &str) -> StoreResult<bool>;
    fn node_ids(&self) -> StoreResult<Vec<String>>;

    fn put_prop(&mut self, id: &str, key: &str, value: PropValue) -> StoreResult<()>;
    fn prop(&self, id: &str, key: &str) -> StoreResult<Option<PropValue>>;

    /// Add a directed labeled edge. Idempotent.
    fn add_edge(&mut self, from: &str, to: &str, label: &str) -> StoreResult<()>;
    fn has_edge(&self, from: &str, to: &str, label: &str) -> StoreResult<bool>;
    /// Targets of edges leaving `id` with `label`, in insertion order.
    fn out_neighbors(&self, id: &str, label: &str) -> StoreResult<Vec<String>>;
    /// Sources of edges arriving at `id` with `label`, in insertion order.
    fn in_neighbors(&self, id: &str, label: &str) -> StoreResult<Vec<String>>;

    /// Open a nested level; pairs with one `commit` or `rollback`.
    fn begin_nested(&mut self);
    /// Close one level. Returns true when the outermost level applied.
    fn commit(&mut self) -> StoreResult<bool>;
    /// Discard the whole transaction once the outermost level closes.
    fn rollback(&mut self);
}

/// Transactional node/edge storage.
pub trait GraphStore: Send + Sync + 'static {
    /// Open a transaction at nesting depth one.
    fn begin(&self) -> Box<dyn GraphTxn>;
}
