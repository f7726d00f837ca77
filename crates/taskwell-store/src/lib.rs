//! Transactional object store for the Taskwell job processor.
//!
//! The store holds the durable object graph (job records, the pending
//! sequence, the service flags) behind snapshot transactions with optimistic
//! concurrency: conflicting commits raise [`StoreError::Conflict`] and the
//! caller retries at the transaction boundary. A store opened on a path
//! persists the graph to a JSON snapshot file after each commit, so ids and
//! service state survive restarts.

pub mod error;
mod graph;
mod store;
mod txn;

pub use error::{StoreError, StoreResult};
pub use store::Store;
pub use txn::Transaction;
