//! Store error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Another transaction committed a conflicting write first. Retryable.
    #[error("commit conflict on {0}")]
    Conflict(String),

    #[error("store is closed")]
    Closed,

    #[error("snapshot IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt snapshot: {0}")]
    Corrupt(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
