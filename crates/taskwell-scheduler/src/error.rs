//! Scheduler error types.

use taskwell_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("{0}")]
    Domain(#[from] taskwell_core::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("processing already started")]
    AlreadyProcessing,

    #[error("invalid processor settings: {0}")]
    Settings(#[from] serde_json::Error),
}

impl SchedulerError {
    /// Whether this is a retryable optimistic-concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, SchedulerError::Store(err) if err.is_conflict())
    }
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
