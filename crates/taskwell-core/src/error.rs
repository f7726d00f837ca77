//! Error types for the Taskwell domain.

use thiserror::Error;

use crate::id::JobId;
use crate::job::JobStatus;

#[derive(Debug, Error)]
pub enum Error {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("task not registered: {0}")]
    TaskNotRegistered(String),

    #[error("task failed: {0}")]
    TaskFailed(String),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
