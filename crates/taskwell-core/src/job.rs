//! Job records and the job status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::JobId;

/// Status of a job in the queue.
///
/// Transitions are monotonic: Queued -> Claimed -> Processing ->
/// (Completed | Error). Cancelled is enterable from Queued or Claimed only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the pending sequence.
    Queued,
    /// Removed from the pending sequence by one owner, not yet running.
    Claimed,
    /// A worker is executing the task.
    Processing,
    /// The task returned a value.
    Completed,
    /// The task failed or was not registered.
    Error,
    /// Withdrawn before any worker picked it up.
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Error | JobStatus::Cancelled
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Claimed)
                | (JobStatus::Queued, JobStatus::Cancelled)
                | (JobStatus::Claimed, JobStatus::Processing)
                | (JobStatus::Claimed, JobStatus::Cancelled)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Error)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Claimed => "claimed",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A durable job: task name, opaque input, and lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    /// Key into the task registry.
    pub task_name: String,
    /// Opaque payload handed to the task.
    pub input: serde_json::Value,
    pub status: JobStatus,
    /// Terminal result payload, populated on Completed/Error.
    pub output: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Identifier of the processor that claimed this job.
    pub owner: Option<String>,
}

impl JobRecord {
    /// Create a new queued record for `task_name` with the given input.
    pub fn new(task_name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: JobId::new(),
            task_name: task_name.into(),
            input,
            status: JobStatus::Queued,
            output: None,
            created_at: Utc::now(),
            claimed_at: None,
            completed_at: None,
            owner: None,
        }
    }
}
