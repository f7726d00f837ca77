//! Worker-side execution for the pool processor.
//!
//! Each worker owns its own transaction: the job is already claimed when it
//! arrives here, and the worker commits PROCESSING -> terminal on its own.

use std::sync::Arc;

use taskwell_core::{JobId, Task, TaskContext};
use tracing::{debug, info, warn};

use crate::error::SchedulerResult;
use crate::processor::conflict_backoff;
use crate::queue::JobQueue;

pub(crate) enum WorkerOutcome {
    Finished,
    /// The task doomed the worker's transaction.
    Aborted,
    /// Conflict retries exhausted; the job stays claimed.
    GaveUp,
}

/// Execute a claimed job and commit its outcome.
pub(crate) async fn execute_claimed(
    queue: &JobQueue,
    conflict_retry_limit: u32,
    id: JobId,
    task: Arc<dyn Task>,
    input: serde_json::Value,
) -> SchedulerResult<WorkerOutcome> {
    let mut attempt = 0u32;
    loop {
        let mut txn = queue.store().begin();
        queue.mark_processing(&mut txn, id)?;

        let mut ctx = TaskContext::new(input.clone());
        let result = task.execute(&mut ctx).await;
        if ctx.abort_requested() {
            // The dispatcher committed the claim separately, so the abort
            // cannot return the job to the pending sequence; record it.
            txn.abort();
            record_abort(queue, id).await?;
            return Ok(WorkerOutcome::Aborted);
        }

        match result {
            Ok(output) => queue.mark_completed(&mut txn, id, output)?,
            Err(err) => {
                warn!(job_id = %id, error = %err, "task failed");
                queue.mark_error(&mut txn, id, &err.to_string())?;
            }
        }

        match txn.commit().await {
            Ok(()) => {
                debug!(job_id = %id, "job finished");
                return Ok(WorkerOutcome::Finished);
            }
            Err(err) if err.is_conflict() && attempt < conflict_retry_limit => {
                attempt += 1;
                info!(job_id = %id, attempt, "commit conflict in worker; retrying");
                tokio::time::sleep(conflict_backoff(attempt)).await;
            }
            Err(err) if err.is_conflict() => {
                warn!(job_id = %id, "worker conflict retries exhausted");
                return Ok(WorkerOutcome::GaveUp);
            }
            Err(err) => return Err(err.into()),
        }
    }
}

async fn record_abort(queue: &JobQueue, id: JobId) -> SchedulerResult<()> {
    info!(job_id = %id, "task aborted the transaction; recording error");
    let mut txn = queue.store().begin();
    queue.mark_processing(&mut txn, id)?;
    queue.mark_error(&mut txn, id, "task aborted the transaction")?;
    txn.commit().await?;
    Ok(())
}
