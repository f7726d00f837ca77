//! The durable job queue.
//!
//! Committed conveniences (`add`, `get`, `cancel`, `clean`) run their own
//! transaction. The claim and status-transition operations take a
//! [`Transaction`] so processors can compose them under one transactional
//! boundary: the simple processor claims and executes inside a single
//! transaction, the pool dispatcher commits the claim before handing the
//! job to a worker.

use std::collections::HashSet;

use chrono::Utc;
use taskwell_core::{Error, JobId, JobRecord, JobStatus};
use taskwell_store::{Store, Transaction};
use tracing::debug;

use crate::error::SchedulerResult;

/// Retry bound for the committed conveniences that can race a processor.
const QUEUE_CONFLICT_RETRIES: u32 = 3;

/// Job queue backed by the transactional store.
#[derive(Clone)]
pub struct JobQueue {
    store: Store,
}

impl JobQueue {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Append a new queued job and return its id.
    pub async fn add(&self, task_name: &str, input: serde_json::Value) -> SchedulerResult<JobId> {
        let record = JobRecord::new(task_name, input);
        let id = record.id;
        let mut attempt = 0u32;
        loop {
            let mut txn = self.store.begin();
            txn.insert_job(record.clone());
            txn.pending_mut().push_back(id);
            match txn.commit().await {
                Ok(()) => {
                    debug!(job_id = %id, task = task_name, "enqueued job");
                    return Ok(id);
                }
                // Enqueues race the processors over the pending sequence.
                Err(err) if err.is_conflict() && attempt < QUEUE_CONFLICT_RETRIES => attempt += 1,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// True iff any job is waiting in the pending sequence.
    pub async fn has_pending(&self) -> bool {
        !self.store.begin().pending().is_empty()
    }

    pub async fn get(&self, id: JobId) -> SchedulerResult<JobRecord> {
        self.store
            .begin()
            .job(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id).into())
    }

    /// Read a record inside an open transaction.
    pub fn get_in<'a>(&self, txn: &'a Transaction, id: JobId) -> SchedulerResult<&'a JobRecord> {
        txn.job(id).ok_or_else(|| Error::NotFound(id).into())
    }

    /// Withdraw a queued job. Returns false once a processor holds it.
    pub async fn cancel(&self, id: JobId) -> SchedulerResult<bool> {
        for _ in 0..=QUEUE_CONFLICT_RETRIES {
            let mut txn = self.store.begin();
            let Some(job) = txn.job(id) else {
                return Err(Error::NotFound(id).into());
            };
            if job.status != JobStatus::Queued {
                return Ok(false);
            }
            txn.pending_mut().retain(|queued| *queued != id);
            self.transition(&mut txn, id, JobStatus::Cancelled, None)?;
            match txn.commit().await {
                Ok(()) => {
                    debug!(job_id = %id, "cancelled job");
                    return Ok(true);
                }
                // A processor is racing us for this job; look again.
                Err(err) if err.is_conflict() => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(false)
    }

    /// Purge terminal records. Returns the number removed.
    pub async fn clean(&self) -> SchedulerResult<usize> {
        let mut last_conflict = None;
        for _ in 0..=QUEUE_CONFLICT_RETRIES {
            let mut txn = self.store.begin();
            let terminal: Vec<JobId> = txn
                .jobs()
                .filter(|job| job.status.is_terminal())
                .map(|job| job.id)
                .collect();
            for id in &terminal {
                txn.remove_job(*id);
            }
            match txn.commit().await {
                Ok(()) => {
                    debug!(removed = terminal.len(), "purged terminal jobs");
                    return Ok(terminal.len());
                }
                Err(err) if err.is_conflict() => last_conflict = Some(err),
                Err(err) => return Err(err.into()),
            }
        }
        Err(last_conflict
            .map(Into::into)
            .unwrap_or_else(|| Error::Internal("clean retries exhausted".into()).into()))
    }

    /// Atomically select the oldest queued job not in `skip`, mark it
    /// claimed for `owner`, and remove it from the pending sequence.
    ///
    /// Within one processor, ids come back in strict insertion order. The
    /// claim only holds once the transaction commits; a conflict there means
    /// another processor won this id and the caller retries.
    pub fn claim_next(
        &self,
        txn: &mut Transaction,
        owner: &str,
        skip: &HashSet<JobId>,
    ) -> SchedulerResult<Option<JobId>> {
        let Some(id) = txn.pending().iter().copied().find(|id| !skip.contains(id)) else {
            return Ok(None);
        };
        txn.pending_mut().retain(|queued| *queued != id);

        let job = txn.job_mut(id).ok_or(Error::NotFound(id))?;
        if !job.status.can_transition(JobStatus::Claimed) {
            return Err(Error::InvalidTransition {
                from: job.status,
                to: JobStatus::Claimed,
            }
            .into());
        }
        job.status = JobStatus::Claimed;
        job.owner = Some(owner.to_string());
        job.claimed_at = Some(Utc::now());
        Ok(Some(id))
    }

    pub fn mark_processing(&self, txn: &mut Transaction, id: JobId) -> SchedulerResult<()> {
        self.transition(txn, id, JobStatus::Processing, None)
    }

    pub fn mark_completed(
        &self,
        txn: &mut Transaction,
        id: JobId,
        output: serde_json::Value,
    ) -> SchedulerResult<()> {
        self.transition(txn, id, JobStatus::Completed, Some(output))
    }

    pub fn mark_error(
        &self,
        txn: &mut Transaction,
        id: JobId,
        diagnostic: &str,
    ) -> SchedulerResult<()> {
        self.transition(
            txn,
            id,
            JobStatus::Error,
            Some(serde_json::Value::String(diagnostic.to_string())),
        )
    }

    fn transition(
        &self,
        txn: &mut Transaction,
        id: JobId,
        next: JobStatus,
        output: Option<serde_json::Value>,
    ) -> SchedulerResult<()> {
        let job = txn.job_mut(id).ok_or(Error::NotFound(id))?;
        if !job.status.can_transition(next) {
            return Err(Error::InvalidTransition {
                from: job.status,
                to: next,
            }
            .into());
        }
        job.status = next;
        if next.is_terminal() {
            job.completed_at = Some(Utc::now());
        }
        if let Some(output) = output {
            job.output = Some(output);
        }
        Ok(())
    }
}
