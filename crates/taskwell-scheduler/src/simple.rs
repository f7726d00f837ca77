//! Sequential processor: one claim-execute-commit cycle per iteration.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use taskwell_core::{JobId, TaskContext, TaskRegistry};
use tracing::{debug, error, info, warn};

use crate::error::SchedulerResult;
use crate::processor::{Processor, ProcessorOptions, StopSignal, conflict_backoff, owner_token};
use crate::queue::JobQueue;

/// Single-threaded sequential executor, intended for CPU-heavy jobs.
///
/// The claim and the task execution share one transaction: when a task dooms
/// it, the claim is undone and the job returns to the pending sequence. The
/// processor then refuses to re-claim that id for the rest of its session,
/// so an aborting task runs exactly once per enqueue.
pub struct SimpleProcessor {
    queue: JobQueue,
    registry: Arc<TaskRegistry>,
    options: ProcessorOptions,
    owner: String,
    stop: StopSignal,
    /// Ids whose tasks aborted the transaction this session.
    poisoned: Mutex<HashSet<JobId>>,
}

impl SimpleProcessor {
    pub fn new(queue: JobQueue, registry: Arc<TaskRegistry>, options: ProcessorOptions) -> Self {
        Self {
            queue,
            registry,
            options: options.normalized(),
            owner: owner_token("simple"),
            stop: StopSignal::new(),
            poisoned: Mutex::new(HashSet::new()),
        }
    }

    fn poisoned(&self) -> MutexGuard<'_, HashSet<JobId>> {
        self.poisoned
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Perform one claim-execute-commit cycle.
    ///
    /// Returns true if a job made progress (ran, errored, or aborted), false
    /// if the queue was empty or the commit retries were exhausted.
    pub async fn process_next(&self) -> SchedulerResult<bool> {
        let mut attempt = 0u32;
        loop {
            let mut txn = self.queue.store().begin();
            let skip = self.poisoned().clone();
            let Some(id) = self.queue.claim_next(&mut txn, &self.owner, &skip)? else {
                txn.commit().await?;
                return Ok(false);
            };

            let (task_name, input) = {
                let job = self.queue.get_in(&txn, id)?;
                (job.task_name.clone(), job.input.clone())
            };
            self.queue.mark_processing(&mut txn, id)?;

            match self.registry.resolve(&task_name) {
                None => {
                    warn!(job_id = %id, task = %task_name, "task not registered");
                    self.queue
                        .mark_error(&mut txn, id, &format!("task not registered: {task_name}"))?;
                }
                Some(task) => {
                    let mut ctx = TaskContext::new(input);
                    let result = task.execute(&mut ctx).await;
                    if ctx.abort_requested() {
                        // The claim lives in this transaction, so aborting
                        // returns the job to the queue; poison the id or the
                        // next iteration would claim it again, forever.
                        txn.abort();
                        self.poisoned().insert(id);
                        info!(job_id = %id, "task aborted the transaction; id poisoned for this session");
                        return Ok(true);
                    }
                    match result {
                        Ok(output) => self.queue.mark_completed(&mut txn, id, output)?,
                        Err(err) => {
                            warn!(job_id = %id, error = %err, "task failed");
                            self.queue.mark_error(&mut txn, id, &err.to_string())?;
                        }
                    }
                }
            }

            match txn.commit().await {
                Ok(()) => {
                    debug!(job_id = %id, "job finished");
                    return Ok(true);
                }
                Err(err) if err.is_conflict() && attempt < self.options.conflict_retry_limit => {
                    attempt += 1;
                    info!(job_id = %id, attempt, "commit conflict; retrying iteration");
                    tokio::time::sleep(conflict_backoff(attempt)).await;
                }
                Err(err) if err.is_conflict() => {
                    warn!(job_id = %id, "conflict retries exhausted; no progress made");
                    return Ok(false);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

#[async_trait]
impl Processor for SimpleProcessor {
    fn owner(&self) -> &str {
        &self.owner
    }

    async fn run(&self) {
        info!(owner = %self.owner, "starting sequential processor");
        loop {
            if self.stop.is_stopped() {
                break;
            }
            match self.process_next().await {
                Ok(true) => {}
                Ok(false) => self.stop.sleep(self.options.wait_time).await,
                Err(err) => {
                    error!(owner = %self.owner, error = %err, "processor iteration failed");
                    self.stop.sleep(self.options.wait_time).await;
                }
            }
        }
        info!(owner = %self.owner, "sequential processor stopped");
    }

    fn stop(&self) {
        self.stop.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use taskwell_core::JobStatus;
    use taskwell_store::Store;

    fn test_options() -> ProcessorOptions {
        ProcessorOptions {
            wait_time: Duration::from_millis(5),
            thread_startup_wait: Duration::from_millis(5),
            ..Default::default()
        }
    }

    fn fixture(registry: Arc<taskwell_core::TaskRegistry>) -> (JobQueue, Arc<SimpleProcessor>) {
        let queue = JobQueue::new(Store::in_memory());
        let processor = Arc::new(SimpleProcessor::new(
            queue.clone(),
            registry,
            test_options(),
        ));
        (queue, processor)
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_order_matches_insertion_order() {
        init_tracing();
        let log = shared_log();
        let registry = registry_of(vec![("sleep", Arc::new(SleepTask { log: log.clone() }) as _)]);
        let (queue, processor) = fixture(registry);

        for (millis, label) in [(40, 1), (100, 2), (0, 3), (80, 4)] {
            queue
                .add("sleep", serde_json::json!([millis, label]))
                .await
                .unwrap();
        }

        let runner = processor.clone();
        let handle = tokio::spawn(async move { runner.run().await });
        tokio::time::sleep(Duration::from_millis(500)).await;
        processor.stop();
        handle.await.unwrap();

        assert_eq!(log_lines(&log), vec!["Job: 1", "Job: 2", "Job: 3", "Job: 4"]);
        let txn = queue.store().begin();
        assert!(txn.jobs().all(|job| job.status == JobStatus::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborting_task_runs_exactly_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let registry = registry_of(vec![(
            "count",
            Arc::new(AbortTask {
                counter: counter.clone(),
            }) as _,
        )]);
        let (queue, processor) = fixture(registry);
        let id = queue.add("count", serde_json::Value::Null).await.unwrap();

        // First cycle runs the task once; the abort undoes the claim.
        assert!(processor.process_next().await.unwrap());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        let job = queue.get(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(queue.has_pending().await);

        // The poisoned id is never re-claimed.
        assert!(!processor.process_next().await.unwrap());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_task_errors_and_drains_rest() {
        let log = shared_log();
        let registry = registry_of(vec![("sleep", Arc::new(SleepTask { log: log.clone() }) as _)]);
        let (queue, processor) = fixture(registry);

        let bad = queue.add("unknown", serde_json::Value::Null).await.unwrap();
        let good = queue.add("sleep", serde_json::json!([0, 1])).await.unwrap();

        assert!(processor.process_next().await.unwrap());
        let job = queue.get(bad).await.unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(
            job.output,
            Some(serde_json::json!("task not registered: unknown"))
        );

        assert!(processor.process_next().await.unwrap());
        assert_eq!(queue.get(good).await.unwrap().status, JobStatus::Completed);
        assert_eq!(log_lines(&log), vec!["Job: 1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_task_records_diagnostic() {
        let registry = registry_of(vec![("fail", Arc::new(FailTask) as _)]);
        let (queue, processor) = fixture(registry);
        let id = queue.add("fail", serde_json::Value::Null).await.unwrap();

        assert!(processor.process_next().await.unwrap());
        let job = queue.get(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.output, Some(serde_json::json!("task failed: boom")));
        assert_eq!(job.owner.as_deref(), Some(processor.owner()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_queue_reports_no_progress() {
        let registry = registry_of(vec![]);
        let (_queue, processor) = fixture(registry);
        assert!(!processor.process_next().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_processors_claim_each_job_once() {
        init_tracing();
        let registry = registry_of(vec![("tick", Arc::new(TickTask) as _)]);
        let queue = JobQueue::new(Store::in_memory());
        for n in 0..100 {
            queue.add("tick", serde_json::json!(n)).await.unwrap();
        }

        let first = Arc::new(SimpleProcessor::new(
            queue.clone(),
            registry.clone(),
            test_options(),
        ));
        let second = Arc::new(SimpleProcessor::new(
            queue.clone(),
            registry.clone(),
            test_options(),
        ));
        let handles = [first.clone(), second.clone()].map(|processor| {
            tokio::spawn(async move { processor.run().await })
        });

        let mut polls = 0;
        loop {
            let completed = {
                let txn = queue.store().begin();
                txn.jobs()
                    .filter(|job| job.status == JobStatus::Completed)
                    .count()
            };
            if completed == 100 {
                break;
            }
            polls += 1;
            assert!(polls < 5_000, "queue did not drain: {completed}/100");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        first.stop();
        second.stop();
        for handle in handles {
            handle.await.unwrap();
        }

        // Every job completed exactly once, owned by one of the two
        // processors, and nothing is left pending.
        let txn = queue.store().begin();
        assert_eq!(txn.jobs().count(), 100);
        let owners = [first.owner(), second.owner()];
        for job in txn.jobs() {
            assert_eq!(job.status, JobStatus::Completed);
            assert_eq!(job.output, Some(serde_json::json!("ok")));
            assert!(owners.contains(&job.owner.as_deref().unwrap()));
        }
        assert!(txn.pending().is_empty());
    }
}
