//! Pool processor: one dispatcher, a bounded budget of concurrent workers.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use taskwell_core::{JobId, Task, TaskRegistry};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::SchedulerResult;
use crate::processor::{Processor, ProcessorOptions, StopSignal, conflict_backoff, owner_token};
use crate::queue::JobQueue;
use crate::worker::{self, WorkerOutcome};

/// A job claimed and resolved, ready to hand to a worker.
struct Claimed {
    id: JobId,
    task: Arc<dyn Task>,
    input: serde_json::Value,
}

/// Bounded worker pool, intended for I/O-bound jobs.
///
/// The dispatcher claims jobs in insertion order and commits each claim
/// before spawning the worker, so completions may land in any order. Workers
/// are fire-and-forget; the dispatcher only tracks the live count and drains
/// it after a stop.
pub struct MultiProcessor {
    queue: JobQueue,
    registry: Arc<TaskRegistry>,
    options: ProcessorOptions,
    owner: String,
    stop: StopSignal,
    live: Arc<AtomicUsize>,
    worker_done: Arc<Notify>,
    /// Ids whose tasks aborted their worker transaction this session.
    poisoned: Arc<Mutex<HashSet<JobId>>>,
}

impl MultiProcessor {
    pub fn new(queue: JobQueue, registry: Arc<TaskRegistry>, options: ProcessorOptions) -> Self {
        Self {
            queue,
            registry,
            options: options.normalized(),
            owner: owner_token("pool"),
            stop: StopSignal::new(),
            live: Arc::new(AtomicUsize::new(0)),
            worker_done: Arc::new(Notify::new()),
            poisoned: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Workers currently executing a job.
    pub fn live_workers(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn poisoned(&self) -> MutexGuard<'_, HashSet<JobId>> {
        self.poisoned
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim the next runnable job. Jobs with no registered task are
    /// errored out inside the claim transaction and skipped over.
    async fn claim_one(&self) -> SchedulerResult<Option<Claimed>> {
        let mut attempt = 0u32;
        loop {
            if self.stop.is_stopped() {
                return Ok(None);
            }
            let mut txn = self.queue.store().begin();
            let skip = self.poisoned().clone();
            let Some(id) = self.queue.claim_next(&mut txn, &self.owner, &skip)? else {
                return Ok(None);
            };
            let (task_name, input) = {
                let job = self.queue.get_in(&txn, id)?;
                (job.task_name.clone(), job.input.clone())
            };

            let task = self.registry.resolve(&task_name);
            if task.is_none() {
                warn!(job_id = %id, task = %task_name, "task not registered");
                self.queue.mark_processing(&mut txn, id)?;
                self.queue
                    .mark_error(&mut txn, id, &format!("task not registered: {task_name}"))?;
            }

            match txn.commit().await {
                Ok(()) => match task {
                    Some(task) => {
                        debug!(job_id = %id, task = %task_name, "claimed job");
                        return Ok(Some(Claimed { id, task, input }));
                    }
                    // Errored out in place; look for the next runnable job.
                    None => attempt = 0,
                },
                Err(err) if err.is_conflict() && attempt < self.options.conflict_retry_limit => {
                    attempt += 1;
                    info!(job_id = %id, attempt, "claim conflict; retrying");
                    tokio::time::sleep(conflict_backoff(attempt)).await;
                }
                Err(err) if err.is_conflict() => {
                    warn!(job_id = %id, "claim conflict retries exhausted");
                    return Ok(None);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn spawn_worker(&self, claimed: Claimed) {
        // Counted before the spawn so the budget check never lags.
        self.live.fetch_add(1, Ordering::SeqCst);

        let queue = self.queue.clone();
        let live = self.live.clone();
        let done = self.worker_done.clone();
        let poisoned = self.poisoned.clone();
        let retry_limit = self.options.conflict_retry_limit;

        tokio::spawn(async move {
            let Claimed { id, task, input } = claimed;
            match worker::execute_claimed(&queue, retry_limit, id, task, input).await {
                Ok(WorkerOutcome::Finished) => {}
                Ok(WorkerOutcome::Aborted) => {
                    poisoned
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .insert(id);
                }
                Ok(WorkerOutcome::GaveUp) => {}
                Err(err) => error!(job_id = %id, error = %err, "worker failed"),
            }
            live.fetch_sub(1, Ordering::SeqCst);
            done.notify_waiters();
        });
    }

    /// Wait for the live-worker count to drain after a stop.
    async fn drain_workers(&self) {
        while self.live.load(Ordering::SeqCst) > 0 {
            tokio::select! {
                _ = self.worker_done.notified() => {}
                _ = tokio::time::sleep(self.options.wait_time) => {}
            }
        }
    }
}

#[async_trait]
impl Processor for MultiProcessor {
    fn owner(&self) -> &str {
        &self.owner
    }

    async fn run(&self) {
        info!(
            owner = %self.owner,
            max_threads = self.options.max_threads,
            "starting pool processor"
        );
        loop {
            if self.stop.is_stopped() {
                break;
            }
            if self.live.load(Ordering::SeqCst) >= self.options.max_threads {
                self.stop.sleep(self.options.wait_time).await;
                continue;
            }
            if !self.queue.has_pending().await {
                self.stop.sleep(self.options.wait_time).await;
                continue;
            }
            match self.claim_one().await {
                Ok(Some(claimed)) => {
                    self.spawn_worker(claimed);
                    // Let the worker reach its own transaction before the
                    // next claim; claiming straight through piles up
                    // conflict errors.
                    self.stop.sleep(self.options.thread_startup_wait).await;
                }
                Ok(None) => self.stop.sleep(self.options.wait_time).await,
                Err(err) => {
                    error!(owner = %self.owner, error = %err, "dispatch iteration failed");
                    self.stop.sleep(self.options.wait_time).await;
                }
            }
        }
        self.drain_workers().await;
        info!(owner = %self.owner, "pool processor stopped");
    }

    fn stop(&self) {
        self.stop.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use taskwell_core::JobStatus;
    use taskwell_store::Store;

    fn test_options(max_threads: usize) -> ProcessorOptions {
        ProcessorOptions {
            wait_time: Duration::from_millis(5),
            thread_startup_wait: Duration::from_millis(5),
            max_threads,
            ..Default::default()
        }
    }

    fn fixture(
        registry: Arc<taskwell_core::TaskRegistry>,
        max_threads: usize,
    ) -> (JobQueue, Arc<MultiProcessor>) {
        let queue = JobQueue::new(Store::in_memory());
        let processor = Arc::new(MultiProcessor::new(
            queue.clone(),
            registry,
            test_options(max_threads),
        ));
        (queue, processor)
    }

    async fn run_until_drained(
        queue: &JobQueue,
        processor: &Arc<MultiProcessor>,
        virtual_millis: u64,
    ) {
        let runner = processor.clone();
        let handle = tokio::spawn(async move { runner.run().await });
        tokio::time::sleep(Duration::from_millis(virtual_millis)).await;
        processor.stop();
        handle.await.unwrap();
        assert_eq!(processor.live_workers(), 0);
        assert!(!queue.has_pending().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completions_land_out_of_claim_order() {
        init_tracing();
        let log = shared_log();
        let registry = registry_of(vec![("sleep", Arc::new(SleepTask { log: log.clone() }) as _)]);
        let (queue, processor) = fixture(registry, 5);

        for (millis, label) in [(40, 1), (180, 2), (0, 3), (20, 4)] {
            queue
                .add("sleep", serde_json::json!([millis, label]))
                .await
                .unwrap();
        }
        run_until_drained(&queue, &processor, 400).await;

        assert_eq!(log_lines(&log), vec!["Job: 3", "Job: 4", "Job: 1", "Job: 2"]);
        let txn = queue.store().begin();
        assert!(txn.jobs().all(|job| job.status == JobStatus::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_thread_budget_delays_short_job() {
        let log = shared_log();
        let registry = registry_of(vec![("sleep", Arc::new(SleepTask { log: log.clone() }) as _)]);
        let (queue, processor) = fixture(registry, 2);

        // Job 3 is short but cannot start until a slot frees, so it still
        // finishes third.
        for (millis, label) in [(30, 1), (50, 2), (30, 3), (80, 4)] {
            queue
                .add("sleep", serde_json::json!([millis, label]))
                .await
                .unwrap();
        }
        run_until_drained(&queue, &processor, 400).await;

        assert_eq!(log_lines(&log), vec!["Job: 1", "Job: 2", "Job: 3", "Job: 4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_workers_never_exceed_budget() {
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let registry = registry_of(vec![(
            "gauge",
            Arc::new(GaugeTask {
                live: live.clone(),
                peak: peak.clone(),
            }) as _,
        )]);
        let (queue, processor) = fixture(registry, 3);

        for _ in 0..8 {
            queue.add("gauge", serde_json::json!([20])).await.unwrap();
        }
        run_until_drained(&queue, &processor, 400).await;

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 2);
        let txn = queue.store().begin();
        assert_eq!(
            txn.jobs()
                .filter(|job| job.status == JobStatus::Completed)
                .count(),
            8
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_task_errors_and_pool_drains_rest() {
        let log = shared_log();
        let registry = registry_of(vec![("sleep", Arc::new(SleepTask { log: log.clone() }) as _)]);
        let (queue, processor) = fixture(registry, 5);

        let bad = queue.add("unknown", serde_json::Value::Null).await.unwrap();
        let good = queue.add("sleep", serde_json::json!([0, 1])).await.unwrap();
        run_until_drained(&queue, &processor, 200).await;

        let job = queue.get(bad).await.unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(
            job.output,
            Some(serde_json::json!("task not registered: unknown"))
        );
        assert_eq!(queue.get(good).await.unwrap().status, JobStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_in_worker_records_error_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let registry = registry_of(vec![(
            "count",
            Arc::new(AbortTask {
                counter: counter.clone(),
            }) as _,
        )]);
        let (queue, processor) = fixture(registry, 5);

        let id = queue.add("count", serde_json::Value::Null).await.unwrap();
        run_until_drained(&queue, &processor, 200).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        let job = queue.get(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(
            job.output,
            Some(serde_json::json!("task aborted the transaction"))
        );
    }
}
