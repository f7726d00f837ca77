//! Service adaptor: binds a processor factory and its arguments to a store.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use taskwell_core::{JobId, JobRecord, TaskRegistry};
use taskwell_store::Store;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::processor::{Processor, ProcessorKind, ProcessorOptions, ProcessorSettings};
use crate::queue::JobQueue;

struct Running {
    processor: Arc<dyn Processor>,
    handle: JoinHandle<()>,
}

/// A task-queue service instance.
///
/// Clients enqueue jobs through [`TaskService::add`]; `start_processing`
/// instantiates a processor from the current factory and arguments, launches
/// its main loop in the background, and commits the `active` flag so the
/// state survives restarts. The thread lifecycle itself is process-local.
pub struct TaskService {
    queue: JobQueue,
    registry: Arc<TaskRegistry>,
    factory: RwLock<ProcessorKind>,
    options: RwLock<ProcessorOptions>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl TaskService {
    pub fn new(store: Store, registry: Arc<TaskRegistry>) -> Self {
        Self {
            queue: JobQueue::new(store),
            registry,
            factory: RwLock::new(ProcessorKind::Simple),
            options: RwLock::new(ProcessorOptions::default()),
            running: tokio::sync::Mutex::new(None),
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn processor_factory(&self) -> ProcessorKind {
        *read_guard(&self.factory)
    }

    /// Swap the processor strategy. Takes effect at the next start.
    pub fn set_processor_factory(&self, kind: ProcessorKind) {
        *write_guard(&self.factory) = kind;
    }

    pub fn processor_options(&self) -> ProcessorOptions {
        read_guard(&self.options).clone()
    }

    pub fn set_processor_options(&self, options: ProcessorOptions) {
        *write_guard(&self.options) = options;
    }

    /// Restore the factory and arguments persisted under the service root,
    /// if any. Returns true when settings were found.
    pub async fn restore_settings(&self) -> SchedulerResult<bool> {
        let persisted = {
            let txn = self.queue.store().begin();
            txn.settings().cloned()
        };
        let Some(value) = persisted else {
            return Ok(false);
        };
        let settings: ProcessorSettings = serde_json::from_value(value)?;
        self.set_processor_factory(settings.kind);
        self.set_processor_options(settings.options);
        Ok(true)
    }

    /// Enqueue a job for `task_name`.
    pub async fn add(&self, task_name: &str, input: serde_json::Value) -> SchedulerResult<JobId> {
        self.queue.add(task_name, input).await
    }

    pub async fn get(&self, id: JobId) -> SchedulerResult<JobRecord> {
        self.queue.get(id).await
    }

    /// Withdraw a queued job. Returns false once a processor holds it.
    pub async fn cancel(&self, id: JobId) -> SchedulerResult<bool> {
        self.queue.cancel(id).await
    }

    /// Purge terminal records.
    pub async fn clean(&self) -> SchedulerResult<usize> {
        self.queue.clean().await
    }

    /// The committed `active` flag.
    pub async fn is_processing(&self) -> bool {
        self.queue.store().begin().active()
    }

    /// Instantiate a processor from the current factory and arguments and
    /// launch its main loop. Commits `active = true` and the settings first,
    /// so both survive a restart.
    pub async fn start_processing(&self) -> SchedulerResult<()> {
        let mut slot = self.running.lock().await;
        if slot.is_some() {
            return Err(SchedulerError::AlreadyProcessing);
        }

        let kind = self.processor_factory();
        let options = self.processor_options().normalized();
        let settings = ProcessorSettings {
            kind,
            options: options.clone(),
        };
        let mut txn = self.queue.store().begin();
        txn.set_active(true);
        txn.set_settings(serde_json::to_value(&settings)?);
        txn.commit().await?;

        info!("starting service tasks");
        let processor = kind.build(self.queue.clone(), self.registry.clone(), options);
        let runner = processor.clone();
        let handle = tokio::spawn(async move { runner.run().await });
        *slot = Some(Running { processor, handle });
        Ok(())
    }

    /// Signal the processor to stop and wait for its loop and workers to
    /// exit, bounded by `shutdown_grace`. On timeout the in-flight jobs are
    /// abandoned and stay claimed pending recovery.
    pub async fn stop_processing(&self) -> SchedulerResult<()> {
        let mut slot = self.running.lock().await;
        let Some(running) = slot.take() else {
            debug!("stop requested while idle");
            return Ok(());
        };

        info!("stopping service tasks");
        running.processor.stop();
        let grace = self.processor_options().shutdown_grace;
        match tokio::time::timeout(grace, running.handle).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(error = %err, "processor task failed"),
            Err(_) => warn!(
                grace_secs = grace.as_secs_f64(),
                "shutdown grace exceeded; abandoning in-flight jobs"
            ),
        }

        let mut txn = self.queue.store().begin();
        txn.set_active(false);
        txn.commit().await?;
        Ok(())
    }
}

fn read_guard<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_guard<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
