//! Processor trait, factory, and recognized options.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use taskwell_core::TaskRegistry;
use tokio::sync::Notify;

use crate::pool::MultiProcessor;
use crate::queue::JobQueue;
use crate::simple::SimpleProcessor;

/// The claim/execute loop driving a queue.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Identifier recorded as the claim owner.
    fn owner(&self) -> &str;

    /// Main loop. Returns after [`Processor::stop`] once in-flight work has
    /// drained.
    async fn run(&self);

    /// Cooperative stop, observed at loop boundaries. Running tasks are not
    /// interrupted.
    fn stop(&self);
}

/// Options recognized by the processor factories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorOptions {
    /// Idle poll interval.
    pub wait_time: Duration,
    /// Worker budget for the pool processor.
    pub max_threads: usize,
    /// Dispatcher pause after spawning a worker, serializing the
    /// claim-and-start handoff.
    pub thread_startup_wait: Duration,
    /// Bounded retries on store conflicts at transaction boundaries.
    pub conflict_retry_limit: u32,
    /// How long `stop_processing` waits before abandoning in-flight work.
    pub shutdown_grace: Duration,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            wait_time: Duration::from_secs(1),
            max_threads: 5,
            thread_startup_wait: Duration::from_millis(50),
            conflict_retry_limit: 3,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl ProcessorOptions {
    /// Clamp out-of-range values instead of failing.
    pub fn normalized(mut self) -> Self {
        if self.max_threads == 0 {
            self.max_threads = 1;
        }
        self
    }
}

/// Which processor strategy the service instantiates. Swappable at runtime;
/// takes effect at the next `start_processing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorKind {
    /// Sequential, one job per iteration.
    Simple,
    /// Bounded worker pool.
    Pool,
}

impl ProcessorKind {
    pub fn build(
        &self,
        queue: JobQueue,
        registry: Arc<TaskRegistry>,
        options: ProcessorOptions,
    ) -> Arc<dyn Processor> {
        match self {
            ProcessorKind::Simple => Arc::new(SimpleProcessor::new(queue, registry, options)),
            ProcessorKind::Pool => Arc::new(MultiProcessor::new(queue, registry, options)),
        }
    }
}

/// Factory reference plus arguments, persisted under the service root so the
/// configuration survives restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorSettings {
    pub kind: ProcessorKind,
    pub options: ProcessorOptions,
}

/// Stop flag plus wakeup for the sleep-and-check loops.
pub(crate) struct StopSignal {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn new() -> Self {
        Self {
            stopped: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking early when stop is signalled.
    pub async fn sleep(&self, duration: Duration) {
        if self.is_stopped() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.notify.notified() => {}
        }
    }
}

/// Backoff before re-running a conflicted transaction.
pub(crate) fn conflict_backoff(attempt: u32) -> Duration {
    Duration::from_millis((2u64 << attempt.min(6)).min(200))
}

/// Short unique owner token, e.g. `simple-1f3a9c2b`.
pub(crate) fn owner_token(prefix: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &id[..8])
}
