//! Shared task implementations for scheduler tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use taskwell_core::{Error, Result, Task, TaskContext, TaskRegistry};

pub(crate) type SharedLog = Arc<Mutex<Vec<String>>>;

pub(crate) fn shared_log() -> SharedLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub(crate) fn log_lines(log: &SharedLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

pub(crate) fn registry_of(entries: Vec<(&str, Arc<dyn Task>)>) -> Arc<TaskRegistry> {
    let mut registry = TaskRegistry::new();
    for (name, task) in entries {
        registry.register(name, task);
    }
    Arc::new(registry)
}

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Sleeps for `input[0]` milliseconds, then logs `Job: {input[1]}`.
pub(crate) struct SleepTask {
    pub log: SharedLog,
}

#[async_trait]
impl Task for SleepTask {
    async fn execute(&self, ctx: &mut TaskContext) -> Result<serde_json::Value> {
        let millis = ctx.input()[0].as_u64().unwrap();
        let label = ctx.input()[1].clone();
        tokio::time::sleep(Duration::from_millis(millis)).await;
        self.log.lock().unwrap().push(format!("Job: {label}"));
        Ok(ctx.input().clone())
    }
}

/// Counts an execution, then dooms the surrounding transaction.
pub(crate) struct AbortTask {
    pub counter: Arc<AtomicUsize>,
}

#[async_trait]
impl Task for AbortTask {
    async fn execute(&self, ctx: &mut TaskContext) -> Result<serde_json::Value> {
        self.counter.fetch_add(1, Ordering::SeqCst);
        ctx.abort_transaction();
        Ok(serde_json::Value::Null)
    }
}

/// Always fails.
pub(crate) struct FailTask;

#[async_trait]
impl Task for FailTask {
    async fn execute(&self, _ctx: &mut TaskContext) -> Result<serde_json::Value> {
        Err(Error::TaskFailed("boom".into()))
    }
}

/// Tracks how many instances run concurrently; sleeps `input[0]` millis.
pub(crate) struct GaugeTask {
    pub live: Arc<AtomicUsize>,
    pub peak: Arc<AtomicUsize>,
}

#[async_trait]
impl Task for GaugeTask {
    async fn execute(&self, ctx: &mut TaskContext) -> Result<serde_json::Value> {
        let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let millis = ctx.input()[0].as_u64().unwrap();
        tokio::time::sleep(Duration::from_millis(millis)).await;
        self.live.fetch_sub(1, Ordering::SeqCst);
        Ok(serde_json::Value::Null)
    }
}

/// Completes immediately after a 1 ms pause, forcing an await point so
/// concurrent processors interleave.
pub(crate) struct TickTask;

#[async_trait]
impl Task for TickTask {
    async fn execute(&self, _ctx: &mut TaskContext) -> Result<serde_json::Value> {
        tokio::time::sleep(Duration::from_millis(1)).await;
        Ok(serde_json::json!("ok"))
    }
}
