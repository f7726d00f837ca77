//! The task trait, execution context, and name-keyed registry.
//!
//! Tasks are the executable units a processor resolves by name. The registry
//! is populated at startup and read-only while processors run.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

/// Execution context handed to a task.
///
/// Carries the job's opaque input and the abort flag. A task that calls
/// [`TaskContext::abort_transaction`] dooms the transaction the processor is
/// running it under: any claim or status change made in that transaction is
/// discarded when the task returns.
#[derive(Debug)]
pub struct TaskContext {
    input: serde_json::Value,
    abort_requested: bool,
}

impl TaskContext {
    pub fn new(input: serde_json::Value) -> Self {
        Self {
            input,
            abort_requested: false,
        }
    }

    /// The job's input payload.
    pub fn input(&self) -> &serde_json::Value {
        &self.input
    }

    /// Doom the surrounding transaction. The processor aborts it after the
    /// task returns; the task's return value is discarded.
    pub fn abort_transaction(&mut self) {
        self.abort_requested = true;
    }

    pub fn abort_requested(&self) -> bool {
        self.abort_requested
    }
}

/// An executable unit bound in the registry under a name.
#[async_trait]
pub trait Task: Send + Sync {
    /// Run the task on the job's input. The returned value becomes the job's
    /// output; an error transitions the job to the Error status with the
    /// error's message as diagnostic output.
    async fn execute(&self, ctx: &mut TaskContext) -> Result<serde_json::Value>;
}

/// Name-keyed lookup of tasks.
///
/// Globally scoped per process in typical deployments; processors hold it
/// behind an `Arc` and only resolve.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<dyn Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a task under `name`.
    ///
    /// # Panics
    ///
    /// Panics if a task is already registered under this name.
    pub fn register(&mut self, name: impl Into<String>, task: Arc<dyn Task>) {
        let name = name.into();
        if self.tasks.contains_key(&name) {
            panic!("task already registered: {}", name);
        }
        self.tasks.insert(name, task);
    }

    /// Look up a task by name.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Task>> {
        self.tasks.get(name).cloned()
    }

    /// Check if a name is registered.
    pub fn has(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("registered", &self.tasks.keys().collect::<Vec<_>>())
            .finish()
    }
}
