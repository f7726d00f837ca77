//! Job queue, processors, and service adaptor for Taskwell.
//!
//! The queue persists job records in the transactional store; processors
//! poll it, claim pending work, and execute registered tasks:
//! - [`SimpleProcessor`] runs one job per iteration, claim and execution
//!   under a single transaction. Intended for CPU-heavy jobs.
//! - [`MultiProcessor`] dispatches claims to a bounded pool of worker
//!   tasks. Intended for I/O-bound jobs.
//!
//! [`TaskService`] binds a processor factory and its arguments to a live
//! store and drives the start/stop lifecycle.

pub mod error;
pub mod pool;
pub mod processor;
pub mod queue;
pub mod service;
pub mod simple;
mod worker;

#[cfg(test)]
mod testutil;

pub use error::{SchedulerError, SchedulerResult};
pub use pool::MultiProcessor;
pub use processor::{Processor, ProcessorKind, ProcessorOptions, ProcessorSettings};
pub use queue::JobQueue;
pub use service::TaskService;
pub use simple::SimpleProcessor;
