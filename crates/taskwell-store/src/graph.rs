//! The committed object graph and its snapshot file format.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use taskwell_core::{JobId, JobRecord};

/// A committed object plus the version counter used for conflict detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

impl<T> Versioned<T> {
    pub fn new(value: T) -> Self {
        Self { version: 0, value }
    }
}

/// Everything reachable from the store root.
///
/// `pending` holds the FIFO sequence of queued job ids; a job id appears in
/// it iff its record's status is Queued. `active` and `settings` belong to
/// the service adaptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Graph {
    /// Bumped on every applied commit.
    pub revision: u64,
    pub jobs: HashMap<JobId, Versioned<JobRecord>>,
    pub pending: Versioned<VecDeque<JobId>>,
    pub active: Versioned<bool>,
    pub settings: Versioned<Option<serde_json::Value>>,
}

impl Default for Graph {
    fn default() -> Self {
        Self {
            revision: 0,
            jobs: HashMap::new(),
            pending: Versioned::new(VecDeque::new()),
            active: Versioned::new(false),
            settings: Versioned::new(None),
        }
    }
}

/// On-disk snapshot wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SnapshotFile {
    pub version: u32,
    pub graph: Graph,
}

impl SnapshotFile {
    pub const FORMAT_VERSION: u32 = 1;

    pub fn new(graph: Graph) -> Self {
        Self {
            version: Self::FORMAT_VERSION,
            graph,
        }
    }
}
