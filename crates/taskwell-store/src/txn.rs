//! Snapshot transactions with first-committer-wins conflict detection.

use std::collections::{HashMap, HashSet, VecDeque};

use taskwell_core::{JobId, JobRecord};

use crate::error::{StoreError, StoreResult};
use crate::graph::{Graph, Versioned};
use crate::store::Store;

/// A transaction over a begin-time snapshot of the object graph.
///
/// Reads are served from the snapshot; writes stay local until
/// [`Transaction::commit`]. Commit validates every written object against
/// the committed graph and applies all writes atomically, or applies nothing
/// and raises [`StoreError::Conflict`]. Dropping (or calling
/// [`Transaction::abort`]) discards the transaction.
pub struct Transaction {
    store: Store,
    graph: Graph,
    touched: Touched,
}

#[derive(Default)]
struct Touched {
    /// Written or inserted job ids still present in the local graph.
    jobs: HashSet<JobId>,
    /// Subset of `jobs` created by this transaction.
    inserted: HashSet<JobId>,
    /// Removed job ids with their begin-time versions.
    removed: HashMap<JobId, u64>,
    pending: bool,
    active: bool,
    settings: bool,
}

impl Touched {
    fn is_empty(&self) -> bool {
        self.jobs.is_empty()
            && self.removed.is_empty()
            && !self.pending
            && !self.active
            && !self.settings
    }
}

impl Transaction {
    pub(crate) fn new(store: Store, graph: Graph) -> Self {
        Self {
            store,
            graph,
            touched: Touched::default(),
        }
    }

    pub fn job(&self, id: JobId) -> Option<&JobRecord> {
        self.graph.jobs.get(&id).map(|v| &v.value)
    }

    pub fn job_mut(&mut self, id: JobId) -> Option<&mut JobRecord> {
        let versioned = self.graph.jobs.get_mut(&id)?;
        self.touched.jobs.insert(id);
        Some(&mut versioned.value)
    }

    pub fn insert_job(&mut self, record: JobRecord) {
        let id = record.id;
        self.touched.jobs.insert(id);
        self.touched.inserted.insert(id);
        self.graph.jobs.insert(id, Versioned::new(record));
    }

    /// Remove a job record from the graph. Returns false if absent.
    pub fn remove_job(&mut self, id: JobId) -> bool {
        let Some(versioned) = self.graph.jobs.remove(&id) else {
            return false;
        };
        self.touched.jobs.remove(&id);
        if !self.touched.inserted.remove(&id) {
            self.touched.removed.insert(id, versioned.version);
        }
        true
    }

    pub fn jobs(&self) -> impl Iterator<Item = &JobRecord> {
        self.graph.jobs.values().map(|v| &v.value)
    }

    /// The FIFO sequence of queued job ids.
    pub fn pending(&self) -> &VecDeque<JobId> {
        &self.graph.pending.value
    }

    pub fn pending_mut(&mut self) -> &mut VecDeque<JobId> {
        self.touched.pending = true;
        &mut self.graph.pending.value
    }

    /// The service's "processing is active" flag.
    pub fn active(&self) -> bool {
        self.graph.active.value
    }

    pub fn set_active(&mut self, active: bool) {
        self.touched.active = true;
        self.graph.active.value = active;
    }

    /// The service's persisted processor settings.
    pub fn settings(&self) -> Option<&serde_json::Value> {
        self.graph.settings.value.as_ref()
    }

    pub fn set_settings(&mut self, settings: serde_json::Value) {
        self.touched.settings = true;
        self.graph.settings.value = Some(settings);
    }

    /// Discard the transaction.
    pub fn abort(self) {}

    /// Validate and apply the transaction's writes.
    pub async fn commit(self) -> StoreResult<()> {
        let Transaction {
            store,
            mut graph,
            touched,
        } = self;

        store.check_open()?;
        if touched.is_empty() {
            return Ok(());
        }

        {
            let mut state = store.state();

            // First-committer-wins: every written object must still be at
            // the version this transaction read.
            for id in &touched.jobs {
                let committed = state.jobs.get(id);
                if touched.inserted.contains(id) {
                    if committed.is_some() {
                        return Err(StoreError::Conflict(format!("job {id}")));
                    }
                } else {
                    let base = graph.jobs[id].version;
                    match committed {
                        Some(current) if current.version == base => {}
                        _ => return Err(StoreError::Conflict(format!("job {id}"))),
                    }
                }
            }
            for (id, base) in &touched.removed {
                match state.jobs.get(id) {
                    Some(current) if current.version == *base => {}
                    _ => return Err(StoreError::Conflict(format!("job {id}"))),
                }
            }
            if touched.pending && state.pending.version != graph.pending.version {
                return Err(StoreError::Conflict("pending queue".into()));
            }
            if touched.active && state.active.version != graph.active.version {
                return Err(StoreError::Conflict("active flag".into()));
            }
            if touched.settings && state.settings.version != graph.settings.version {
                return Err(StoreError::Conflict("settings".into()));
            }

            for id in &touched.jobs {
                let Some(mut versioned) = graph.jobs.remove(id) else {
                    continue;
                };
                if !touched.inserted.contains(id) {
                    versioned.version += 1;
                }
                state.jobs.insert(*id, versioned);
            }
            for id in touched.removed.keys() {
                state.jobs.remove(id);
            }
            if touched.pending {
                state.pending = Versioned {
                    version: graph.pending.version + 1,
                    value: std::mem::take(&mut graph.pending.value),
                };
            }
            if touched.active {
                state.active = Versioned {
                    version: graph.active.version + 1,
                    value: graph.active.value,
                };
            }
            if touched.settings {
                state.settings = Versioned {
                    version: graph.settings.version + 1,
                    value: graph.settings.value.take(),
                };
            }
            state.revision += 1;
        }

        store.persist_after_commit().await;
        Ok(())
    }
}
