//! Store handle: open/begin/close and snapshot persistence.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::graph::{Graph, SnapshotFile};
use crate::txn::Transaction;

/// Handle to the shared transactional store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Arc<StoreInner>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

pub(crate) struct StoreInner {
    pub(crate) state: Mutex<Graph>,
    path: Option<PathBuf>,
    /// Serializes snapshot writes so a slow write cannot clobber a newer one.
    persist_lock: tokio::sync::Mutex<()>,
    last_persisted: AtomicU64,
    closed: AtomicBool,
}

impl Store {
    /// Create a store with no backing file. State is lost when dropped.
    pub fn in_memory() -> Self {
        Self::from_graph(Graph::default(), None)
    }

    /// Open a store backed by a JSON snapshot file, loading it if present.
    pub async fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let graph = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => {
                let file: SnapshotFile = serde_json::from_str(&raw)?;
                debug!(path = %path.display(), revision = file.graph.revision, "loaded store snapshot");
                file.graph
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Graph::default(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self::from_graph(graph, Some(path)))
    }

    fn from_graph(graph: Graph, path: Option<PathBuf>) -> Self {
        let revision = graph.revision;
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(graph),
                path,
                persist_lock: tokio::sync::Mutex::new(()),
                last_persisted: AtomicU64::new(revision),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Begin a transaction over a consistent snapshot of the committed graph.
    pub fn begin(&self) -> Transaction {
        let graph = self.state().clone();
        Transaction::new(self.clone(), graph)
    }

    /// Persist a final snapshot and refuse all further commits.
    pub async fn close(&self) -> StoreResult<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.persist().await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn check_open(&self) -> StoreResult<()> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, Graph> {
        // A poisoned lock only means another thread panicked mid-commit with
        // the graph still consistent (mutations apply after all checks pass).
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Write the latest committed graph to the snapshot file, if any.
    pub(crate) async fn persist(&self) -> StoreResult<()> {
        let Some(path) = self.inner.path.clone() else {
            return Ok(());
        };

        let _guard = self.inner.persist_lock.lock().await;
        let file = SnapshotFile::new(self.state().clone());
        let revision = file.graph.revision;
        if revision <= self.inner.last_persisted.load(Ordering::SeqCst) && revision != 0 {
            return Ok(());
        }

        tokio::task::spawn_blocking(move || write_snapshot(&path, &file))
            .await
            .map_err(|err| {
                StoreError::Io(std::io::Error::other(format!(
                    "snapshot write task failed: {err}"
                )))
            })??;
        self.inner.last_persisted.store(revision, Ordering::SeqCst);
        Ok(())
    }

    /// Best-effort persist used on the commit path: the in-memory commit has
    /// already been applied, so a failed snapshot write is logged, not raised.
    pub(crate) async fn persist_after_commit(&self) {
        if let Err(err) = self.persist().await {
            warn!(error = %err, "failed to persist store snapshot");
        }
    }
}

fn write_snapshot(path: &Path, file: &SnapshotFile) -> StoreResult<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let json = serde_json::to_string_pretty(file)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}
