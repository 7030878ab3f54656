//! The worker's build execution path. The index-building algorithm
//! itself is treated as an opaque, pluggable action; `IndexBuildAction`
//! is the seam that keeps it out of scope while still letting the
//! worker exercise its full commit protocol end to end.

use crate::metrics::Metrics;
use async_trait::async_trait;
use index_core::blobstore::BlobStore;
use index_core::model::{TaskRecord, TaskState};
use index_core::proto::CreateIndexRequest;
use index_core::registry::{Registry, RegistryError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("blob store error: {0}")]
    BlobStore(#[from] index_core::blobstore::BlobStoreError),
}

/// The index-build algorithm itself — deliberately out of scope here.
/// Swappable so a real ANN builder can be plugged in without touching
/// the commit protocol below.
#[async_trait]
pub trait IndexBuildAction: Send + Sync {
    async fn build(&self, request: &CreateIndexRequest) -> Result<Vec<String>, BuildError>;
}

/// Default action: writes a single marker blob per build rather than an
/// actual index, under the same `{IndexBuildID}/{Version}/...` prefix a
/// real builder would use, so the recycle
/// loop's prefix-delete logic can be exercised end to end without a real
/// index-building dependency.
pub struct PlaceholderIndexBuildAction {
    blob_store: Arc<dyn BlobStore>,
}

impl PlaceholderIndexBuildAction {
    pub fn new(blob_store: Arc<dyn BlobStore>) -> Self {
        Self { blob_store }
    }
}

#[async_trait]
impl IndexBuildAction for PlaceholderIndexBuildAction {
    async fn build(&self, request: &CreateIndexRequest) -> Result<Vec<String>, BuildError> {
        let key = format!("{}/{}/index.bin", request.index_build_id, request.version);
        self.blob_store.put(&key, b"placeholder index data".to_vec()).await?;
        Ok(vec![key])
    }
}

/// A worker handles one build at a time. `try_acquire` gives the gRPC handler a non-blocking
/// way to reject a `CreateIndex` call while busy, rather than queuing it.
pub struct BuildSlot {
    busy: AtomicBool,
}

impl Default for BuildSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildSlot {
    pub fn new() -> Self {
        Self {
            busy: AtomicBool::new(false),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Returns a guard that frees the slot on drop, or `None` if a build
    /// is already in flight.
    pub fn try_acquire(self: &Arc<Self>) -> Option<BuildSlotGuard> {
        if self.busy.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(BuildSlotGuard { slot: self.clone() })
        }
    }
}

pub struct BuildSlotGuard {
    slot: Arc<BuildSlot>,
}

impl Drop for BuildSlotGuard {
    fn drop(&mut self) {
        self.slot.busy.store(false, Ordering::Release);
    }
}

/// Runs the build and commits its outcome, holding `_guard` until the
/// commit attempt is over so the slot only frees once this worker is
/// truly done with the task (success, failure, or superseded).
pub async fn run_build(
    action: Arc<dyn IndexBuildAction>,
    registry: Arc<dyn Registry>,
    meta_root_path: String,
    request: CreateIndexRequest,
    self_node_id: u64,
    metrics: Arc<Metrics>,
    _guard: BuildSlotGuard,
) {
    metrics.build_in_progress.set(1);
    let outcome = match action.build(&request).await {
        Ok(paths) => Outcome::Finished(paths),
        Err(err) => Outcome::Failed(err.to_string()),
    };
    let committed = commit_result(
        &registry,
        &meta_root_path,
        request.index_build_id,
        self_node_id,
        request.version,
        outcome,
    )
    .await;
    metrics.builds_total.with_label_values(&[committed]).inc();
    metrics.build_in_progress.set(0);
}

enum Outcome {
    Finished(Vec<String>),
    Failed(String),
}

/// Commits the build outcome to the registry, but only if this worker
/// still holds the task at the version it was assigned. A late reassignment — observed either as
/// a mismatched `(node_id, version)` or as a CAS conflict on write — is
/// discarded silently: this worker is abandoned by definition and must
/// not retry or escalate.
/// Returns the outcome label recorded against `builds_total` — `finished`
/// or `failed` when the commit actually lands, `discarded` for every path
/// where this worker turned out not to own the task anymore.
async fn commit_result(
    registry: &Arc<dyn Registry>,
    meta_root_path: &str,
    index_build_id: u64,
    self_node_id: u64,
    version: u64,
    outcome: Outcome,
) -> &'static str {
    let key = TaskRecord::registry_key(meta_root_path, index_build_id);
    let kv = match registry.get(&key).await {
        Ok(Some(kv)) => kv,
        Ok(None) => {
            warn!(index_build_id, "task record vanished before commit, discarding result");
            return "discarded";
        }
        Err(err) => {
            warn!(index_build_id, %err, "failed to read task record before commit");
            return "discarded";
        }
    };

    let mut record = match TaskRecord::try_from(kv.value.as_slice()) {
        Ok(record) => record,
        Err(err) => {
            warn!(index_build_id, %err, "corrupt task record before commit, discarding result");
            return "discarded";
        }
    };

    if record.node_id != self_node_id || record.version != version {
        warn!(
            index_build_id,
            self_node_id,
            version,
            current_node_id = record.node_id,
            current_version = record.version,
            "task was reassigned, discarding stale build result"
        );
        return "discarded";
    }

    let label = match &outcome {
        Outcome::Finished(_) => "finished",
        Outcome::Failed(_) => "failed",
    };
    match outcome {
        Outcome::Finished(paths) => {
            record.state = TaskState::Finished;
            record.index_file_paths = paths;
        }
        Outcome::Failed(reason) => {
            record.state = TaskState::Failed;
            record.fail_reason = reason;
        }
    }

    match registry.put_cas(&key, &record.encode(), kv.revision).await {
        Ok(_) => {
            info!(index_build_id, version, "build result committed");
            label
        }
        Err(RegistryError::CasConflict(_)) => {
            warn!(index_build_id, version, "commit lost a race with reassignment, discarding result");
            "discarded"
        }
        Err(err) => {
            warn!(index_build_id, version, %err, "failed to commit build result");
            "discarded"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use index_core::proto::{IndexParams, TypeParams};
    use index_core::registry::memory::InMemoryRegistry;

    fn request(index_build_id: u64, version: u64) -> CreateIndexRequest {
        CreateIndexRequest {
            index_build_id,
            index_name: "idx".to_string(),
            index_id: 7,
            version,
            meta_path: "meta/indexes/1".to_string(),
            data_paths: vec!["/a".to_string()],
            type_params: Some(TypeParams::default()),
            index_params: Some(IndexParams::default()),
        }
    }

    #[tokio::test]
    async fn build_slot_rejects_concurrent_acquire() {
        let slot = Arc::new(BuildSlot::new());
        let guard = slot.try_acquire().unwrap();
        assert!(slot.try_acquire().is_none());
        drop(guard);
        assert!(slot.try_acquire().is_some());
    }

    #[tokio::test]
    async fn commit_succeeds_when_assignment_still_matches() {
        let registry: Arc<dyn Registry> = Arc::new(InMemoryRegistry::new());
        let record = {
            let mut r = TaskRecord::new(1, index_core::model::BuildRequest {
                index_id: 7,
                index_name: "idx".to_string(),
                data_paths: vec!["/a".to_string()],
                type_params: Default::default(),
                index_params: Default::default(),
            });
            r.node_id = 42;
            r.version = 1;
            r
        };
        registry.put(&TaskRecord::registry_key("meta", 1), &record.encode()).await.unwrap();

        let label = commit_result(&registry, "meta", 1, 42, 1, Outcome::Finished(vec!["p1".to_string()])).await;
        assert_eq!(label, "finished");

        let stored = registry.get(&TaskRecord::registry_key("meta", 1)).await.unwrap().unwrap();
        let stored = TaskRecord::try_from(stored.value.as_slice()).unwrap();
        assert_eq!(stored.state, TaskState::Finished);
        assert_eq!(stored.index_file_paths, vec!["p1".to_string()]);
    }

    #[tokio::test]
    async fn commit_is_discarded_after_reassignment_to_another_node() {
        let registry: Arc<dyn Registry> = Arc::new(InMemoryRegistry::new());
        let record = {
            let mut r = TaskRecord::new(1, index_core::model::BuildRequest {
                index_id: 7,
                index_name: "idx".to_string(),
                data_paths: vec!["/a".to_string()],
                type_params: Default::default(),
                index_params: Default::default(),
            });
            r.node_id = 99;
            r.version = 2;
            r
        };
        registry.put(&TaskRecord::registry_key("meta", 1), &record.encode()).await.unwrap();

        // N1 held version 1, but the task has since been reassigned (v2, N99).
        let label = commit_result(&registry, "meta", 1, 1, 1, Outcome::Finished(vec!["stale".to_string()])).await;
        assert_eq!(label, "discarded");

        let stored = registry.get(&TaskRecord::registry_key("meta", 1)).await.unwrap().unwrap();
        let stored = TaskRecord::try_from(stored.value.as_slice()).unwrap();
        assert_ne!(stored.state, TaskState::Finished);
        assert!(stored.index_file_paths.is_empty());
    }

    #[tokio::test]
    async fn placeholder_action_writes_a_blob_under_the_version_prefix() {
        let blob_store: Arc<dyn BlobStore> = Arc::new(index_core::blobstore::memory::InMemoryBlobStore::new());
        let action = PlaceholderIndexBuildAction::new(blob_store.clone());
        let paths = action.build(&request(5, 3)).await.unwrap();
        assert_eq!(paths, vec!["5/3/index.bin".to_string()]);
    }
}
