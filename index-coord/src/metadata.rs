//! C3: the metadata table. Owns the single authoritative, lock-protected
//! in-memory cache of every `TaskRecord`, kept coherent with the registry
//! by writing through it on every mutation.

use index_core::error::MetadataError;
use index_core::model::{BuildRequest, TaskRecord, TaskState};
use index_core::registry::{Registry, WatchEvent};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub struct MetadataTable {
    registry: Arc<dyn Registry>,
    meta_root_path: String,
    cache: Mutex<HashMap<u64, TaskRecord>>,
}

impl MetadataTable {
    pub fn new(registry: Arc<dyn Registry>, meta_root_path: String) -> Self {
        Self {
            registry,
            meta_root_path,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn key(&self, index_build_id: u64) -> String {
        TaskRecord::registry_key(&self.meta_root_path, index_build_id)
    }

    /// Loads every task currently in the registry into the cache,
    /// replacing whatever was there before. Called once during the
    /// coordinator's init sequence before any RPC is served.
    pub async fn load_from_registry(&self) -> Result<(), MetadataError> {
        let entries = self.registry.list_prefix(&format!("{}/indexes/", self.meta_root_path)).await?;
        let mut cache = self.cache.lock().await;
        cache.clear();
        for kv in entries {
            match TaskRecord::try_from(kv.value.as_slice()) {
                Ok(record) => {
                    cache.insert(record.index_build_id, record);
                }
                Err(err) => {
                    warn!(key = %kv.key, %err, "skipping corrupt task record during load");
                }
            }
        }
        info!(count = cache.len(), "metadata table loaded from registry");
        Ok(())
    }

    /// Applies a single registry watch event to the cache, used by the
    /// watch-meta loop (C6) to stay current without a full reload.
    pub async fn apply_watch_event(&self, event: WatchEvent) {
        let mut cache = self.cache.lock().await;
        match event {
            WatchEvent::Put(kv) => match TaskRecord::try_from(kv.value.as_slice()) {
                Ok(record) => {
                    cache.insert(record.index_build_id, record);
                }
                Err(err) => warn!(key = %kv.key, %err, "dropping corrupt task record from watch"),
            },
            WatchEvent::Delete { key } => {
                if let Some(id) = key.rsplit('/').next().and_then(|s| s.parse::<u64>().ok()) {
                    cache.remove(&id);
                }
            }
        }
    }

    /// returns the existing live
    /// (not marked-deleted) task whose request fingerprint matches `req`,
    /// if any.
    pub async fn find_by_fingerprint(&self, req: &BuildRequest) -> Option<u64> {
        let fingerprint = req.fingerprint();
        let cache = self.cache.lock().await;
        cache
            .values()
            .find(|r| !r.mark_deleted && r.req.fingerprint() == fingerprint)
            .map(|r| r.index_build_id)
    }

    /// Creates a brand-new task record, writing through to the registry
    /// first so a crash between the two never leaves the cache ahead of
    /// durable state. Fails with `AlreadyExists` if `index_build_id` is
    /// already present in the registry — `put` is unconditional, so the
    /// existence check has to happen here before it's called.
    pub async fn add_task(&self, index_build_id: u64, req: BuildRequest) -> Result<(), MetadataError> {
        if self.registry.get(&self.key(index_build_id)).await?.is_some() {
            return Err(MetadataError::AlreadyExists(index_build_id));
        }
        let record = TaskRecord::new(index_build_id, req);
        self.registry.put(&self.key(index_build_id), &record.encode()).await?;
        self.cache.lock().await.insert(index_build_id, record);
        Ok(())
    }

    /// Retries on CAS conflict against the registry, then reconciles the
    /// cache with the record that actually won. `MAX_ATTEMPTS` bounds the
    /// busy loop; a persistent conflict is logged and deferred to the next
    /// caller.
    async fn update_cas<F>(&self, index_build_id: u64, mutate: F) -> Result<TaskRecord, MetadataError>
    where
        F: Fn(&mut TaskRecord),
    {
        const MAX_ATTEMPTS: u32 = 16;
        let record = index_core::task_store::update_cas(
            &self.registry,
            &self.meta_root_path,
            index_build_id,
            MAX_ATTEMPTS,
            mutate,
        )
        .await
        .map_err(|err| match err {
            index_core::task_store::TaskStoreError::NotFound(id) => MetadataError::NotFound(id),
            index_core::task_store::TaskStoreError::Conflict(id, attempts) => {
                MetadataError::Conflict(id, attempts)
            }
            index_core::task_store::TaskStoreError::Registry(e) => MetadataError::Registry(e),
            index_core::task_store::TaskStoreError::Decode(id, e) => MetadataError::Decode(id, e),
        })?;
        self.cache.lock().await.insert(index_build_id, record.clone());
        Ok(record)
    }

    /// Bumps a task's version, the mutation the assign loop (C5) makes
    /// *before* it even has a worker picked, so a late completion from
    /// whichever node held the previous version is rejected by CAS
    /// regardless of whether this tick ever dispatches successfully — a
    /// worker RPC failure never decrements the version once bumped.
    pub async fn update_version(&self, index_build_id: u64) -> Result<u64, MetadataError> {
        let record = self
            .update_cas(index_build_id, |record| record.version += 1)
            .await?;
        Ok(record.version)
    }

    /// Flips a task to `InProgress` on the given node. Called only after
    /// the assign loop's `CreateIndex` RPC has actually succeeded — a
    /// task whose dispatch RPC failed must stay `Unissued` so it is
    /// retried next tick.
    pub async fn build_index(&self, index_build_id: u64, node_id: u64) -> Result<(), MetadataError> {
        self.update_cas(index_build_id, |record| {
            record.node_id = node_id;
            record.state = TaskState::InProgress;
        })
        .await?;
        Ok(())
    }

    /// Test/seeding convenience combining `update_version` + `build_index`
    /// into one step, for scenarios that only care about the resulting
    /// state and not the two-phase dispatch sequencing. Not used by the
    /// real assign loop (see `assign::tick`), which must observe the RPC
    /// outcome between the two.
    pub async fn assign_task(&self, index_build_id: u64, node_id: u64) -> Result<u64, MetadataError> {
        let version = self.update_version(index_build_id).await?;
        self.build_index(index_build_id, node_id).await?;
        Ok(version)
    }

    pub async fn mark_deleted(&self, index_id: u64) -> Result<(), MetadataError> {
        let ids: Vec<u64> = {
            let cache = self.cache.lock().await;
            cache
                .values()
                .filter(|r| r.req.index_id == index_id && !r.mark_deleted)
                .map(|r| r.index_build_id)
                .collect()
        };
        for id in ids {
            self.update_cas(id, |record| record.mark_deleted = true).await?;
        }
        Ok(())
    }

    pub async fn mark_recycled(&self, index_build_id: u64) -> Result<(), MetadataError> {
        self.update_cas(index_build_id, |record| record.recycled = true)
            .await
            .map(|_| ())
    }

    /// Removes a task record entirely once its blobs have been reclaimed
    ///.
    pub async fn delete_task(&self, index_build_id: u64) -> Result<(), MetadataError> {
        self.registry.delete(&self.key(index_build_id)).await?;
        self.cache.lock().await.remove(&index_build_id);
        Ok(())
    }

    pub async fn get_states(&self, index_build_ids: &[u64]) -> Vec<Option<TaskRecord>> {
        let cache = self.cache.lock().await;
        index_build_ids.iter().map(|id| cache.get(id).cloned()).collect()
    }

    pub async fn get_file_paths(&self, index_build_id: u64) -> Option<Vec<String>> {
        self.cache
            .lock()
            .await
            .get(&index_build_id)
            .filter(|r| r.state == TaskState::Finished)
            .map(|r| r.index_file_paths.clone())
    }

    /// Unassigned or orphaned (assigned to a now-dead node) tasks, sorted
    /// by version ascending so the assign loop (C5) favours the
    /// longest-waiting work first.
    pub async fn get_unassigned_tasks(&self, live_node_ids: &HashSet<u64>) -> Vec<TaskRecord> {
        let cache = self.cache.lock().await;
        let mut tasks: Vec<TaskRecord> = cache
            .values()
            .filter(|r| !r.mark_deleted && r.is_unassigned(live_node_ids))
            .cloned()
            .collect();
        tasks.sort_by_key(|r| r.version);
        tasks
    }

    /// Tasks with reclaimable blobs: fully
    /// deleted records, and stale (superseded) versions not yet recycled.
    pub async fn get_unused_index_files(&self) -> Vec<TaskRecord> {
        self.cache
            .lock()
            .await
            .values()
            .filter(|r| r.has_unused_files())
            .cloned()
            .collect()
    }

    /// In-flight task count per node, used by the worker pool (C2) to
    /// reconcile its priority heap after a reload.
    pub async fn get_node_task_stats(&self) -> HashMap<u64, i64> {
        let mut stats = HashMap::new();
        for record in self.cache.lock().await.values() {
            if record.state == TaskState::InProgress {
                *stats.entry(record.node_id).or_insert(0) += 1;
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use index_core::registry::memory::InMemoryRegistry;
    use std::collections::BTreeMap;

    fn req(index_id: u64) -> BuildRequest {
        BuildRequest {
            index_id,
            index_name: "idx".to_string(),
            data_paths: vec!["/a".to_string()],
            type_params: BTreeMap::new(),
            index_params: BTreeMap::new(),
        }
    }

    fn table() -> MetadataTable {
        let registry: Arc<dyn Registry> = Arc::new(InMemoryRegistry::new());
        MetadataTable::new(registry, "meta-root".to_string())
    }

    fn table_with_registry() -> (MetadataTable, Arc<dyn Registry>) {
        let registry: Arc<dyn Registry> = Arc::new(InMemoryRegistry::new());
        (MetadataTable::new(registry.clone(), "meta-root".to_string()), registry)
    }

    #[tokio::test]
    async fn add_then_find_by_fingerprint_dedups() {
        let table = table();
        table.add_task(1, req(7)).await.unwrap();
        assert_eq!(table.find_by_fingerprint(&req(7)).await, Some(1));
        assert_eq!(table.find_by_fingerprint(&req(8)).await, None);
    }

    #[tokio::test]
    async fn add_task_rejects_a_reused_id() {
        let table = table();
        table.add_task(1, req(7)).await.unwrap();
        let err = table.add_task(1, req(8)).await.unwrap_err();
        assert!(matches!(err, MetadataError::AlreadyExists(1)));
        // the original record must survive untouched
        assert_eq!(table.find_by_fingerprint(&req(7)).await, Some(1));
    }

    #[tokio::test]
    async fn worker_commit_then_reload_reflects_finished_state() {
        let (table, registry) = table_with_registry();
        table.add_task(1, req(7)).await.unwrap();
        let version = table.assign_task(1, 42).await.unwrap();
        assert_eq!(version, 1);

        // Simulate the worker committing its result directly to the
        // registry, the way `index-node` does — the coordinator never calls this itself.
        index_core::task_store::update_cas(&registry, "meta-root", 1, 8, |record| {
            record.state = TaskState::Finished;
            record.index_file_paths = vec!["p1".to_string()];
        })
        .await
        .unwrap();

        table.load_from_registry().await.unwrap();
        let states = table.get_states(&[1]).await;
        let record = states[0].as_ref().unwrap();
        assert_eq!(record.state, TaskState::Finished);
        assert_eq!(record.index_file_paths, vec!["p1".to_string()]);
    }

    #[tokio::test]
    async fn mark_deleted_marks_every_build_for_index() {
        let table = table();
        table.add_task(1, req(7)).await.unwrap();
        table.assign_task(1, 42).await.unwrap();
        table.add_task(2, req(7)).await.unwrap();
        table.mark_deleted(7).await.unwrap();

        let unused = table.get_unused_index_files().await;
        assert_eq!(unused.len(), 2);
    }

    #[tokio::test]
    async fn unassigned_tasks_include_orphans_of_dead_nodes() {
        let table = table();
        table.add_task(1, req(7)).await.unwrap();
        table.assign_task(1, 99).await.unwrap();

        let live: HashSet<u64> = HashSet::new();
        let unassigned = table.get_unassigned_tasks(&live).await;
        assert_eq!(unassigned.len(), 1);

        let live: HashSet<u64> = [99].into_iter().collect();
        let unassigned = table.get_unassigned_tasks(&live).await;
        assert!(unassigned.is_empty());
    }
}
