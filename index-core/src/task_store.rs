//! Shared CAS-retry helper for mutating a `TaskRecord` in the registry.
//! Used by the coordinator's metadata table (through its own cache) and
//! directly by the worker when it commits a build's result — the only two writers of task records.

use crate::model::TaskRecord;
use crate::registry::{Registry, RegistryError};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum TaskStoreError {
    #[error("task {0} not found")]
    NotFound(u64),
    #[error("compare-and-swap conflict updating task {0} after {1} retries")]
    Conflict(u64, u32),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("corrupt task record for {0}: {1}")]
    Decode(u64, serde_json::Error),
}

/// Applies `mutate` to the current record for `index_build_id`, retrying
/// on CAS conflict up to `max_attempts` times. `mutate` must be pure with
/// respect to anything beyond the record itself, since it may run more
/// than once.
pub async fn update_cas<F>(
    registry: &Arc<dyn Registry>,
    meta_root_path: &str,
    index_build_id: u64,
    max_attempts: u32,
    mutate: F,
) -> Result<TaskRecord, TaskStoreError>
where
    F: Fn(&mut TaskRecord),
{
    let key = TaskRecord::registry_key(meta_root_path, index_build_id);
    for _ in 0..max_attempts {
        let kv = registry
            .get(&key)
            .await?
            .ok_or(TaskStoreError::NotFound(index_build_id))?;
        let mut record = TaskRecord::try_from(kv.value.as_slice())
            .map_err(|e| TaskStoreError::Decode(index_build_id, e))?;
        mutate(&mut record);
        match registry.put_cas(&key, &record.encode(), kv.revision).await {
            Ok(_) => return Ok(record),
            Err(RegistryError::CasConflict(_)) => continue,
            Err(other) => return Err(other.into()),
        }
    }
    Err(TaskStoreError::Conflict(index_build_id, max_attempts))
}
