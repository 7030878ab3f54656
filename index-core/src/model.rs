//! The task record and related domain types.

use crate::proto;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Zero value; never actually stored, only returned for unknown ids.
    None,
    Unissued,
    InProgress,
    Finished,
    Failed,
}

impl From<TaskState> for proto::IndexState {
    fn from(value: TaskState) -> Self {
        match value {
            TaskState::None => proto::IndexState::None,
            TaskState::Unissued => proto::IndexState::Unissued,
            TaskState::InProgress => proto::IndexState::InProgress,
            TaskState::Finished => proto::IndexState::Finished,
            TaskState::Failed => proto::IndexState::Failed,
        }
    }
}

/// The original, immutable build request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub index_id: u64,
    pub index_name: String,
    pub data_paths: Vec<String>,
    pub type_params: BTreeMap<String, String>,
    pub index_params: BTreeMap<String, String>,
}

impl BuildRequest {
    /// Canonical `(IndexID, sorted(DataPaths), TypeParams, IndexParams)`
    /// tuple used for admission-time deduplication. `type_params`/`index_params` are `BTreeMap`s so
    /// their serialized form is already canonical (sorted by key).
    pub fn fingerprint(&self) -> String {
        let mut data_paths = self.data_paths.clone();
        data_paths.sort();
        format!(
            "{}:{:?}:{:?}:{:?}",
            self.index_id, data_paths, self.type_params, self.index_params
        )
    }
}

impl From<proto::BuildIndexRequest> for BuildRequest {
    fn from(value: proto::BuildIndexRequest) -> Self {
        Self {
            index_id: value.index_id,
            index_name: value.index_name,
            data_paths: value.data_paths,
            type_params: value.type_params.map(|p| p.params).unwrap_or_default(),
            index_params: value.index_params.map(|p| p.params).unwrap_or_default(),
        }
    }
}

/// The durable task record — the central entity of the coordination core,
/// keyed by `IndexBuildID`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub index_build_id: u64,
    pub req: BuildRequest,
    pub state: TaskState,
    pub version: u64,
    pub node_id: u64,
    pub mark_deleted: bool,
    pub recycled: bool,
    pub index_file_paths: Vec<String>,
    pub fail_reason: String,
}

impl TaskRecord {
    pub fn new(index_build_id: u64, req: BuildRequest) -> Self {
        Self {
            index_build_id,
            req,
            state: TaskState::Unissued,
            version: 0,
            node_id: 0,
            mark_deleted: false,
            recycled: false,
            index_file_paths: Vec::new(),
            fail_reason: String::new(),
        }
    }

    pub fn registry_key(root: &str, index_build_id: u64) -> String {
        format!("{root}/indexes/{index_build_id}")
    }

    /// Records that are obsolete enough to recycle: either fully deleted, or superseded by a
    /// later version whose blobs have not yet been cleaned up.
    pub fn has_unused_files(&self) -> bool {
        self.mark_deleted || (self.version > 1 && !self.recycled)
    }

    pub fn is_orphaned(&self, live_node_ids: &std::collections::HashSet<u64>) -> bool {
        self.state == TaskState::InProgress && !live_node_ids.contains(&self.node_id)
    }

    pub fn is_unassigned(&self, live_node_ids: &std::collections::HashSet<u64>) -> bool {
        self.state == TaskState::Unissued || self.is_orphaned(live_node_ids)
    }
}

impl TryFrom<&[u8]> for TaskRecord {
    type Error = serde_json::Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        serde_json::from_slice(bytes)
    }
}

impl TaskRecord {
    pub fn encode(&self) -> Vec<u8> {
        // Infallible: `TaskRecord` contains only plain data, no interior
        // mutability or non-serializable fields.
        serde_json::to_vec(self).expect("TaskRecord is always serializable")
    }
}

impl From<&TaskRecord> for proto::IndexStateInfo {
    fn from(record: &TaskRecord) -> Self {
        Self {
            index_build_id: record.index_build_id,
            state: proto::IndexState::from(record.state) as i32,
            fail_reason: record.fail_reason.clone(),
        }
    }
}

/// Live worker membership as observed by the coordinator. The RPC client handle itself lives in `WorkerPool`, not
/// here — this is the plain data shared with callers (e.g. `GetMetrics`).
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub node_id: u64,
    pub address: String,
    pub priority: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(paths: &[&str]) -> BuildRequest {
        BuildRequest {
            index_id: 7,
            index_name: "idx".to_string(),
            data_paths: paths.iter().map(|s| s.to_string()).collect(),
            type_params: BTreeMap::new(),
            index_params: BTreeMap::new(),
        }
    }

    #[test]
    fn fingerprint_is_order_independent_over_data_paths() {
        let a = req(&["/a", "/b"]);
        let b = req(&["/b", "/a"]);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_differs_on_index_id() {
        let mut a = req(&["/a"]);
        let b = req(&["/a"]);
        a.index_id = 8;
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn has_unused_files_covers_deleted_and_stale_versions() {
        let mut record = TaskRecord::new(1, req(&["/a"]));
        assert!(!record.has_unused_files());

        record.mark_deleted = true;
        assert!(record.has_unused_files());

        record.mark_deleted = false;
        record.version = 3;
        assert!(record.has_unused_files());

        record.recycled = true;
        assert!(!record.has_unused_files());
    }
}
