//! The *registry*: the external strongly-consistent key-value store used
//! for durable metadata and service discovery. Its contract
//! — get/put/compare-and-swap/delete/prefix-list/prefix-watch plus session
//! leases for membership events — is defined here; `etcd` is the only
//! concrete backend.

pub mod etcd;
pub mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;

/// Revision of a stored value, used as the optimistic-concurrency token for
/// `put_cas`. Opaque to callers beyond equality comparison.
pub type Revision = i64;

#[derive(Debug, Clone)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub revision: Revision,
}

#[derive(Debug, Clone)]
pub enum WatchEvent {
    Put(KeyValue),
    Delete { key: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Add { node_id: u64 },
    Del { node_id: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry connect failed: {0}")]
    Connect(String),
    #[error("registry operation failed: {0}")]
    Operation(String),
    #[error("compare-and-swap rejected: key {0} was modified concurrently")]
    CasConflict(String),
    #[error("key not found: {0}")]
    NotFound(String),
}

/// Minimal contract the coordinator and worker need from the metadata /
/// service-discovery store. Implementations must provide linearizable
/// CAS semantics per key.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, RegistryError>;

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, RegistryError>;

    /// Unconditional put used only for first-time creation; callers must
    /// have already checked for prior existence (see `MetadataTable::add_task`).
    async fn put(&self, key: &str, value: &[u8]) -> Result<Revision, RegistryError>;

    /// Put guarded by the revision the caller last observed. Returns the
    /// new revision on success, or `CasConflict` if `expected_revision` is
    /// stale.
    async fn put_cas(
        &self,
        key: &str,
        value: &[u8],
        expected_revision: Revision,
    ) -> Result<Revision, RegistryError>;

    async fn delete(&self, key: &str) -> Result<(), RegistryError>;

    /// Watches all keys under `prefix`, starting at `start_revision`
    /// (use 0 to start from "now"). The stream never completes on its own;
    /// callers drop it (or cancel a wrapping task) to stop watching.
    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: Revision,
    ) -> Result<BoxStream<'static, WatchEvent>, RegistryError>;

    /// Registers `node_id`/`address` under a leased session key and keeps
    /// the lease alive until the returned guard is dropped or the process
    /// exits. Used by workers to announce themselves; the coordinator
    /// observes the resulting add/remove through `watch_sessions`.
    async fn register_session(&self, prefix: &str, node_id: u64, address: &str) -> Result<(), RegistryError>;

    /// Watches session add/remove events under `prefix`, returning the
    /// currently-live set and the revision to resume watching from.
    async fn snapshot_sessions(
        &self,
        prefix: &str,
    ) -> Result<(Vec<(u64, String)>, Revision), RegistryError>;

    async fn watch_sessions(
        &self,
        prefix: &str,
        start_revision: Revision,
    ) -> Result<BoxStream<'static, SessionEvent>, RegistryError>;
}
