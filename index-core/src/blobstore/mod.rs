//! The *blob store*: the external object store holding index artifacts,
//! laid out as `{IndexBuildID}/{Version}/...`. The recycle loop
//! (C7) only ever needs prefix-scoped delete; workers only ever need
//! prefix-scoped put.

pub mod memory;
pub mod s3;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum BlobStoreError {
    #[error("blob store connect failed: {0}")]
    Connect(String),
    #[error("blob store operation failed: {0}")]
    Operation(String),
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), BlobStoreError>;

    /// Deletes every object whose key starts with `prefix`. Deleting a
    /// prefix with no matching objects is not an error.
    async fn remove_with_prefix(&self, prefix: &str) -> Result<(), BlobStoreError>;
}
