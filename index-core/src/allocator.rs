//! The *allocator*: the external id/timestamp allocator. Its
//! only contract the coordinator relies on is a monotonically increasing,
//! globally unique 64-bit id source for `IndexBuildID`. The
//! concrete allocator service (a dedicated TSO-style process in
//! production) is out of scope; `RegistryBackedAllocator` gives a default
//! implementation that satisfies the contract using a CAS loop against the
//! registry's `KvRootPath`, so the coordinator can run standalone without
//! a separate allocator deployment.

use crate::registry::Registry;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum AllocatorError {
    #[error("allocator unavailable: {0}")]
    Unavailable(#[from] crate::registry::RegistryError),
    #[error("allocator exhausted its retry budget")]
    RetryExhausted,
}

#[async_trait]
pub trait Allocator: Send + Sync {
    /// Allocates a single globally unique, monotonically increasing id.
    async fn alloc_id(&self) -> Result<u64, AllocatorError>;
}

pub struct RegistryBackedAllocator {
    registry: Arc<dyn Registry>,
    counter_key: String,
}

impl RegistryBackedAllocator {
    pub fn new(registry: Arc<dyn Registry>, kv_root_path: &str) -> Self {
        Self {
            registry,
            counter_key: format!("{kv_root_path}/id-allocator/counter"),
        }
    }
}

#[async_trait]
impl Allocator for RegistryBackedAllocator {
    async fn alloc_id(&self) -> Result<u64, AllocatorError> {
        const MAX_ATTEMPTS: u32 = 32;
        for _ in 0..MAX_ATTEMPTS {
            let current = self.registry.get(&self.counter_key).await?;
            let (next, expected_revision) = match current {
                Some(kv) => {
                    let parsed: u64 = std::str::from_utf8(&kv.value)
                        .ok()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0);
                    (parsed + 1, kv.revision)
                }
                None => {
                    // First allocation: unconditional put, retried as a
                    // CAS-from-zero if another allocator raced us.
                    match self
                        .registry
                        .put(&self.counter_key, b"1")
                        .await
                    {
                        Ok(_) => return Ok(1),
                        Err(_) => continue,
                    }
                }
            };
            match self
                .registry
                .put_cas(&self.counter_key, next.to_string().as_bytes(), expected_revision)
                .await
            {
                Ok(_) => return Ok(next),
                Err(_) => {
                    debug!("allocator CAS lost a race, retrying");
                    continue;
                }
            }
        }
        Err(AllocatorError::RetryExhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::memory::InMemoryRegistry;
    use std::collections::HashSet;

    #[tokio::test]
    async fn allocated_ids_are_unique_and_increasing() {
        let registry: Arc<dyn Registry> = Arc::new(InMemoryRegistry::new());
        let allocator = RegistryBackedAllocator::new(registry, "kv-root");

        let mut ids = HashSet::new();
        let mut last = 0u64;
        for _ in 0..20 {
            let id = allocator.alloc_id().await.unwrap();
            assert!(id > last);
            last = id;
            assert!(ids.insert(id));
        }
    }

    #[tokio::test]
    async fn concurrent_allocations_never_collide() {
        let registry: Arc<dyn Registry> = Arc::new(InMemoryRegistry::new());
        let allocator = Arc::new(RegistryBackedAllocator::new(registry, "kv-root"));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let allocator = allocator.clone();
            handles.push(tokio::spawn(async move { allocator.alloc_id().await.unwrap() }));
        }
        let mut ids = HashSet::new();
        for handle in handles {
            assert!(ids.insert(handle.await.unwrap()));
        }
        assert_eq!(ids.len(), 16);
    }
}
