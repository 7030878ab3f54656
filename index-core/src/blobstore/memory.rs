use super::{BlobStore, BlobStoreError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// In-process `BlobStore` fake used in tests.
#[derive(Default)]
pub struct InMemoryBlobStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.objects
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), BlobStoreError> {
        self.objects.lock().unwrap().insert(key.to_string(), data);
        Ok(())
    }

    async fn remove_with_prefix(&self, prefix: &str) -> Result<(), BlobStoreError> {
        self.objects
            .lock()
            .unwrap()
            .retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn remove_with_prefix_only_removes_matching_keys() {
        let store = InMemoryBlobStore::new();
        store.put("7/1/a", vec![1]).await.unwrap();
        store.put("7/2/a", vec![2]).await.unwrap();
        store.put("8/1/a", vec![3]).await.unwrap();
        store.remove_with_prefix("7/1").await.unwrap();
        assert_eq!(store.keys_with_prefix("7/").len(), 1);
        assert_eq!(store.keys_with_prefix("8/").len(), 1);
    }
}
