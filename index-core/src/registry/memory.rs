use super::{KeyValue, Registry, RegistryError, Revision, SessionEvent, WatchEvent};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

struct Entry {
    value: Vec<u8>,
    revision: Revision,
}

/// In-process `Registry` fake used by unit and scenario tests.
/// Not a backend choice for production use — it holds everything in a
/// `Mutex<BTreeMap>` with no durability and a best-effort broadcast-based
/// watch.
pub struct InMemoryRegistry {
    entries: Mutex<BTreeMap<String, Entry>>,
    next_revision: Mutex<Revision>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            entries: Mutex::new(BTreeMap::new()),
            next_revision: Mutex::new(1),
            events,
        }
    }
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump_revision(&self) -> Revision {
        let mut next = self.next_revision.lock().unwrap();
        let revision = *next;
        *next += 1;
        revision
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, RegistryError> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.get(key).map(|e| KeyValue {
            key: key.to_string(),
            value: e.value.clone(),
            revision: e.revision,
        }))
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, RegistryError> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| KeyValue {
                key: k.clone(),
                value: e.value.clone(),
                revision: e.revision,
            })
            .collect())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<Revision, RegistryError> {
        let revision = self.bump_revision();
        {
            let mut entries = self.entries.lock().unwrap();
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_vec(),
                    revision,
                },
            );
        }
        let _ = self.events.send(WatchEvent::Put(KeyValue {
            key: key.to_string(),
            value: value.to_vec(),
            revision,
        }));
        Ok(revision)
    }

    async fn put_cas(
        &self,
        key: &str,
        value: &[u8],
        expected_revision: Revision,
    ) -> Result<Revision, RegistryError> {
        let revision = {
            let mut entries = self.entries.lock().unwrap();
            let current = entries.get(key).map(|e| e.revision).unwrap_or(0);
            if current != expected_revision {
                return Err(RegistryError::CasConflict(key.to_string()));
            }
            let revision = {
                let mut next = self.next_revision.lock().unwrap();
                let r = *next;
                *next += 1;
                r
            };
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_vec(),
                    revision,
                },
            );
            revision
        };
        let _ = self.events.send(WatchEvent::Put(KeyValue {
            key: key.to_string(),
            value: value.to_vec(),
            revision,
        }));
        Ok(revision)
    }

    async fn delete(&self, key: &str) -> Result<(), RegistryError> {
        {
            let mut entries = self.entries.lock().unwrap();
            entries.remove(key);
        }
        let _ = self.events.send(WatchEvent::Delete {
            key: key.to_string(),
        });
        Ok(())
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        _start_revision: Revision,
    ) -> Result<BoxStream<'static, WatchEvent>, RegistryError> {
        let prefix = prefix.to_string();
        let stream = BroadcastStream::new(self.events.subscribe())
            .filter_map(|res| res.ok())
            .filter(move |event| match event {
                WatchEvent::Put(kv) => kv.key.starts_with(&prefix),
                WatchEvent::Delete { key } => key.starts_with(&prefix),
            });
        Ok(Box::pin(stream))
    }

    async fn register_session(
        &self,
        prefix: &str,
        node_id: u64,
        address: &str,
    ) -> Result<(), RegistryError> {
        self.put(&format!("{prefix}/{node_id}"), address.as_bytes())
            .await?;
        Ok(())
    }

    async fn snapshot_sessions(
        &self,
        prefix: &str,
    ) -> Result<(Vec<(u64, String)>, Revision), RegistryError> {
        let entries = self.list_prefix(prefix).await?;
        let revision = entries.iter().map(|kv| kv.revision).max().unwrap_or(0);
        let parsed = entries
            .into_iter()
            .filter_map(|kv| {
                let node_id: u64 = kv.key.rsplit('/').next()?.parse().ok()?;
                Some((node_id, String::from_utf8_lossy(&kv.value).into_owned()))
            })
            .collect();
        Ok((parsed, revision))
    }

    async fn watch_sessions(
        &self,
        prefix: &str,
        start_revision: Revision,
    ) -> Result<BoxStream<'static, SessionEvent>, RegistryError> {
        let inner = self.watch_prefix(prefix, start_revision).await?;
        Ok(Box::pin(inner.filter_map(|event| match event {
            WatchEvent::Put(kv) => kv
                .key
                .rsplit('/')
                .next()
                .and_then(|s| s.parse().ok())
                .map(|node_id| SessionEvent::Add { node_id }),
            WatchEvent::Delete { key } => key
                .rsplit('/')
                .next()
                .and_then(|s| s.parse().ok())
                .map(|node_id| SessionEvent::Del { node_id }),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_cas_rejects_stale_revision() {
        let registry = InMemoryRegistry::new();
        let rev = registry.put("k", b"v1").await.unwrap();
        assert!(registry.put_cas("k", b"v2", rev - 1).await.is_err());
        let rev2 = registry.put_cas("k", b"v2", rev).await.unwrap();
        assert!(rev2 > rev);
        assert_eq!(registry.get("k").await.unwrap().unwrap().value, b"v2");
    }

    #[tokio::test]
    async fn list_prefix_only_returns_matching_keys() {
        let registry = InMemoryRegistry::new();
        registry.put("indexes/1", b"a").await.unwrap();
        registry.put("indexes/2", b"b").await.unwrap();
        registry.put("other/1", b"c").await.unwrap();
        let found = registry.list_prefix("indexes/").await.unwrap();
        assert_eq!(found.len(), 2);
    }
}
