use super::{KeyValue, Registry, RegistryError, Revision, SessionEvent, WatchEvent};
use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, EventType, GetOptions, PutOptions, Txn, TxnOp, WatchOptions,
};
use futures::stream::{BoxStream, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// `Registry` backed by a real etcd cluster. Session keys carry a lease
/// so a crashed worker's entry disappears on its own once the lease
/// expires, without coordinator involvement.
pub struct EtcdRegistry {
    client: Client,
    session_lease_ttl: Duration,
}

impl EtcdRegistry {
    /// Connects to etcd, retrying with a fixed backoff up to `max_retries`
    /// times before giving up as a fatal startup error.
    pub async fn connect(
        endpoints: &[String],
        max_retries: u32,
        retry_delay: Duration,
        session_lease_ttl: Duration,
    ) -> Result<Self, RegistryError> {
        let mut attempt = 0;
        loop {
            match Client::connect(endpoints, None).await {
                Ok(client) => {
                    info!(endpoints = ?endpoints, "connected to etcd registry");
                    return Ok(Self {
                        client,
                        session_lease_ttl,
                    });
                }
                Err(err) if attempt < max_retries => {
                    attempt += 1;
                    warn!(attempt, %err, "etcd connect failed, retrying");
                    tokio::time::sleep(retry_delay).await;
                }
                Err(err) => {
                    return Err(RegistryError::Connect(format!(
                        "giving up after {attempt} retries: {err}"
                    )));
                }
            }
        }
    }
}

#[async_trait]
impl Registry for EtcdRegistry {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, RegistryError> {
        let mut client = self.client.clone();
        let resp = client
            .get(key, None)
            .await
            .map_err(|e| RegistryError::Operation(e.to_string()))?;
        Ok(resp.kvs().first().map(|kv| KeyValue {
            key: key.to_string(),
            value: kv.value().to_vec(),
            revision: kv.mod_revision(),
        }))
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, RegistryError> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| RegistryError::Operation(e.to_string()))?;
        Ok(resp
            .kvs()
            .iter()
            .map(|kv| KeyValue {
                key: String::from_utf8_lossy(kv.key()).into_owned(),
                value: kv.value().to_vec(),
                revision: kv.mod_revision(),
            })
            .collect())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<Revision, RegistryError> {
        let mut client = self.client.clone();
        client
            .put(key, value, None)
            .await
            .map_err(|e| RegistryError::Operation(e.to_string()))?;
        // Read back to obtain the authoritative revision (the put response
        // only carries a cluster-wide header revision in some server
        // versions, so a follow-up get keeps this robust).
        let kv = self
            .get(key)
            .await?
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))?;
        Ok(kv.revision)
    }

    async fn put_cas(
        &self,
        key: &str,
        value: &[u8],
        expected_revision: Revision,
    ) -> Result<Revision, RegistryError> {
        let mut client = self.client.clone();
        let txn = Txn::new()
            .when(vec![Compare::mod_revision(
                key,
                CompareOp::Equal,
                expected_revision,
            )])
            .and_then(vec![TxnOp::put(key, value, Some(PutOptions::new()))]);
        let resp = client
            .txn(txn)
            .await
            .map_err(|e| RegistryError::Operation(e.to_string()))?;
        if !resp.succeeded() {
            return Err(RegistryError::CasConflict(key.to_string()));
        }
        let kv = self
            .get(key)
            .await?
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))?;
        Ok(kv.revision)
    }

    async fn delete(&self, key: &str) -> Result<(), RegistryError> {
        let mut client = self.client.clone();
        client
            .delete(key, None)
            .await
            .map_err(|e| RegistryError::Operation(e.to_string()))?;
        Ok(())
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: Revision,
    ) -> Result<BoxStream<'static, WatchEvent>, RegistryError> {
        let mut client = self.client.clone();
        let mut options = WatchOptions::new().with_prefix();
        if start_revision > 0 {
            options = options.with_start_revision(start_revision);
        }
        let (_watcher, mut stream) = client
            .watch(prefix, Some(options))
            .await
            .map_err(|e| RegistryError::Operation(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            // Keep the watcher handle alive for the task's lifetime.
            let _watcher = _watcher;
            while let Ok(Some(resp)) = stream.message().await {
                for event in resp.events() {
                    let mapped = match event.event_type() {
                        EventType::Put => event.kv().map(|kv| {
                            WatchEvent::Put(KeyValue {
                                key: String::from_utf8_lossy(kv.key()).into_owned(),
                                value: kv.value().to_vec(),
                                revision: kv.mod_revision(),
                            })
                        }),
                        EventType::Delete => event.kv().map(|kv| WatchEvent::Delete {
                            key: String::from_utf8_lossy(kv.key()).into_owned(),
                        }),
                    };
                    if let Some(event) = mapped {
                        if tx.send(event).is_err() {
                            return;
                        }
                    }
                }
            }
            debug!("etcd watch stream for prefix ended");
        });

        Ok(tokio_stream::wrappers::UnboundedReceiverStream::new(rx).boxed())
    }

    async fn register_session(
        &self,
        prefix: &str,
        node_id: u64,
        address: &str,
    ) -> Result<(), RegistryError> {
        let mut client = self.client.clone();
        let lease = client
            .lease_grant(self.session_lease_ttl.as_secs() as i64, None)
            .await
            .map_err(|e| RegistryError::Operation(e.to_string()))?;
        let key = format!("{prefix}/{node_id}");
        client
            .put(
                key,
                address,
                Some(PutOptions::new().with_lease(lease.id())),
            )
            .await
            .map_err(|e| RegistryError::Operation(e.to_string()))?;

        let (mut keeper, mut keep_alive_stream) = client
            .lease_keep_alive(lease.id())
            .await
            .map_err(|e| RegistryError::Operation(e.to_string()))?;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(5)).await;
                if keeper.keep_alive().await.is_err() {
                    return;
                }
                if keep_alive_stream.message().await.is_err() {
                    return;
                }
            }
        });
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
        Ok(inner
            .filter_map(|event| async move {
                match event {
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
                }
            })
            .boxed())
    }
}

