//! The worker's lifecycle: `init` connects the registry and blob store and
//! registers this node's session, only then flipping health to `Healthy`
//! (mirrors `index-coord`'s `Coordinator::init`, the same init-ordering
//! pattern applied to the worker tier).

use crate::metrics::Metrics;
use crate::worker::{BuildSlot, IndexBuildAction, PlaceholderIndexBuildAction};
use index_core::blobstore::s3::S3BlobStore;
use index_core::blobstore::BlobStore;
use index_core::config::NodeConfig;
use index_core::registry::etcd::EtcdRegistry;
use index_core::registry::Registry;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Initializing,
    Healthy,
    Abnormal,
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("registry unreachable: {0}")]
    Registry(#[from] index_core::registry::RegistryError),
    #[error("blob store unreachable: {0}")]
    BlobStore(#[from] index_core::blobstore::BlobStoreError),
}

const NODE_DISCOVERY_PREFIX: &str = "IndexNode";

pub struct WorkerNode {
    pub node_id: u64,
    pub address: String,
    pub registry: Arc<dyn Registry>,
    pub meta_root_path: String,
    pub action: Arc<dyn IndexBuildAction>,
    pub build_slot: Arc<BuildSlot>,
    pub metrics: Arc<Metrics>,
    health: AtomicU8,
}

impl WorkerNode {
    pub async fn init(config: NodeConfig, metrics: Arc<Metrics>) -> Result<Arc<Self>, InitError> {
        let registry: Arc<dyn Registry> = Arc::new(
            EtcdRegistry::connect(
                &config.infra.etcd_endpoints,
                config.infra.registry_init_retries,
                std::time::Duration::from_secs(1),
                std::time::Duration::from_secs(10),
            )
            .await?,
        );

        let blob_store: Arc<dyn BlobStore> = Arc::new(
            S3BlobStore::connect(
                &config.infra.minio_address,
                &config.infra.minio_access_key_id,
                &config.infra.minio_secret_access_key,
                config.infra.minio_use_ssl,
                config.infra.minio_bucket_name.clone(),
            )
            .await?,
        );

        registry
            .register_session(NODE_DISCOVERY_PREFIX, config.node_id, &config.address)
            .await?;

        let node = Arc::new(Self {
            node_id: config.node_id,
            address: config.address.clone(),
            registry,
            meta_root_path: config.infra.meta_root_path.clone(),
            action: Arc::new(PlaceholderIndexBuildAction::new(blob_store)),
            build_slot: Arc::new(BuildSlot::new()),
            metrics,
            health: AtomicU8::new(HealthState::Initializing as u8),
        });

        node.health.store(HealthState::Healthy as u8, Ordering::SeqCst);
        info!(node_id = config.node_id, address = %config.address, "worker node initialized");
        Ok(node)
    }

    pub fn health_state(&self) -> HealthState {
        match self.health.load(Ordering::SeqCst) {
            0 => HealthState::Initializing,
            1 => HealthState::Healthy,
            _ => HealthState::Abnormal,
        }
    }
}
