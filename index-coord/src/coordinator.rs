//! The coordinator's lifecycle: `init` brings every dependency up in order
//! and only then flips health to `Healthy`; `run` spawns the five
//! long-lived loops under a shared cancellation token; `stop` tears them
//! down.

use crate::assign::{self, AssignLoopConfig};
use crate::metadata::MetadataTable;
use crate::metrics::Metrics;
use crate::node_client::NodeClient;
use crate::pool::WorkerPool;
use crate::scheduler::Scheduler;
use crate::{recycle, watch_meta, watch_node};
use index_core::allocator::{Allocator, RegistryBackedAllocator};
use index_core::blobstore::s3::S3BlobStore;
use index_core::blobstore::BlobStore;
use index_core::config::CoordinatorConfig;
use index_core::registry::etcd::EtcdRegistry;
use index_core::registry::Registry;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Initializing,
    Healthy,
    Abnormal,
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("registry unreachable after exhausting retry budget: {0}")]
    Registry(#[from] index_core::registry::RegistryError),
    #[error("blob store unreachable: {0}")]
    BlobStore(#[from] index_core::blobstore::BlobStoreError),
    #[error("metadata load failed: {0}")]
    Metadata(#[from] index_core::error::MetadataError),
}

const NODE_DISCOVERY_PREFIX: &str = "IndexNode";

pub struct Coordinator {
    pub address: String,
    pub metadata: Arc<MetadataTable>,
    pub pool: Arc<WorkerPool>,
    pub scheduler: Arc<Scheduler>,
    config: CoordinatorConfig,
    registry: Arc<dyn Registry>,
    blob_store: Arc<dyn BlobStore>,
    metrics: Arc<Metrics>,
    health: AtomicU8,
    cancel: CancellationToken,
    loops: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    admission_receiver: tokio::sync::Mutex<Option<tokio::sync::mpsc::Receiver<crate::scheduler::AdmittedTask>>>,
}

impl Coordinator {
    /// Connects to the registry, bulk-loads metadata, connects the blob
    /// store and allocator, and seeds the worker pool from the current
    /// node snapshot and in-flight task counts — only after all of this
    /// succeeds does `health_state()` become `Healthy`.
    pub async fn init(config: CoordinatorConfig, metrics: Arc<Metrics>) -> Result<Arc<Self>, InitError> {
        let registry: Arc<dyn Registry> = Arc::new(
            EtcdRegistry::connect(
                &config.infra.etcd_endpoints,
                config.infra.registry_init_retries,
                std::time::Duration::from_secs(1),
                std::time::Duration::from_secs(10),
            )
            .await?,
        );

        let metadata = Arc::new(MetadataTable::new(registry.clone(), config.infra.meta_root_path.clone()));
        metadata.load_from_registry().await?;

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

        let allocator: Arc<dyn Allocator> =
            Arc::new(RegistryBackedAllocator::new(registry.clone(), &config.infra.kv_root_path));

        let pool = Arc::new(WorkerPool::new());
        seed_pool(&registry, &metadata, &pool).await;

        let (scheduler, admission_receiver) = Scheduler::new(
            metadata.clone(),
            allocator,
            config.admission_queue_capacity,
            config.req_timeout_interval.into(),
        );

        let coordinator = Arc::new(Self {
            address: config.address.clone(),
            metadata,
            pool,
            scheduler: Arc::new(scheduler),
            config,
            registry,
            blob_store,
            metrics,
            health: AtomicU8::new(HealthState::Initializing as u8),
            cancel: CancellationToken::new(),
            loops: tokio::sync::Mutex::new(Vec::new()),
            admission_receiver: tokio::sync::Mutex::new(Some(admission_receiver)),
        });

        coordinator.health.store(HealthState::Healthy as u8, Ordering::SeqCst);
        info!("coordinator initialized");
        Ok(coordinator)
    }

    pub fn health_state(&self) -> HealthState {
        match self.health.load(Ordering::SeqCst) {
            0 => HealthState::Initializing,
            1 => HealthState::Healthy,
            _ => HealthState::Abnormal,
        }
    }

    /// Spawns the five long-lived loops. The admission receiver is handed
    /// to a trivial drain task here since actual task-consumption by the
    /// assign loop happens by re-reading `GetUnassignedTasks` each tick
    /// rather than by consuming the channel directly — the channel's only
    /// job is backpressure and completion signaling for `submit`.
    pub async fn run(self: &Arc<Self>) {
        let mut loops = self.loops.lock().await;

        loops.push(tokio::spawn(assign::run(
            self.metadata.clone(),
            self.pool.clone(),
            AssignLoopConfig {
                interval: self.config.assign_task_interval.into(),
                req_timeout: self.config.req_timeout_interval.into(),
                task_limit: self.config.task_limit,
                meta_root_path: self.config.infra.meta_root_path.clone(),
            },
            self.metrics.clone(),
            self.cancel.clone(),
        )));

        loops.push(tokio::spawn(watch_node::run(
            self.registry.clone(),
            self.pool.clone(),
            NODE_DISCOVERY_PREFIX.to_string(),
            self.metrics.clone(),
            self.cancel.clone(),
        )));

        loops.push(tokio::spawn(watch_meta::run(
            self.registry.clone(),
            self.metadata.clone(),
            self.pool.clone(),
            self.config.infra.meta_root_path.clone(),
            self.metrics.clone(),
            self.cancel.clone(),
        )));

        loops.push(tokio::spawn(recycle::run(
            self.metadata.clone(),
            self.blob_store.clone(),
            self.config.recycle_interval.into(),
            self.config.task_limit,
            self.cancel.clone(),
        )));

        if let Some(mut receiver) = self.admission_receiver.lock().await.take() {
            let cancel = self.cancel.clone();
            loops.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        admitted = receiver.recv() => {
                            match admitted {
                                Some(task) => info!(index_build_id = task.index_build_id, "admitted"),
                                None => return,
                            }
                        }
                    }
                }
            }));
        }

        info!("coordinator loops started");
    }

    /// Cancels every loop and waits for them to finish, with a bounded
    /// grace period.
    pub async fn stop(&self) {
        self.scheduler.close();
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self.loops.lock().await.drain(..).collect();
        let grace = tokio::time::timeout(std::time::Duration::from_secs(5), futures::future::join_all(handles)).await;
        if grace.is_err() {
            warn!("coordinator loops did not stop within the grace period");
        }
        info!("coordinator stopped");
    }
}

async fn seed_pool(registry: &Arc<dyn Registry>, metadata: &Arc<MetadataTable>, pool: &Arc<WorkerPool>) {
    let (live, _revision) = match registry.snapshot_sessions(NODE_DISCOVERY_PREFIX).await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            error!(%err, "failed to snapshot live nodes during init");
            return;
        }
    };
    let stats = metadata.get_node_task_stats().await;
    for (node_id, address) in live {
        let priority = stats.get(&node_id).copied().unwrap_or(0);
        let client = NodeClient::connect_lazy(&address);
        pool.add_node(node_id, address, client, priority).await;
    }
}
