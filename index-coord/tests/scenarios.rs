//! Integration tests driving the real C2/C3/C5/C6/C7 loops together
//! against the in-memory registry/blob-store fakes, covering admission,
//! reassignment, idempotence, orphan handling, and recycling end to end
//! (S1-S6). A `FakeWorker` stands in for
//! `index-node`: a real tonic server on an ephemeral loopback port whose
//! `CreateIndex` handler commits `Finished` to the registry the same way
//! a real worker does, so `index-coord` never needs to depend on the
//! worker binary to exercise its own assignment/watch/recycle logic.

use index_coord::assign::{self, AssignLoopConfig};
use index_coord::metadata::MetadataTable;
use index_coord::metrics;
use index_coord::node_client::NodeClient;
use index_coord::pool::WorkerPool;
use index_coord::{recycle, watch_meta};
use index_core::allocator::{Allocator, RegistryBackedAllocator};
use index_core::blobstore::memory::InMemoryBlobStore;
use index_core::blobstore::BlobStore;
use index_core::error::ok_status;
use index_core::model::{BuildRequest, TaskState};
use index_core::proto::index_node_server::{IndexNode, IndexNodeServer};
use index_core::proto::{
    ComponentState, CreateIndexRequest, CreateIndexResponse, GetComponentStatesRequest,
    GetComponentStatesResponse, GetMetricsRequest, GetMetricsResponse,
};
use index_core::registry::memory::InMemoryRegistry;
use index_core::registry::Registry;
use index_core::task_store;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

test_r::enable!();

fn req(index_id: u64) -> BuildRequest {
    BuildRequest {
        index_id,
        index_name: "idx".to_string(),
        data_paths: vec!["/a".to_string(), "/b".to_string()],
        type_params: BTreeMap::new(),
        index_params: BTreeMap::new(),
    }
}

/// Stands in for `index-node`: on `CreateIndex`, accepts the dispatch (so
/// the assign loop's RPC succeeds and the record becomes `InProgress`) and,
/// unless `accept_build` has been flipped off, also commits `Finished` to
/// the registry the way a real worker does — `accept_build=false` stands in for a worker that took the
/// build but then vanished before finishing, the mid-build node-loss case
/// in S3. `accept_metrics` drives the same toggle for `GetMetrics`, used by
/// scenario S6.
struct FakeWorker {
    registry: Arc<dyn Registry>,
    meta_root_path: String,
    accept_build: Arc<AtomicBool>,
    accept_metrics: Arc<AtomicBool>,
}

#[tonic::async_trait]
impl IndexNode for FakeWorker {
    async fn create_index(
        &self,
        request: Request<CreateIndexRequest>,
    ) -> Result<Response<CreateIndexResponse>, Status> {
        if !self.accept_build.load(Ordering::SeqCst) {
            return Ok(Response::new(CreateIndexResponse { status: Some(ok_status()) }));
        }
        let req = request.into_inner();
        let registry = self.registry.clone();
        let meta_root_path = self.meta_root_path.clone();
        tokio::spawn(async move {
            let _ = task_store::update_cas(&registry, &meta_root_path, req.index_build_id, 8, move |record| {
                record.state = TaskState::Finished;
                record.index_file_paths = vec![format!("{}/{}/index.bin", req.index_build_id, req.version)];
            })
            .await;
        });
        Ok(Response::new(CreateIndexResponse { status: Some(ok_status()) }))
    }

    async fn get_component_states(
        &self,
        _request: Request<GetComponentStatesRequest>,
    ) -> Result<Response<GetComponentStatesResponse>, Status> {
        Ok(Response::new(GetComponentStatesResponse {
            status: Some(ok_status()),
            state: ComponentState::Healthy as i32,
        }))
    }

    async fn get_metrics(
        &self,
        _request: Request<GetMetricsRequest>,
    ) -> Result<Response<GetMetricsResponse>, Status> {
        if !self.accept_metrics.load(Ordering::SeqCst) {
            return Err(Status::internal("metrics unavailable"));
        }
        Ok(Response::new(GetMetricsResponse {
            status: Some(ok_status()),
            component_name: "fake-worker".to_string(),
            response: "{}".to_string(),
        }))
    }
}

fn free_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("loopback bind always succeeds");
    listener.local_addr().expect("bound listener always has a local addr")
}

/// Starts a fake worker on an ephemeral loopback port, returning its
/// address plus the flags that control whether it accepts `CreateIndex`
/// and `GetMetrics`.
async fn spawn_fake_worker(registry: Arc<dyn Registry>, meta_root_path: String) -> (String, Arc<AtomicBool>, Arc<AtomicBool>) {
    let addr = free_addr();
    let accept_build = Arc::new(AtomicBool::new(true));
    let accept_metrics = Arc::new(AtomicBool::new(true));
    let worker = FakeWorker {
        registry,
        meta_root_path,
        accept_build: accept_build.clone(),
        accept_metrics: accept_metrics.clone(),
    };
    tokio::spawn(async move {
        let _ = tonic::transport::Server::builder()
            .add_service(IndexNodeServer::new(worker))
            .serve(addr)
            .await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    (addr.to_string(), accept_build, accept_metrics)
}

fn assign_config(meta_root_path: &str) -> AssignLoopConfig {
    AssignLoopConfig {
        interval: Duration::from_millis(20),
        req_timeout: Duration::from_secs(2),
        task_limit: 20,
        meta_root_path: meta_root_path.to_string(),
    }
}

async fn wait_until<F, Fut>(mut condition: F, timeout: Duration)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition().await {
        assert!(tokio::time::Instant::now() < deadline, "condition was never satisfied in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn state_of(metadata: &MetadataTable, id: u64) -> Option<index_core::model::TaskRecord> {
    metadata.get_states(&[id]).await[0].clone()
}

/// S1: two admissions with an identical fingerprint resolve to the same
/// `IndexBuildID` and never create a second record.
#[test_r::test]
async fn s1_idempotent_add_reuses_existing_build_id() {
    let registry: Arc<dyn Registry> = Arc::new(InMemoryRegistry::new());
    let metadata = MetadataTable::new(registry.clone(), "meta".to_string());
    let allocator: Arc<dyn Allocator> = Arc::new(RegistryBackedAllocator::new(registry.clone(), "kv"));

    let request = req(7);
    let first_id = match metadata.find_by_fingerprint(&request).await {
        Some(id) => id,
        None => {
            let id = allocator.alloc_id().await.unwrap();
            metadata.add_task(id, request.clone()).await.unwrap();
            id
        }
    };
    let second_id = match metadata.find_by_fingerprint(&request).await {
        Some(id) => id,
        None => panic!("fingerprint from the first admission should already be known"),
    };

    assert_eq!(first_id, second_id);
    assert!(metadata.get_unused_index_files().await.is_empty());
}

/// S2: with one live worker, a submitted task is assigned, the worker
/// commits `Finished`, and the coordinator's watch loop picks that up so
/// both states and file paths become observable.
#[test_r::test]
async fn s2_happy_path_reaches_finished() {
    let registry: Arc<dyn Registry> = Arc::new(InMemoryRegistry::new());
    let meta_root = "meta".to_string();
    let metadata = Arc::new(MetadataTable::new(registry.clone(), meta_root.clone()));
    let pool = Arc::new(WorkerPool::new());

    let (addr, _accept_build, _accept_metrics) = spawn_fake_worker(registry.clone(), meta_root.clone()).await;
    let client = NodeClient::connect(&addr).await.unwrap();
    pool.add_node(1, addr, client, 0).await;

    metadata.add_task(100, req(7)).await.unwrap();

    let cancel = CancellationToken::new();
    // The in-memory registry's watch is a best-effort broadcast: it only
    // sees events published after the subscriber is listening, so the
    // watch loop has to be up before the assign loop can dispatch work.
    let metrics = Arc::new(metrics::register_all());
    let watch_handle = tokio::spawn(watch_meta::run(registry.clone(), metadata.clone(), pool.clone(), meta_root.clone(), metrics.clone(), cancel.clone()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    let assign_handle = tokio::spawn(assign::run(metadata.clone(), pool.clone(), assign_config(&meta_root), metrics.clone(), cancel.clone()));

    wait_until(
        || async { state_of(&metadata, 100).await.map(|r| r.state == TaskState::Finished).unwrap_or(false) },
        Duration::from_secs(3),
    )
    .await;

    cancel.cancel();
    let _ = tokio::join!(assign_handle, watch_handle);

    let paths = metadata.get_file_paths(100).await.unwrap();
    assert_eq!(paths, vec!["100/1/index.bin".to_string()]);
}

/// S3: a task assigned to a node that then leaves the pool is picked up
/// again on a later tick and reassigned to a different node with a
/// strictly greater version.
#[test_r::test]
async fn s3_node_loss_reassigns_with_greater_version() {
    let registry: Arc<dyn Registry> = Arc::new(InMemoryRegistry::new());
    let meta_root = "meta".to_string();
    let metadata = Arc::new(MetadataTable::new(registry.clone(), meta_root.clone()));
    let pool = Arc::new(WorkerPool::new());

    // Node 1 accepts the `CreateIndex` dispatch (so the record reaches
    // `InProgress`) but never commits a result, standing in for a worker
    // that disappears mid-build.
    let (addr1, accept_build1, _accept_metrics1) = spawn_fake_worker(registry.clone(), meta_root.clone()).await;
    accept_build1.store(false, Ordering::SeqCst);
    let client1 = NodeClient::connect(&addr1).await.unwrap();
    pool.add_node(1, addr1, client1, 0).await;

    metadata.add_task(200, req(9)).await.unwrap();

    let cancel = CancellationToken::new();
    let metrics = Arc::new(metrics::register_all());
    let assign_handle = tokio::spawn(assign::run(metadata.clone(), pool.clone(), assign_config(&meta_root), metrics.clone(), cancel.clone()));

    wait_until(
        || async { state_of(&metadata, 200).await.map(|r| r.state == TaskState::InProgress && r.node_id == 1).unwrap_or(false) },
        Duration::from_secs(3),
    )
    .await;
    let version_before = state_of(&metadata, 200).await.unwrap().version;
    assert_eq!(version_before, 1);

    pool.remove_node(1).await;

    let (addr2, _accept_build2, _accept_metrics2) = spawn_fake_worker(registry.clone(), meta_root.clone()).await;
    let client2 = NodeClient::connect(&addr2).await.unwrap();
    pool.add_node(2, addr2, client2, 0).await;

    wait_until(
        || async { state_of(&metadata, 200).await.map(|r| r.node_id == 2 && r.version > version_before).unwrap_or(false) },
        Duration::from_secs(3),
    )
    .await;

    cancel.cancel();
    let _ = assign_handle.await;

    let record = state_of(&metadata, 200).await.unwrap();
    assert_eq!(record.node_id, 2);
    assert!(record.version > version_before);
}

/// S4: dropping an index while its only build is `InProgress` marks it
/// deleted; the recycle loop reclaims its blobs and deletes the record
/// entirely.
#[test_r::test]
async fn s4_drop_mid_build_is_recycled_away() {
    let registry: Arc<dyn Registry> = Arc::new(InMemoryRegistry::new());
    let blob_store = Arc::new(InMemoryBlobStore::new());
    let meta_root = "meta".to_string();
    let metadata = Arc::new(MetadataTable::new(registry.clone(), meta_root.clone()));

    metadata.add_task(300, req(11)).await.unwrap();
    metadata.assign_task(300, 1).await.unwrap();
    blob_store.put("300/1/index.bin", vec![1, 2, 3]).await.unwrap();

    metadata.mark_deleted(11).await.unwrap();

    let cancel = CancellationToken::new();
    let blob_store_dyn: Arc<dyn BlobStore> = blob_store.clone();
    let handle = tokio::spawn(recycle::run(metadata.clone(), blob_store_dyn, Duration::from_millis(20), 20, cancel.clone()));

    wait_until(|| async { state_of(&metadata, 300).await.is_none() }, Duration::from_secs(3)).await;

    cancel.cancel();
    let _ = handle.await;

    assert!(state_of(&metadata, 300).await.is_none());
    assert!(blob_store.keys_with_prefix("300/").is_empty());
}

/// S5: once a task has been reassigned twice (reaching version 3), the
/// recycle loop reclaims versions 1 and 2's blobs and marks the record
/// recycled, while leaving the current version's blob untouched.
#[test_r::test]
async fn s5_stale_versions_are_recycled_but_current_stays() {
    let registry: Arc<dyn Registry> = Arc::new(InMemoryRegistry::new());
    let blob_store = Arc::new(InMemoryBlobStore::new());
    let meta_root = "meta".to_string();
    let metadata = Arc::new(MetadataTable::new(registry.clone(), meta_root.clone()));

    metadata.add_task(400, req(13)).await.unwrap();
    metadata.assign_task(400, 1).await.unwrap(); // version 1
    metadata.assign_task(400, 1).await.unwrap(); // version 2
    metadata.assign_task(400, 1).await.unwrap(); // version 3

    for version in 1..=3u64 {
        blob_store.put(&format!("400/{version}/index.bin"), vec![version as u8]).await.unwrap();
    }

    task_store::update_cas(&registry, &meta_root, 400, 4, |record| {
        record.state = TaskState::Finished;
        record.index_file_paths = vec!["400/3/index.bin".to_string()];
    })
    .await
    .unwrap();
    metadata.load_from_registry().await.unwrap();

    let cancel = CancellationToken::new();
    let blob_store_dyn: Arc<dyn BlobStore> = blob_store.clone();
    let handle = tokio::spawn(recycle::run(metadata.clone(), blob_store_dyn, Duration::from_millis(20), 20, cancel.clone()));

    wait_until(
        || async { state_of(&metadata, 400).await.map(|r| r.recycled).unwrap_or(false) },
        Duration::from_secs(3),
    )
    .await;

    cancel.cancel();
    let _ = handle.await;

    assert!(blob_store.keys_with_prefix("400/1").is_empty());
    assert!(blob_store.keys_with_prefix("400/2").is_empty());
    assert_eq!(blob_store.keys_with_prefix("400/3").len(), 1);

    let record = state_of(&metadata, 400).await.unwrap();
    assert!(record.recycled);
    assert!(!record.mark_deleted);
}

/// S6: `GetMetrics` fan-out folds a single unreachable worker's error
/// into its own entry instead of failing the whole call.
#[test_r::test]
async fn s6_metrics_fan_out_survives_one_bad_worker() {
    let registry: Arc<dyn Registry> = Arc::new(InMemoryRegistry::new());
    let meta_root = "meta".to_string();
    let pool = WorkerPool::new();

    let (good_addr, _good_build, _good_metrics) = spawn_fake_worker(registry.clone(), meta_root.clone()).await;
    let good_client = NodeClient::connect(&good_addr).await.unwrap();
    pool.add_node(1, good_addr, good_client, 0).await;

    let (bad_addr, _bad_build, bad_metrics) = spawn_fake_worker(registry.clone(), meta_root.clone()).await;
    bad_metrics.store(false, Ordering::SeqCst);
    let bad_client = NodeClient::connect(&bad_addr).await.unwrap();
    pool.add_node(2, bad_addr, bad_client, 0).await;

    let results = pool.fan_out_metrics().await;
    assert_eq!(results.len(), 2);

    let good = results.iter().find(|(info, _)| info.node_id == 1).unwrap();
    assert!(good.1.is_ok());

    let bad = results.iter().find(|(info, _)| info.node_id == 2).unwrap();
    assert!(bad.1.is_err());
}
