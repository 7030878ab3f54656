//! C5: the assignment loop. Ticks every `assignTaskInterval`, drains the
//! unassigned/orphaned task set and dispatches each to the least-loaded
//! live worker.

use crate::metadata::MetadataTable;
use crate::metrics::Metrics;
use crate::pool::WorkerPool;
use index_core::proto::{CreateIndexRequest, TypeParams, IndexParams};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct AssignLoopConfig {
    pub interval: Duration,
    pub req_timeout: Duration,
    pub task_limit: usize,
    pub meta_root_path: String,
}

pub async fn run(
    metadata: Arc<MetadataTable>,
    pool: Arc<WorkerPool>,
    config: AssignLoopConfig,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(config.interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("assign loop stopping");
                return;
            }
            _ = ticker.tick() => {
                tick(&metadata, &pool, &config, &metrics).await;
            }
        }
    }
}

async fn tick(metadata: &MetadataTable, pool: &WorkerPool, config: &AssignLoopConfig, metrics: &Metrics) {
    let live_node_ids = pool.live_node_ids().await;
    if live_node_ids.is_empty() {
        return;
    }

    let tasks = metadata.get_unassigned_tasks(&live_node_ids).await;
    for task in tasks.into_iter().take(config.task_limit) {
        let Some(node_id) = pool.peek_client().await else {
            // No worker currently available; stop for this tick, the next
            // one retries.
            break;
        };

        let version = match metadata.update_version(task.index_build_id).await {
            Ok(version) => version,
            Err(err) => {
                warn!(index_build_id = task.index_build_id, %err, "assign CAS failed, retrying next tick");
                continue;
            }
        };

        let Some(client) = pool.node_client(node_id).await else {
            // The worker left the pool between `peek_client` and now; the
            // version bump above stands (a worker RPC failure never
            // decrements it) and the task simply stays `Unissued`, so it
            // is retried next tick.
            continue;
        };

        let request = CreateIndexRequest {
            index_build_id: task.index_build_id,
            index_name: task.req.index_name.clone(),
            index_id: task.req.index_id,
            version,
            meta_path: format!("{}/indexes/{}", config.meta_root_path, task.index_build_id),
            data_paths: task.req.data_paths.clone(),
            type_params: Some(TypeParams {
                params: task.req.type_params.clone(),
            }),
            index_params: Some(IndexParams {
                params: task.req.index_params.clone(),
            }),
        };

        match timeout(config.req_timeout, client.create_index(request)).await {
            Ok(Ok(response)) if response.status.map(|s| s.code).unwrap_or(0) == 0 => {
                // Only now does the record actually become `InProgress` on
                // this node — a failed or timed-out RPC below leaves the
                // task `Unissued` with its bumped version, so it is retried
                // next tick rather than stuck on a worker that never got it.
                if let Err(err) = metadata.build_index(task.index_build_id, node_id).await {
                    warn!(index_build_id = task.index_build_id, %err, "BuildIndex CAS failed after successful dispatch, retrying next tick");
                    continue;
                }
                pool.adjust_priority(node_id, 1).await;
                metrics.tasks_assigned_total.with_label_values(&["default"]).inc();
                info!(index_build_id = task.index_build_id, node_id, version, "assigned");
            }
            Ok(Ok(response)) => {
                warn!(
                    index_build_id = task.index_build_id,
                    node_id,
                    status = ?response.status,
                    "worker rejected CreateIndex, leaving task unassigned"
                );
            }
            Ok(Err(status)) => {
                warn!(index_build_id = task.index_build_id, node_id, %status, "CreateIndex RPC failed, leaving task unassigned");
            }
            Err(_) => {
                warn!(index_build_id = task.index_build_id, node_id, "CreateIndex RPC timed out, leaving task unassigned");
            }
        }
    }
}
