//! C6: the metadata watch loop. The only path by which worker completion
//! influences scheduling load — the coordinator never receives a direct
//! completion RPC.

use crate::metadata::MetadataTable;
use crate::metrics::Metrics;
use crate::pool::WorkerPool;
use index_core::model::{TaskRecord, TaskState};
use index_core::registry::{Registry, WatchEvent};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub async fn run(
    registry: Arc<dyn Registry>,
    metadata: Arc<MetadataTable>,
    pool: Arc<WorkerPool>,
    meta_root_path: String,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) {
    let prefix = format!("{meta_root_path}/indexes/");
    let mut stream = match registry.watch_prefix(&prefix, 0).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(%err, "metadata watch loop failed to start, coordinator will not observe worker completions");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("metadata watch loop stopping");
                return;
            }
            event = futures::StreamExt::next(&mut stream) => {
                let Some(event) = event else {
                    warn!("metadata watch stream ended unexpectedly");
                    return;
                };
                handle_event(&metadata, &pool, &metrics, event).await;
            }
        }
    }
}

async fn handle_event(metadata: &MetadataTable, pool: &WorkerPool, metrics: &Metrics, event: WatchEvent) {
    match event {
        WatchEvent::Put(kv) => {
            let new_record = TaskRecord::try_from(kv.value.as_slice()).ok();
            // Only a genuine `-> Finished` transition decrements load;
            // a later PUT (e.g. the recycle loop setting `Recycled`) that
            // leaves the state at `Finished` must not decrement again.
            let previously_finished = match &new_record {
                Some(record) => metadata
                    .get_states(&[record.index_build_id])
                    .await
                    .into_iter()
                    .next()
                    .flatten()
                    .map(|r| r.state == TaskState::Finished)
                    .unwrap_or(false),
                None => false,
            };
            let transitioned_to_finished = new_record
                .as_ref()
                .map(|r| r.state == TaskState::Finished && !previously_finished)
                .unwrap_or(false);
            let node_id = new_record.as_ref().map(|r| r.node_id);
            metadata.apply_watch_event(WatchEvent::Put(kv)).await;
            if transitioned_to_finished {
                if let Some(node_id) = node_id {
                    pool.adjust_priority(node_id, -1).await;
                }
                metrics.tasks_finished_total.with_label_values(&["finished"]).inc();
            }
        }
        WatchEvent::Delete { key } => {
            info!(%key, "task record deleted");
            metadata.apply_watch_event(WatchEvent::Delete { key }).await;
        }
    }
}
