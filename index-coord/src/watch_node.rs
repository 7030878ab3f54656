//! C1: the node-watch loop. `SessionAdd` → `AddNode`, `SessionDel` →
//! `RemoveNode`. Adds dial the worker in a background task so a slow or
//! unreachable worker never blocks the event stream.

use crate::metrics::Metrics;
use crate::node_client::NodeClient;
use crate::pool::WorkerPool;
use index_core::registry::{Registry, SessionEvent};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub async fn run(
    registry: Arc<dyn Registry>,
    pool: Arc<WorkerPool>,
    node_discovery_prefix: String,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) {
    let (initial, start_revision) = match registry.snapshot_sessions(&node_discovery_prefix).await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            warn!(%err, "node watch loop failed initial snapshot, coordinator will see no workers");
            return;
        }
    };
    for (node_id, address) in initial {
        spawn_add_node(pool.clone(), node_id, address, metrics.clone());
    }
    report_live_count(&pool, &metrics).await;

    let mut stream = match registry.watch_sessions(&node_discovery_prefix, start_revision).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(%err, "node watch loop failed to start");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("node watch loop stopping");
                return;
            }
            event = futures::StreamExt::next(&mut stream) => {
                let Some(event) = event else {
                    warn!("node session watch stream ended unexpectedly");
                    return;
                };
                match event {
                    SessionEvent::Add { node_id } => {
                        // The session value carries the address; re-read
                        // it via a fresh snapshot rather than threading it
                        // through the event, since etcd watch events for
                        // session keys are keyed, not valued, in our model.
                        if let Ok((live, _)) = registry.snapshot_sessions(&node_discovery_prefix).await {
                            if let Some((_, address)) = live.into_iter().find(|(id, _)| *id == node_id) {
                                spawn_add_node(pool.clone(), node_id, address, metrics.clone());
                            }
                        }
                    }
                    SessionEvent::Del { node_id } => {
                        pool.remove_node(node_id).await;
                        report_live_count(&pool, &metrics).await;
                    }
                }
            }
        }
    }
}

fn spawn_add_node(pool: Arc<WorkerPool>, node_id: u64, address: String, metrics: Arc<Metrics>) {
    tokio::spawn(async move {
        let client = NodeClient::connect_lazy(&address);
        pool.add_node(node_id, address, client, 0).await;
        report_live_count(&pool, &metrics).await;
    });
}

async fn report_live_count(pool: &WorkerPool, metrics: &Metrics) {
    let count = pool.live_node_ids().await.len() as i64;
    metrics.live_workers.with_label_values(&["default"]).set(count);
}
