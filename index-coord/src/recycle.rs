//! C7: the recycle loop. Reclaims blob storage for deleted tasks and
//! stale (superseded) versions, advancing metadata only after the
//! corresponding blob operation actually succeeds.

use crate::metadata::MetadataTable;
use index_core::blobstore::BlobStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub async fn run(
    metadata: Arc<MetadataTable>,
    blob_store: Arc<dyn BlobStore>,
    interval: Duration,
    task_limit: usize,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("recycle loop stopping");
                return;
            }
            _ = ticker.tick() => {
                tick(&metadata, blob_store.as_ref(), task_limit).await;
            }
        }
    }
}

async fn tick(metadata: &MetadataTable, blob_store: &dyn BlobStore, task_limit: usize) {
    let records = metadata.get_unused_index_files().await;
    for record in records.into_iter().take(task_limit) {
        if record.mark_deleted {
            match blob_store.remove_with_prefix(&record.index_build_id.to_string()).await {
                Ok(()) => {
                    if let Err(err) = metadata.delete_task(record.index_build_id).await {
                        warn!(index_build_id = record.index_build_id, %err, "failed to delete task record after recycling blobs");
                    } else {
                        info!(index_build_id = record.index_build_id, "task fully recycled and deleted");
                    }
                }
                Err(err) => {
                    warn!(index_build_id = record.index_build_id, %err, "blob recycle failed, retrying next tick");
                }
            }
            continue;
        }

        // Stale versions: every version strictly older than the current
        // one is reclaimable.
        let mut all_succeeded = true;
        for stale_version in 1..record.version {
            let prefix = format!("{}/{}", record.index_build_id, stale_version);
            if let Err(err) = blob_store.remove_with_prefix(&prefix).await {
                warn!(index_build_id = record.index_build_id, stale_version, %err, "blob recycle failed, retrying next tick");
                all_succeeded = false;
                break;
            }
        }
        if all_succeeded {
            if let Err(err) = metadata.mark_recycled(record.index_build_id).await {
                warn!(index_build_id = record.index_build_id, %err, "failed to mark task recycled");
            }
        }
    }
}
