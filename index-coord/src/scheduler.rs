//! C4: the admission queue. Bridges the synchronous `BuildIndex` RPC to
//! the asynchronous assign loop (C5) via a bounded channel, enforcing
//! idempotence-by-fingerprint and a wait-timeout before giving up.

use crate::metadata::MetadataTable;
use index_core::allocator::Allocator;
use index_core::error::SchedulerError;
use index_core::model::BuildRequest;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::info;

/// A task admitted into the metadata table, handed to the assign loop for
/// actual worker dispatch.
#[derive(Debug, Clone)]
pub struct AdmittedTask {
    pub index_build_id: u64,
}

pub struct Scheduler {
    metadata: Arc<MetadataTable>,
    allocator: Arc<dyn Allocator>,
    sender: mpsc::Sender<AdmittedTask>,
    req_timeout: Duration,
    closed: AtomicBool,
    /// Serializes fingerprint-check + id-allocation + persist so two
    /// concurrent `submit()` calls for an identical fingerprint cannot both
    /// observe "not found" and mint distinct ids — admission handlers run
    /// one per in-flight `BuildIndex` RPC (spec §5), so without this the
    /// dedup-by-fingerprint guarantee (invariant §3.1, scenario S1) would
    /// only hold for sequential callers.
    admission_lock: Mutex<()>,
}

impl Scheduler {
    pub fn new(
        metadata: Arc<MetadataTable>,
        allocator: Arc<dyn Allocator>,
        capacity: usize,
        req_timeout: Duration,
    ) -> (Self, mpsc::Receiver<AdmittedTask>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (
            Self {
                metadata,
                allocator,
                sender,
                req_timeout,
                closed: AtomicBool::new(false),
                admission_lock: Mutex::new(()),
            },
            receiver,
        )
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Admits `req`, returning the (possibly pre-existing, per
    /// idempotence) `IndexBuildID`. Blocks the caller for up to
    /// `req_timeout` waiting for queue space before returning
    /// `EnqueueTimeout`.
    pub async fn submit(&self, req: BuildRequest) -> Result<u64, SchedulerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SchedulerError::Cancelled);
        }

        // The whole check-allocate-persist sequence has to run under one
        // lock: two callers racing past an unlocked `find_by_fingerprint`
        // could both see "not found" and each mint their own id, leaving
        // two records for the same fingerprint.
        let guard = self.admission_lock.lock().await;
        if let Some(existing) = self.metadata.find_by_fingerprint(&req).await {
            info!(index_build_id = existing, "admission deduplicated by fingerprint");
            return Ok(existing);
        }

        let index_build_id = self.allocator.alloc_id().await?;
        self.metadata.add_task(index_build_id, req).await?;
        drop(guard);

        match timeout(
            self.req_timeout,
            self.sender.send(AdmittedTask { index_build_id }),
        )
        .await
        {
            Ok(Ok(())) => Ok(index_build_id),
            Ok(Err(_)) => Err(SchedulerError::Cancelled),
            Err(_) => Err(SchedulerError::EnqueueTimeout(self.req_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use index_core::allocator::RegistryBackedAllocator;
    use index_core::registry::memory::InMemoryRegistry;
    use index_core::registry::Registry;
    use std::collections::BTreeMap;

    fn req(index_id: u64) -> BuildRequest {
        BuildRequest {
            index_id,
            index_name: "idx".to_string(),
            data_paths: vec!["/a".to_string()],
            type_params: BTreeMap::new(),
            index_params: BTreeMap::new(),
        }
    }

    fn scheduler(capacity: usize) -> (Scheduler, mpsc::Receiver<AdmittedTask>) {
        let registry: Arc<dyn Registry> = Arc::new(InMemoryRegistry::new());
        let metadata = Arc::new(MetadataTable::new(registry.clone(), "meta".to_string()));
        let allocator: Arc<dyn Allocator> = Arc::new(RegistryBackedAllocator::new(registry, "kv"));
        Scheduler::new(metadata, allocator, capacity, Duration::from_millis(50))
    }

    #[tokio::test]
    async fn duplicate_submission_returns_the_same_id() {
        let (scheduler, mut rx) = scheduler(4);
        let first = scheduler.submit(req(1)).await.unwrap();
        let second = scheduler.submit(req(1)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(rx.recv().await.unwrap().index_build_id, first);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn concurrent_duplicate_submissions_resolve_to_one_record() {
        let registry: Arc<dyn Registry> = Arc::new(InMemoryRegistry::new());
        let metadata = Arc::new(MetadataTable::new(registry.clone(), "meta".to_string()));
        let allocator: Arc<dyn Allocator> = Arc::new(RegistryBackedAllocator::new(registry.clone(), "kv"));
        let (scheduler, mut rx) = Scheduler::new(metadata, allocator, 4, Duration::from_millis(50));
        let scheduler = Arc::new(scheduler);

        let a = scheduler.clone();
        let b = scheduler.clone();
        let (first, second) = tokio::join!(
            tokio::spawn(async move { a.submit(req(1)).await.unwrap() }),
            tokio::spawn(async move { b.submit(req(1)).await.unwrap() }),
        );
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_eq!(first, second);

        let stored = registry.list_prefix("meta/indexes/").await.unwrap();
        assert_eq!(stored.len(), 1, "exactly one record must exist after the race");

        // Only the winner of the race enqueues a dispatch; the loser
        // returns the winner's id without a second admission.
        assert_eq!(rx.recv().await.unwrap().index_build_id, first);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn submission_times_out_when_queue_is_full_and_undrained() {
        let (scheduler, _rx) = scheduler(1);
        scheduler.submit(req(1)).await.unwrap();
        let result = scheduler.submit(req(2)).await;
        assert!(matches!(result, Err(SchedulerError::EnqueueTimeout(_))));
    }

    #[tokio::test]
    async fn closed_scheduler_rejects_new_submissions() {
        let (scheduler, _rx) = scheduler(4);
        scheduler.close();
        let result = scheduler.submit(req(1)).await;
        assert!(matches!(result, Err(SchedulerError::Cancelled)));
    }
}
