//! C2: the worker pool. Tracks live workers and their assigned-task load
//! in a priority queue keyed on in-flight task count, and hands out the
//! least-loaded worker for each new assignment.

use crate::node_client::NodeClient;
use index_core::model::NodeInfo;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Clone, Eq, PartialEq)]
struct Entry {
    node_id: u64,
    priority: i64,
}

/// Reverse ordering: `BinaryHeap` is a max-heap, but we always want the
/// *least*-loaded node on top.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.priority.cmp(&self.priority).then(other.node_id.cmp(&self.node_id))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Member {
    address: String,
    client: NodeClient,
    priority: i64,
}

#[derive(Default)]
struct State {
    members: HashMap<u64, Member>,
    heap: BinaryHeap<Entry>,
}

impl State {
    /// Lazily drops heap entries whose recorded priority no longer matches
    /// the member's current priority (a stale decrease/increase), rather
    /// than rebuilding the heap on every update.
    fn peek_live(&mut self) -> Option<u64> {
        while let Some(top) = self.heap.peek().cloned() {
            match self.members.get(&top.node_id) {
                Some(member) if member.priority == top.priority => return Some(top.node_id),
                Some(_) => {
                    self.heap.pop();
                }
                None => {
                    self.heap.pop();
                }
            }
        }
        None
    }
}

pub struct WorkerPool {
    state: Mutex<State>,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerPool {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    /// Duplicate `node_id` is a no-op — both the init-time pool seeding and
    /// the node-watch loop's initial snapshot can observe the same live
    /// node, and the second call must not clobber a priority already
    /// seeded from `GetNodeTaskStats`.
    pub async fn add_node(&self, node_id: u64, address: String, client: NodeClient, initial_priority: i64) {
        let mut state = self.state.lock().await;
        if state.members.contains_key(&node_id) {
            return;
        }
        state.members.insert(
            node_id,
            Member {
                address,
                client,
                priority: initial_priority,
            },
        );
        state.heap.push(Entry {
            node_id,
            priority: initial_priority,
        });
        info!(node_id, "worker joined the pool");
    }

    pub async fn remove_node(&self, node_id: u64) {
        let mut state = self.state.lock().await;
        if state.members.remove(&node_id).is_some() {
            info!(node_id, "worker left the pool");
        }
    }

    pub async fn live_node_ids(&self) -> std::collections::HashSet<u64> {
        self.state.lock().await.members.keys().copied().collect()
    }

    pub async fn node_client(&self, node_id: u64) -> Option<NodeClient> {
        self.state.lock().await.members.get(&node_id).map(|m| m.client.clone())
    }

    /// Returns the least-loaded live worker's id, if any are registered.
    pub async fn peek_client(&self) -> Option<u64> {
        self.state.lock().await.peek_live()
    }

    /// Adjusts `node_id`'s priority by `delta` and re-inserts it into the heap.
    pub async fn adjust_priority(&self, node_id: u64, delta: i64) {
        let mut state = self.state.lock().await;
        if let Some(member) = state.members.get_mut(&node_id) {
            member.priority += delta;
            let priority = member.priority;
            state.heap.push(Entry { node_id, priority });
        }
    }

    /// Metrics fan-out: queries every live worker concurrently
    /// and folds the per-worker errors into the worker's own entry rather
    /// than failing the whole call (scenario S6).
    pub async fn fan_out_metrics(&self) -> Vec<(NodeInfo, Result<String, String>)> {
        let clients: Vec<(u64, String, i64, NodeClient)> = {
            let state = self.state.lock().await;
            state
                .members
                .iter()
                .map(|(id, m)| (*id, m.address.clone(), m.priority, m.client.clone()))
                .collect()
        };

        let futures = clients.into_iter().map(|(node_id, address, priority, client)| async move {
            let result = client
                .get_metrics(index_core::proto::GetMetricsRequest {
                    metric_type: "system_info".to_string(),
                })
                .await
                .map(|resp| resp.response)
                .map_err(|status| status.to_string());
            (
                NodeInfo {
                    node_id,
                    address,
                    priority,
                },
                result,
            )
        });
        futures::future::join_all(futures).await
    }
}

pub type SharedWorkerPool = Arc<WorkerPool>;
