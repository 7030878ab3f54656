//! The worker's gRPC surface: `CreateIndex` plus the same
//! health/metrics RPCs the coordinator exposes.

use crate::node::{HealthState, WorkerNode};
use crate::worker;
use index_core::error::{ok_status, status, ErrorCode};
use index_core::proto::index_node_server::IndexNode;
use index_core::proto::{
    ComponentState, CreateIndexRequest, CreateIndexResponse, GetComponentStatesRequest,
    GetComponentStatesResponse, GetMetricsRequest, GetMetricsResponse,
};
use std::sync::Arc;
use tonic::{Request, Response, Status as TonicStatus};
use tracing::info;

pub struct IndexNodeApi {
    node: Arc<WorkerNode>,
}

impl IndexNodeApi {
    pub fn new(node: Arc<WorkerNode>) -> Self {
        Self { node }
    }
}

#[tonic::async_trait]
impl IndexNode for IndexNodeApi {
    async fn create_index(
        &self,
        request: Request<CreateIndexRequest>,
    ) -> Result<Response<CreateIndexResponse>, TonicStatus> {
        let req = request.into_inner();

        let Some(guard) = self.node.build_slot.try_acquire() else {
            return Ok(Response::new(CreateIndexResponse {
                status: Some(status(ErrorCode::Unhealthy, "worker is already building a task")),
            }));
        };

        info!(
            index_build_id = req.index_build_id,
            version = req.version,
            "accepted build"
        );

        let action = self.node.action.clone();
        let registry = self.node.registry.clone();
        let meta_root_path = self.node.meta_root_path.clone();
        let node_id = self.node.node_id;
        let metrics = self.node.metrics.clone();
        tokio::spawn(async move {
            worker::run_build(action, registry, meta_root_path, req, node_id, metrics, guard).await;
        });

        Ok(Response::new(CreateIndexResponse {
            status: Some(ok_status()),
        }))
    }

    async fn get_component_states(
        &self,
        _request: Request<GetComponentStatesRequest>,
    ) -> Result<Response<GetComponentStatesResponse>, TonicStatus> {
        let state = match self.node.health_state() {
            HealthState::Initializing => ComponentState::Initializing,
            HealthState::Healthy => ComponentState::Healthy,
            HealthState::Abnormal => ComponentState::Abnormal,
        };
        Ok(Response::new(GetComponentStatesResponse {
            status: Some(ok_status()),
            state: state as i32,
        }))
    }

    async fn get_metrics(
        &self,
        request: Request<GetMetricsRequest>,
    ) -> Result<Response<GetMetricsResponse>, TonicStatus> {
        let metric_type = request.into_inner().metric_type;
        if metric_type != "system_info" {
            return Ok(Response::new(GetMetricsResponse {
                status: Some(status(
                    ErrorCode::UnexpectedError,
                    format!("unknown metric type: {metric_type}"),
                )),
                component_name: "index-node".to_string(),
                response: String::new(),
            }));
        }

        let busy = self.node.build_slot.is_busy();
        let body = serde_json::json!({
            "node_id": self.node.node_id,
            "address": self.node.address,
            "busy": busy,
        });

        Ok(Response::new(GetMetricsResponse {
            status: Some(ok_status()),
            component_name: "index-node".to_string(),
            response: body.to_string(),
        }))
    }
}
