//! C8: the gRPC API surface. Every response
//! carries a `(ErrorCode, Reason)` status pair instead of a transport
//! error for business failures.

use crate::coordinator::{Coordinator, HealthState};
use index_core::error::{ok_status, status, CoordinatorError, ErrorCode, SafeDisplay};
use index_core::model::BuildRequest;
use index_core::proto::index_coord_server::IndexCoord;
use index_core::proto::{
    BuildIndexRequest, BuildIndexResponse, ComponentState, DropIndexRequest, DropIndexResponse,
    GetComponentStatesRequest, GetComponentStatesResponse, GetIndexFilePathsRequest,
    GetIndexFilePathsResponse, GetIndexStatesRequest, GetIndexStatesResponse, GetMetricsRequest,
    GetMetricsResponse, IndexFilePathInfo, IndexStateInfo, NodeInfo as ProtoNodeInfo, SystemInfo,
};
use std::sync::Arc;
use tonic::{Request, Response, Status as TonicStatus};

pub struct IndexCoordApi {
    coordinator: Arc<Coordinator>,
}

impl IndexCoordApi {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    fn check_healthy(&self) -> Result<(), CoordinatorError> {
        if self.coordinator.health_state() != HealthState::Healthy {
            return Err(CoordinatorError::Unhealthy);
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl IndexCoord for IndexCoordApi {
    async fn build_index(
        &self,
        request: Request<BuildIndexRequest>,
    ) -> Result<Response<BuildIndexResponse>, TonicStatus> {
        if let Err(err) = self.check_healthy() {
            return Ok(Response::new(BuildIndexResponse {
                status: Some(err.into_status()),
                index_build_id: 0,
            }));
        }

        let req: BuildRequest = request.into_inner().into();
        match self.coordinator.scheduler.submit(req).await {
            Ok(index_build_id) => Ok(Response::new(BuildIndexResponse {
                status: Some(ok_status()),
                index_build_id,
            })),
            Err(err) => Ok(Response::new(BuildIndexResponse {
                status: Some(status(err.code(), err.to_safe_string())),
                index_build_id: 0,
            })),
        }
    }

    async fn get_index_states(
        &self,
        request: Request<GetIndexStatesRequest>,
    ) -> Result<Response<GetIndexStatesResponse>, TonicStatus> {
        if let Err(err) = self.check_healthy() {
            return Ok(Response::new(GetIndexStatesResponse {
                status: Some(err.into_status()),
                states: Vec::new(),
            }));
        }

        let ids = request.into_inner().index_build_ids;
        let records = self.coordinator.metadata.get_states(&ids).await;
        let states = ids
            .iter()
            .zip(records.iter())
            .map(|(id, record)| match record {
                Some(record) => IndexStateInfo::from(record),
                None => IndexStateInfo {
                    index_build_id: *id,
                    state: index_core::proto::IndexState::None as i32,
                    fail_reason: "task not found".to_string(),
                },
            })
            .collect();

        Ok(Response::new(GetIndexStatesResponse {
            status: Some(ok_status()),
            states,
        }))
    }

    async fn get_index_file_paths(
        &self,
        request: Request<GetIndexFilePathsRequest>,
    ) -> Result<Response<GetIndexFilePathsResponse>, TonicStatus> {
        if let Err(err) = self.check_healthy() {
            return Ok(Response::new(GetIndexFilePathsResponse {
                status: Some(err.into_status()),
                file_paths: Vec::new(),
            }));
        }

        let ids = request.into_inner().index_build_ids;
        let mut file_paths = Vec::with_capacity(ids.len());
        for id in ids {
            match self.coordinator.metadata.get_file_paths(id).await {
                Some(paths) => file_paths.push(IndexFilePathInfo {
                    index_build_id: id,
                    index_file_paths: paths,
                }),
                None => {
                    return Ok(Response::new(GetIndexFilePathsResponse {
                        status: Some(status(
                            ErrorCode::NotFinished,
                            format!("task {id} has not finished building"),
                        )),
                        file_paths: Vec::new(),
                    }));
                }
            }
        }

        Ok(Response::new(GetIndexFilePathsResponse {
            status: Some(ok_status()),
            file_paths,
        }))
    }

    async fn drop_index(
        &self,
        request: Request<DropIndexRequest>,
    ) -> Result<Response<DropIndexResponse>, TonicStatus> {
        if let Err(err) = self.check_healthy() {
            return Ok(Response::new(DropIndexResponse {
                status: Some(err.into_status()),
            }));
        }

        let index_id = request.into_inner().index_id;
        match self.coordinator.metadata.mark_deleted(index_id).await {
            Ok(()) => Ok(Response::new(DropIndexResponse {
                status: Some(ok_status()),
            })),
            Err(err) => Ok(Response::new(DropIndexResponse {
                status: Some(status(err.code(), err.to_safe_string())),
            })),
        }
    }

    async fn get_component_states(
        &self,
        _request: Request<GetComponentStatesRequest>,
    ) -> Result<Response<GetComponentStatesResponse>, TonicStatus> {
        let state = match self.coordinator.health_state() {
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
        if let Err(err) = self.check_healthy() {
            return Ok(Response::new(GetMetricsResponse {
                status: Some(err.into_status()),
                component_name: "index-coord".to_string(),
                response: String::new(),
            }));
        }

        let metric_type = request.into_inner().metric_type;
        if metric_type != "system_info" {
            return Ok(Response::new(GetMetricsResponse {
                status: Some(status(
                    ErrorCode::UnexpectedError,
                    format!("unknown metric type: {metric_type}"),
                )),
                component_name: "index-coord".to_string(),
                response: String::new(),
            }));
        }

        let results = self.coordinator.pool.fan_out_metrics().await;
        let nodes = results
            .into_iter()
            .map(|(node, result)| {
                let (has_error, error_reason) = match &result {
                    Ok(_) => (false, String::new()),
                    Err(reason) => (true, reason.clone()),
                };
                ProtoNodeInfo {
                    node_id: node.node_id,
                    address: node.address,
                    priority: node.priority,
                    has_error,
                    error_reason,
                }
            })
            .collect();

        let system_info = SystemInfo {
            self_node_id: 0,
            self_address: self.coordinator.address.clone(),
            nodes,
        };

        Ok(Response::new(GetMetricsResponse {
            status: Some(ok_status()),
            component_name: "index-coord".to_string(),
            response: serde_json::to_string(&SystemInfoJson::from(&system_info)).unwrap_or_default(),
        }))
    }
}

/// `SystemInfo` reduced to a plain serde-friendly shape for the
/// JSON-encoded `GetMetricsResponse.response` document.
#[derive(serde::Serialize)]
struct SystemInfoJson {
    self_node_id: u64,
    self_address: String,
    nodes: Vec<NodeInfoJson>,
}

#[derive(serde::Serialize)]
struct NodeInfoJson {
    node_id: u64,
    address: String,
    priority: i64,
    has_error: bool,
    error_reason: String,
}

impl From<&SystemInfo> for SystemInfoJson {
    fn from(value: &SystemInfo) -> Self {
        Self {
            self_node_id: value.self_node_id,
            self_address: value.self_address.clone(),
            nodes: value
                .nodes
                .iter()
                .map(|n| NodeInfoJson {
                    node_id: n.node_id,
                    address: n.address.clone(),
                    priority: n.priority,
                    has_error: n.has_error,
                    error_reason: n.error_reason.clone(),
                })
                .collect(),
        }
    }
}
