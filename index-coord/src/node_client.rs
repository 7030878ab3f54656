//! Thin wrapper around the generated `IndexNode` gRPC client, the only way
//! the coordinator talks to a worker.

use index_core::proto::index_node_client::IndexNodeClient;
use index_core::proto::{CreateIndexRequest, CreateIndexResponse, GetMetricsRequest, GetMetricsResponse};
use tonic::transport::Channel;
use tonic::Status;

#[derive(Clone)]
pub struct NodeClient {
    inner: IndexNodeClient<Channel>,
}

impl NodeClient {
    pub async fn connect(address: &str) -> Result<Self, tonic::transport::Error> {
        let endpoint = format!("http://{address}");
        let inner = IndexNodeClient::connect(endpoint).await?;
        Ok(Self { inner })
    }

    /// Builds a client against a lazily-connected channel: no I/O happens
    /// until the first RPC. Used both so `WorkerPool::add_node` never
    /// blocks on a slow-to-join worker, and to construct pool-only test
    /// fixtures that never actually drive an RPC.
    pub fn connect_lazy(address: &str) -> Self {
        let endpoint = tonic::transport::Endpoint::from_shared(format!("http://{address}"))
            .expect("address was already validated at registration time");
        Self {
            inner: IndexNodeClient::new(endpoint.connect_lazy()),
        }
    }

    #[cfg(test)]
    pub fn fake_unconnected() -> Self {
        Self::connect_lazy("127.0.0.1:0")
    }

    pub async fn create_index(
        &self,
        request: CreateIndexRequest,
    ) -> Result<CreateIndexResponse, Status> {
        let mut client = self.inner.clone();
        Ok(client.create_index(request).await?.into_inner())
    }

    pub async fn get_metrics(
        &self,
        request: GetMetricsRequest,
    ) -> Result<GetMetricsResponse, Status> {
        let mut client = self.inner.clone();
        Ok(client.get_metrics(request).await?.into_inner())
    }
}
