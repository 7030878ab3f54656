//! Binds and runs the gRPC service and the metrics HTTP endpoint, the
//! same shape as `index-coord`'s `server.rs`.

use crate::grpcapi::IndexNodeApi;
use crate::node::WorkerNode;
use index_core::proto::index_node_server::IndexNodeServer;
use poem::endpoint::PrometheusExporter;
use poem::listener::TcpListener;
use prometheus::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use tonic::codec::CompressionEncoding;
use tracing::info;

pub async fn run_grpc_server(addr: SocketAddr, node: Arc<WorkerNode>) -> Result<(), tonic::transport::Error> {
    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter.set_serving::<IndexNodeServer<IndexNodeApi>>().await;

    info!(%addr, "starting index-node gRPC server");

    tonic::transport::Server::builder()
        .add_service(health_service)
        .add_service(
            IndexNodeServer::new(IndexNodeApi::new(node))
                .send_compressed(CompressionEncoding::Gzip)
                .accept_compressed(CompressionEncoding::Gzip),
        )
        .serve(addr)
        .await
}

pub async fn run_metrics_server(addr: SocketAddr, registry: Registry) -> Result<(), std::io::Error> {
    info!(%addr, "starting index-node metrics server");
    let app = PrometheusExporter::new(registry);
    poem::Server::new(TcpListener::bind(addr)).run(app).await
}
