//! Binds and runs the gRPC service and the metrics HTTP endpoint side by
//! side: a tonic gRPC server and a poem HTTP server raced with `select!`.

use crate::coordinator::Coordinator;
use crate::grpcapi::IndexCoordApi;
use index_core::proto::index_coord_server::IndexCoordServer;
use poem::endpoint::PrometheusExporter;
use poem::listener::TcpListener;
use prometheus::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use tonic::codec::CompressionEncoding;
use tracing::info;

pub async fn run_grpc_server(addr: SocketAddr, coordinator: Arc<Coordinator>) -> Result<(), tonic::transport::Error> {
    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<IndexCoordServer<IndexCoordApi>>()
        .await;

    info!(%addr, "starting index-coord gRPC server");

    tonic::transport::Server::builder()
        .add_service(health_service)
        .add_service(
            IndexCoordServer::new(IndexCoordApi::new(coordinator))
                .send_compressed(CompressionEncoding::Gzip)
                .accept_compressed(CompressionEncoding::Gzip),
        )
        .serve(addr)
        .await
}

pub async fn run_metrics_server(addr: SocketAddr, registry: Registry) -> Result<(), std::io::Error> {
    info!(%addr, "starting index-coord metrics server");
    let app = PrometheusExporter::new(registry);
    poem::Server::new(TcpListener::bind(addr)).run(app).await
}
