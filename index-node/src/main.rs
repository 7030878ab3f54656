use index_core::config::node_config_loader;
use index_core::tracing_init::{init_tracing_with_default_env_filter, TracingFormat};
use index_node::node::WorkerNode;
use index_node::{metrics, server};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::select;
use tracing::error;

fn main() -> Result<(), std::io::Error> {
    let config = node_config_loader()
        .load()
        .map_err(|e| std::io::Error::other(format!("failed to load config: {e}")))?;

    init_tracing_with_default_env_filter("index-node", TracingFormat::Text);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(config))
}

async fn async_main(config: index_core::config::NodeConfig) -> Result<(), std::io::Error> {
    let grpc_addr: SocketAddr = config
        .address
        .parse()
        .map_err(|e| std::io::Error::other(format!("invalid address: {e}")))?;
    let metrics_addr: SocketAddr = "0.0.0.0:9092"
        .parse()
        .expect("static address is always valid");

    let metrics = Arc::new(metrics::register_all());

    let node = WorkerNode::init(config, metrics.clone()).await.map_err(|e| {
        error!("worker init failed: {e}");
        std::io::Error::other(e.to_string())
    })?;

    let grpc = tokio::spawn(server::run_grpc_server(grpc_addr, node.clone()));
    let http = tokio::spawn(server::run_metrics_server(metrics_addr, metrics.registry.clone()));

    select! {
        result = grpc => {
            if let Ok(Err(err)) = result {
                error!(%err, "gRPC server exited with an error");
            }
        }
        result = http => {
            if let Ok(Err(err)) = result {
                error!(%err, "metrics server exited with an error");
            }
        }
    }

    Ok(())
}
