//! Prometheus metrics registration, mirroring `index-coord::metrics`.

use prometheus::{IntCounterVec, IntGauge, Opts, Registry};

pub struct Metrics {
    pub registry: Registry,
    pub builds_total: IntCounterVec,
    pub build_in_progress: IntGauge,
}

pub fn register_all() -> Metrics {
    let registry = Registry::new();

    let builds_total = IntCounterVec::new(
        Opts::new("index_node_builds_total", "Builds handled by this worker, by outcome"),
        &["outcome"],
    )
    .expect("metric options are static and valid");
    registry
        .register(Box::new(builds_total.clone()))
        .expect("metric name is unique");

    let build_in_progress = IntGauge::new(
        "index_node_build_in_progress",
        "1 if this worker currently holds a build, else 0",
    )
    .expect("metric options are static and valid");
    registry
        .register(Box::new(build_in_progress.clone()))
        .expect("metric name is unique");

    let _ = registry.register(Box::new(prometheus::process_collector::ProcessCollector::for_self()));

    Metrics {
        registry,
        builds_total,
        build_in_progress,
    }
}
