//! Prometheus metrics registration and HTTP exposition, mirroring the
//! teacher's `metrics::register_all()` + `poem::endpoint::PrometheusExporter`
//! pairing (`cloud-component-service/src/server.rs`).

use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};

pub struct Metrics {
    pub registry: Registry,
    pub tasks_assigned_total: IntCounterVec,
    pub tasks_finished_total: IntCounterVec,
    pub live_workers: IntGaugeVec,
}

pub fn register_all() -> Metrics {
    let registry = Registry::new();

    let tasks_assigned_total = IntCounterVec::new(
        Opts::new("index_coord_tasks_assigned_total", "Tasks dispatched to a worker"),
        &["node_id"],
    )
    .expect("metric options are static and valid");
    registry
        .register(Box::new(tasks_assigned_total.clone()))
        .expect("metric name is unique");

    let tasks_finished_total = IntCounterVec::new(
        Opts::new("index_coord_tasks_finished_total", "Tasks observed finishing, by outcome"),
        &["outcome"],
    )
    .expect("metric options are static and valid");
    registry
        .register(Box::new(tasks_finished_total.clone()))
        .expect("metric name is unique");

    let live_workers = IntGaugeVec::new(
        Opts::new("index_coord_live_workers", "Currently registered worker count"),
        &["cluster"],
    )
    .expect("metric options are static and valid");
    registry
        .register(Box::new(live_workers.clone()))
        .expect("metric name is unique");

    let _ = registry.register(Box::new(prometheus::process_collector::ProcessCollector::for_self()));

    Metrics {
        registry,
        tasks_assigned_total,
        tasks_finished_total,
        live_workers,
    }
}
