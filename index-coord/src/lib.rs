//! The index-build coordinator: a singleton
//! that owns durable task metadata, schedules builds onto worker
//! replicas, and reclaims their storage once superseded or dropped.

pub mod assign;
pub mod coordinator;
pub mod grpcapi;
pub mod metadata;
pub mod metrics;
pub mod node_client;
pub mod pool;
pub mod recycle;
pub mod scheduler;
pub mod server;
pub mod watch_meta;
pub mod watch_node;

#[cfg(test)]
test_r::enable!();
