//! Shared domain model, wire types, and infrastructure clients for the
//! index-build coordination core: the durable task record, the error
//! taxonomy, registry/blob-store/allocator client traits, and the config
//! and tracing bootstrap shared by the coordinator and worker binaries.

pub mod allocator;
pub mod blobstore;
pub mod config;
pub mod error;
pub mod model;
pub mod registry;
pub mod task_store;
pub mod tracing_init;

pub mod proto {
    tonic::include_proto!("index.v1");
}

#[cfg(test)]
test_r::enable!();
