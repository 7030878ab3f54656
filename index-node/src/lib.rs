//! The index-build worker:
//! one `CreateIndex` RPC handler that runs the (opaque) build action,
//! writes blobs through the shared `BlobStore` trait, and commits the
//! result back to the registry under CAS.

pub mod grpcapi;
pub mod metrics;
pub mod node;
pub mod server;
pub mod worker;

#[cfg(test)]
test_r::enable!();
