//! Error taxonomy shared by both binaries.
//!
//! RPC responses never carry a transport-level error for a business
//! failure (unknown id, not finished, unhealthy, conflict, ...) — every
//! response embeds a `Status { code, reason }` pair instead, so that
//! clients can distinguish retryable conditions from terminal ones without
//! inspecting gRPC status codes. `tonic::Status` is reserved for genuine
//! transport faults (the call never reached the server, codec errors).

use crate::proto;

/// Caller-safe error rendering. Internal error enums may wrap driver
/// errors (etcd, S3, tonic) that should not leak verbatim to clients;
/// `to_safe_string` is what actually goes into a `Status.reason`.
pub trait SafeDisplay {
    fn to_safe_string(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Success,
    UnexpectedError,
    Unhealthy,
    NotFound,
    NotFinished,
    EnqueueTimeout,
    Conflict,
}

impl From<ErrorCode> for proto::ErrorCode {
    fn from(value: ErrorCode) -> Self {
        match value {
            ErrorCode::Success => proto::ErrorCode::Success,
            ErrorCode::UnexpectedError => proto::ErrorCode::UnexpectedError,
            ErrorCode::Unhealthy => proto::ErrorCode::Unhealthy,
            ErrorCode::NotFound => proto::ErrorCode::NotFound,
            ErrorCode::NotFinished => proto::ErrorCode::NotFinished,
            ErrorCode::EnqueueTimeout => proto::ErrorCode::EnqueueTimeout,
            ErrorCode::Conflict => proto::ErrorCode::Conflict,
        }
    }
}

pub fn ok_status() -> proto::Status {
    proto::Status {
        code: proto::ErrorCode::Success as i32,
        reason: String::new(),
    }
}

pub fn status(code: ErrorCode, reason: impl Into<String>) -> proto::Status {
    proto::Status {
        code: proto::ErrorCode::from(code) as i32,
        reason: reason.into(),
    }
}

/// Errors raised by the durable metadata table (C3).
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("task {0} already exists")]
    AlreadyExists(u64),
    #[error("task {0} not found")]
    NotFound(u64),
    #[error("task {0} has not finished building")]
    NotFinished(u64),
    #[error("compare-and-swap conflict updating task {0} after {1} retries")]
    Conflict(u64, u32),
    #[error("registry error: {0}")]
    Registry(#[from] crate::registry::RegistryError),
    #[error("corrupt task record for {0}: {1}")]
    Decode(u64, serde_json::Error),
}

impl SafeDisplay for MetadataError {
    fn to_safe_string(&self) -> String {
        match self {
            MetadataError::AlreadyExists(id) => format!("task {id} already exists"),
            MetadataError::NotFound(id) => format!("task {id} not found"),
            MetadataError::NotFinished(id) => format!("task {id} has not finished building"),
            MetadataError::Conflict(id, _) => format!("concurrent update conflict on task {id}"),
            MetadataError::Registry(_) => "metadata registry is unavailable".to_string(),
            MetadataError::Decode(id, _) => format!("corrupt metadata record for task {id}"),
        }
    }
}

impl MetadataError {
    pub fn code(&self) -> ErrorCode {
        match self {
            MetadataError::AlreadyExists(_) => ErrorCode::UnexpectedError,
            MetadataError::NotFound(_) => ErrorCode::NotFound,
            MetadataError::NotFinished(_) => ErrorCode::NotFinished,
            MetadataError::Conflict(..) => ErrorCode::Conflict,
            MetadataError::Registry(_) => ErrorCode::UnexpectedError,
            MetadataError::Decode(..) => ErrorCode::UnexpectedError,
        }
    }
}

/// Errors raised by the admission queue (C4).
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("enqueue timed out after {0:?}")]
    EnqueueTimeout(std::time::Duration),
    #[error("admission queue is shutting down")]
    Cancelled,
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error("allocator error: {0}")]
    Allocator(#[from] crate::allocator::AllocatorError),
}

impl SafeDisplay for SchedulerError {
    fn to_safe_string(&self) -> String {
        match self {
            SchedulerError::EnqueueTimeout(d) => format!("enqueue timed out after {d:?}"),
            SchedulerError::Cancelled => "coordinator is shutting down".to_string(),
            SchedulerError::Metadata(inner) => inner.to_safe_string(),
            SchedulerError::Allocator(_) => "id allocator is unavailable".to_string(),
        }
    }
}

impl SchedulerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SchedulerError::EnqueueTimeout(_) => ErrorCode::EnqueueTimeout,
            SchedulerError::Cancelled => ErrorCode::Unhealthy,
            SchedulerError::Metadata(inner) => inner.code(),
            SchedulerError::Allocator(_) => ErrorCode::UnexpectedError,
        }
    }
}

/// Top-level error surfaced by the gRPC API layer (C8).
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("coordinator is not healthy")]
    Unhealthy,
    #[error("invalid request: {0}")]
    Validation(String),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl SafeDisplay for CoordinatorError {
    fn to_safe_string(&self) -> String {
        match self {
            CoordinatorError::Unhealthy => "coordinator is not healthy".to_string(),
            CoordinatorError::Validation(reason) => reason.clone(),
            CoordinatorError::Metadata(inner) => inner.to_safe_string(),
            CoordinatorError::Scheduler(inner) => inner.to_safe_string(),
        }
    }
}

impl CoordinatorError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CoordinatorError::Unhealthy => ErrorCode::Unhealthy,
            CoordinatorError::Validation(_) => ErrorCode::UnexpectedError,
            CoordinatorError::Metadata(inner) => inner.code(),
            CoordinatorError::Scheduler(inner) => inner.code(),
        }
    }

    pub fn into_status(self) -> proto::Status {
        status(self.code(), self.to_safe_string())
    }
}
