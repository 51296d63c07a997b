use crate::record::{AttendanceQuery, AttendanceRecord};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("{backend}: deadline of {after:?} exceeded")]
    Timeout {
        backend: &'static str,
        after: Duration,
    },
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt store: {0}")]
    Corrupt(String),
    #[error("sqlite: {0}")]
    Sqlite(String),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Attendance storage capability.
///
/// Implementations must apply their own hard deadline to every call so a
/// hung store surfaces as an error instead of blocking the caller.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Write one record atomically. Writing a `record_id` that is
    /// already stored succeeds without creating a duplicate.
    async fn insert(&self, record: &AttendanceRecord) -> Result<(), BackendError>;

    /// Records matching `query`, newest `created_at` first.
    async fn query(&self, query: &AttendanceQuery) -> Result<Vec<AttendanceRecord>, BackendError>;

    /// Cheap reachability check.
    async fn health_check(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Run `fut` under a hard deadline, mapping expiry to [`BackendError::Timeout`].
pub async fn with_deadline<T, F>(backend: &'static str, after: Duration, fut: F) -> Result<T, BackendError>
where
    F: Future<Output = Result<T, BackendError>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout { backend, after }),
    }
}
