pub mod s3;

use async_trait::async_trait;
use http::StatusCode;
use thiserror::Error;

use crate::cache::CacheWriter;

/// Capability the cache calls when a requested object is not on disk.
/// Implementations are built per virtual host at boot and never change
/// afterwards.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Streams the object at `path` into `writer`: headers first (exactly
    /// once), then body chunks. Returns the number of body bytes copied.
    async fn read(&self, path: &str, writer: &mut CacheWriter<'_>) -> Result<u64, StorageError>;

    /// Lower-cased names of origin response headers replayed on cache hits.
    fn preserve_headers(&self) -> &[String];
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("origin unreachable: {0}")]
    Unreachable(anyhow::Error),
    #[error("origin returned status {0}")]
    OriginStatus(StatusCode),
    #[error("origin body truncated: {0}")]
    Truncated(anyhow::Error),
    #[error("i/o failure during origin read: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// The HTTP status the adapter should answer with when this fetch
    /// failed before anything was streamed.
    pub fn status(&self) -> StatusCode {
        match self {
            StorageError::Unreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
            StorageError::OriginStatus(status) => *status,
            StorageError::Truncated(_) => StatusCode::REQUEST_TIMEOUT,
            StorageError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
