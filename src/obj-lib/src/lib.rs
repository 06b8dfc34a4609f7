mod backend;
mod cache_control;
mod object;
mod range;
mod reader;

pub use backend::*;
pub use cache_control::*;
pub use object::*;
pub use range::*;
pub use reader::*;

use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Granularity of cache data writes and of the tee-fill pipe buffer.
pub const CACHE_BLOCK_SIZE: usize = 1024 * 1024;

/// Object length is not known in advance (e.g. a compressed stream).
pub const SIZE_UNKNOWN: i64 = -1;

/// Sentinel for "no timestamp" in unix-seconds fields.
pub const TIME_SENTINEL: u64 = 0;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("internal error: {0}")]
    Internal(String),
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("bucket not found: {0}")]
    BucketNotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("lock timeout: {0}")]
    LockTimeout(String),
    #[error("backend is unreachable: {0}")]
    BackendDown(String),
    #[error("cache drive offline: {0}")]
    DriveOffline(String),
    #[error("cache drive full: {0}")]
    DriveFull(String),
    #[error("storage full: {0}")]
    StorageFull(String),
    #[error("corrupt cache entry: {0}")]
    Corruption(String),
    #[error("atime not supported: {0}")]
    AtimeUnsupported(String),
    #[error("cache migration in progress: {0}")]
    MigrationInProgress(String),
    #[error("operation cancelled: {0}")]
    Cancelled(String),
    #[error("insufficient read quorum: {0}")]
    InsufficientReadQuorum(String),
    #[error("insufficient write quorum: {0}")]
    InsufficientWriteQuorum(String),
    #[error("not implemented: {0}")]
    NotImplemented(String),
    #[error("I/O error: {0}")]
    IoError(String),
}

impl CacheError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound(_))
    }

    pub fn is_backend_down(&self) -> bool {
        matches!(self, CacheError::BackendDown(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CacheError::Cancelled(_))
    }
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::IoError(err.to_string())
    }
}

/// Streaming object payload. Everything that hands object bytes around uses
/// this boxed form so readers from files, pipes and backends compose.
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

pub type ObjectWriter = Pin<Box<dyn AsyncWrite + Send>>;

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
