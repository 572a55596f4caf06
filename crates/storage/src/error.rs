//! Storage error types.

use std::time::Duration;
use thiserror::Error;

/// Storage operation errors.
///
/// A confirmed absence is never an error at the trait boundary: `get` and
/// `head` return `None` and `delete` returns
/// [`DeleteOutcome::NotFound`](crate::DeleteOutcome::NotFound). Everything
/// here is either a caller mistake or a transport fault.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("S3 error: {0}")]
    S3(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("HTTP {status} from {operation}: {message}")]
    Http {
        operation: &'static str,
        status: u16,
        message: String,
    },

    #[error("transport error during {operation}: {message}")]
    Transport {
        operation: &'static str,
        message: String,
    },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("unsupported by {backend} backend: {message}")]
    Unsupported {
        backend: &'static str,
        message: String,
    },

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("invalid url signature: {0}")]
    InvalidSignature(String),

    #[error("url expired at {expired_at}")]
    UrlExpired { expired_at: i64 },

    #[error("configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// True for faults of the backend or the network rather than the caller.
    pub fn is_transport(&self) -> bool {
        match self {
            Self::Io(_) | Self::S3(_) | Self::Transport { .. } | Self::Timeout { .. } => true,
            Self::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
