//! Facade error types.

use stash_core::ConflictError;
use stash_metadata::MetadataError;
use stash_storage::StorageError;

/// Errors returned by [`FileSystem`](crate::FileSystem) and the garbage
/// collector.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    /// Optimistic-concurrency violation. Re-read and retry.
    #[error(transparent)]
    Conflict(ConflictError),

    /// The caller asked for something the current state cannot satisfy.
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Transport or server fault from the blob store.
    #[error("storage error: {0}")]
    Storage(StorageError),

    /// Stored metadata contradicts itself.
    #[error("metadata invariant violated: {0}")]
    Invariant(String),

    #[error("metadata error: {0}")]
    Metadata(MetadataError),

    #[error("core error: {0}")]
    Core(#[from] stash_core::Error),
}

impl FsError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Conflict(c) => c.code.as_str(),
            Self::Precondition(_) => "precondition_failed",
            Self::NotFound(_) => "not_found",
            Self::Storage(_) => "storage_error",
            Self::Invariant(_) => "invariant_violation",
            Self::Metadata(_) => "metadata_error",
            Self::Core(_) => "invalid_input",
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn as_conflict(&self) -> Option<&ConflictError> {
        match self {
            Self::Conflict(c) => Some(c),
            _ => None,
        }
    }
}

impl From<ConflictError> for FsError {
    fn from(err: ConflictError) -> Self {
        crate::metrics::record_conflict(err.code);
        Self::Conflict(err)
    }
}

impl From<MetadataError> for FsError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::Conflict(c) => c.into(),
            MetadataError::MissingUploadMetadata { .. }
            | MetadataError::UploadExpired { .. }
            | MetadataError::InvalidInput(_) => {
                Self::Precondition(err.to_string())
            }
            MetadataError::NotFound(what) => Self::NotFound(what),
            MetadataError::Invariant(message) => {
                tracing::error!(error = %message, "Metadata invariant violated");
                Self::Invariant(message)
            }
            other => Self::Metadata(other),
        }
    }
}

impl From<StorageError> for FsError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Unsupported { .. }
            | StorageError::InvalidKey(_)
            | StorageError::InvalidUrl(_)
            | StorageError::InvalidSignature(_)
            | StorageError::UrlExpired { .. } => Self::Precondition(err.to_string()),
            other => Self::Storage(other),
        }
    }
}

/// Result type for facade operations.
pub type FsResult<T> = std::result::Result<T, FsError>;
