//! Metadata store error types.

use stash_core::{BlobId, ConflictError};
use thiserror::Error;

fn join_blob_ids(ids: &[BlobId]) -> String {
    ids.iter().map(BlobId::as_str).collect::<Vec<_>>().join(", ")
}

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Optimistic-concurrency violation; the caller should re-read and retry.
    #[error(transparent)]
    Conflict(#[from] ConflictError),

    /// Uploads that were never finalized cannot be committed. Every offending
    /// id is named.
    #[error(
        "cannot commit {} upload(s) without recorded content type and size: {}",
        .blob_ids.len(),
        join_blob_ids(.blob_ids)
    )]
    MissingUploadMetadata { blob_ids: Vec<BlobId> },

    /// Uploads whose commit deadline has passed.
    #[error(
        "cannot commit {} upload(s) past their commit deadline: {}",
        .blob_ids.len(),
        join_blob_ids(.blob_ids)
    )]
    UploadExpired { blob_ids: Vec<BlobId> },

    /// Malformed request, such as one blob id or path committed twice.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Stored state contradicts a data-model invariant.
    #[error("metadata invariant violated: {0}")]
    Invariant(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MetadataError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<std::io::Error> for MetadataError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(format!("I/O error: {err}"))
    }
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_metadata_names_every_id() {
        let blob_ids: Vec<BlobId> = (0..12)
            .map(|i| BlobId::parse(&format!("blob{i}")).unwrap())
            .collect();
        let msg = MetadataError::MissingUploadMetadata { blob_ids }.to_string();
        assert!(msg.starts_with("cannot commit 12 upload(s)"));
        for i in 0..12 {
            assert!(msg.contains(&format!("blob{i}")));
        }
    }
}
