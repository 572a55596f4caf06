//! File records as seen by callers.

use crate::blob::BlobId;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Maximum path length in bytes.
pub const MAX_PATH_LEN: usize = 4096;

/// Path-scoped attributes. They never travel with a move or copy.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAttributes {
    /// Instant after which the file is considered expired and is reclaimed
    /// by file-expiry GC.
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_at: Option<OffsetDateTime>,
}

impl FileAttributes {
    /// Attributes carrying only an expiry.
    pub fn expiring_at(expires_at: OffsetDateTime) -> Self {
        Self {
            expires_at: Some(expires_at),
        }
    }

    /// True when no attribute is set.
    pub fn is_empty(&self) -> bool {
        self.expires_at.is_none()
    }

    /// Collapse an empty bag to `None`.
    pub fn non_empty(self) -> Option<Self> {
        if self.is_empty() { None } else { Some(self) }
    }
}

/// Metadata for one file in the namespace, joined with its blob record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub path: String,
    pub blob_id: BlobId,
    pub content_type: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<FileAttributes>,
}

impl FileMetadata {
    /// Expiry attribute, if any.
    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        self.attributes.as_ref().and_then(|a| a.expires_at)
    }
}

/// Validate a namespace path.
///
/// Paths are opaque strings ordered bytewise; the only requirements are that
/// they are non-empty, bounded in length and free of NUL characters.
pub fn validate_path(path: &str) -> crate::Result<()> {
    if path.is_empty() {
        return Err(crate::Error::InvalidPath("path must not be empty".to_string()));
    }
    if path.len() > MAX_PATH_LEN {
        return Err(crate::Error::InvalidPath(format!(
            "path exceeds {MAX_PATH_LEN} bytes: {} bytes",
            path.len()
        )));
    }
    if path.contains('\0') {
        return Err(crate::Error::InvalidPath(
            "path must not contain NUL".to_string(),
        ));
    }
    Ok(())
}
