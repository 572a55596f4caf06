//! Database models mapping to the metadata schema.
//!
//! Timestamps are stored as integer unix milliseconds so range scans compare
//! numerically.

use crate::error::{MetadataError, MetadataResult};
use sqlx::FromRow;
use stash_core::config::{OperatorFlags, PersistedConfig};
use stash_core::{BlobId, FileAttributes, FileMetadata};
use time::OffsetDateTime;

/// Convert a timestamp to stored milliseconds.
pub fn to_millis(ts: OffsetDateTime) -> i64 {
    (ts.unix_timestamp_nanos() / 1_000_000) as i64
}

/// Convert stored milliseconds back to a timestamp.
pub fn from_millis(ms: i64) -> MetadataResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .map_err(|e| MetadataError::Invariant(format!("timestamp {ms}ms out of range: {e}")))
}

fn stored_blob_id(raw: &str) -> MetadataResult<BlobId> {
    BlobId::parse(raw).map_err(|e| MetadataError::Invariant(format!("stored blob id {raw:?}: {e}")))
}

// =============================================================================
// Files
// =============================================================================

/// File record joined with its blob. Blob columns are `None` when the blob
/// record is missing, which is an invariant violation.
#[derive(Debug, Clone, FromRow)]
pub struct FileRow {
    pub path: String,
    pub blob_id: String,
    pub expires_at: Option<i64>,
    pub content_type: Option<String>,
    pub size: Option<i64>,
}

impl FileRow {
    pub fn into_metadata(self) -> MetadataResult<FileMetadata> {
        let (Some(content_type), Some(size)) = (self.content_type, self.size) else {
            return Err(MetadataError::Invariant(format!(
                "file {} references missing blob {}",
                self.path, self.blob_id
            )));
        };
        let attributes = match self.expires_at {
            Some(ms) => Some(FileAttributes::expiring_at(from_millis(ms)?)),
            None => None,
        };
        Ok(FileMetadata {
            blob_id: stored_blob_id(&self.blob_id)?,
            path: self.path,
            content_type,
            size: size.max(0) as u64,
            attributes,
        })
    }
}

/// A file removed by file-expiry GC or a bulk clear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedFile {
    pub path: String,
    pub blob_id: BlobId,
}

// =============================================================================
// Blobs
// =============================================================================

/// Blob record: one physical object in the blob store.
#[derive(Debug, Clone, FromRow)]
pub struct BlobRow {
    pub blob_id: String,
    pub content_type: String,
    pub size: i64,
    pub ref_count: i64,
    /// Time of the last reference count change, in unix milliseconds.
    pub updated_at: i64,
}

impl BlobRow {
    pub fn id(&self) -> MetadataResult<BlobId> {
        stored_blob_id(&self.blob_id)
    }

    pub fn updated_at(&self) -> MetadataResult<OffsetDateTime> {
        from_millis(self.updated_at)
    }
}

// =============================================================================
// Pending uploads
// =============================================================================

/// Pending upload: bytes that may exist in the blob store but are not yet
/// bound to a path.
#[derive(Debug, Clone, FromRow)]
pub struct UploadRow {
    pub blob_id: String,
    /// Commit deadline, in unix milliseconds.
    pub expires_at: i64,
    pub content_type: Option<String>,
    pub size: Option<i64>,
    pub created_at: i64,
}

impl UploadRow {
    pub fn new(blob_id: &BlobId, created_at: OffsetDateTime, expires_at: OffsetDateTime) -> Self {
        Self {
            blob_id: blob_id.to_string(),
            expires_at: to_millis(expires_at),
            content_type: None,
            size: None,
            created_at: to_millis(created_at),
        }
    }

    /// Record content metadata captured at upload time.
    pub fn with_content(mut self, content_type: impl Into<String>, size: u64) -> Self {
        self.content_type = Some(content_type.into());
        self.size = Some(size as i64);
        self
    }

    pub fn id(&self) -> MetadataResult<BlobId> {
        stored_blob_id(&self.blob_id)
    }

    pub fn expires_at(&self) -> MetadataResult<OffsetDateTime> {
        from_millis(self.expires_at)
    }

    /// True once content type and size are known and the upload can be
    /// committed.
    pub fn has_content_metadata(&self) -> bool {
        self.content_type.is_some() && self.size.is_some()
    }
}

// =============================================================================
// Stored configuration
// =============================================================================

/// The stored configuration singleton.
#[derive(Debug, Clone, FromRow)]
pub struct StoredConfigRow {
    pub version: i64,
    pub config_json: String,
    pub freeze_gc: bool,
    pub allow_clear_all_files: bool,
    pub updated_at: i64,
}

impl StoredConfigRow {
    pub fn config(&self) -> MetadataResult<PersistedConfig> {
        Ok(serde_json::from_str(&self.config_json)?)
    }

    pub fn flags(&self) -> OperatorFlags {
        OperatorFlags {
            freeze_gc: self.freeze_gc,
            allow_clear_all_files: self.allow_clear_all_files,
        }
    }
}

// =============================================================================
// Diagnostics
// =============================================================================

/// Record counts for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct StoreStats {
    pub files: u64,
    pub blobs: u64,
    pub orphaned_blobs: u64,
    pub pending_uploads: u64,
    /// Sum of sizes of blobs with at least one reference.
    pub referenced_bytes: u64,
}

/// A blob whose stored reference count disagrees with its file records.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RefcountDiscrepancy {
    pub blob_id: String,
    /// Stored reference count; `None` when file records point at a blob
    /// that has no record.
    pub stored: Option<i64>,
    /// Number of file records pointing at the blob.
    pub actual: i64,
}
