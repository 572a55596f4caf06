//! Pending upload repository.

use crate::error::MetadataResult;
use crate::models::UploadRow;
use async_trait::async_trait;
use stash_core::BlobId;

/// Repository for pending uploads.
#[async_trait]
pub trait UploadRepo: Send + Sync {
    /// Register a pending upload.
    ///
    /// Fails with `InvalidInput` when the id is already used by an upload or
    /// a blob.
    async fn create_upload(&self, upload: &UploadRow) -> MetadataResult<()>;

    /// Point lookup by blob id.
    async fn get_upload(&self, blob_id: &BlobId) -> MetadataResult<Option<UploadRow>>;

    /// Record content type and size on a pending upload.
    ///
    /// Returns false when no pending upload exists for the id.
    async fn set_upload_content(
        &self,
        blob_id: &BlobId,
        content_type: &str,
        size: u64,
    ) -> MetadataResult<bool>;
}
