//! Blob repository.

use crate::error::MetadataResult;
use crate::models::BlobRow;
use async_trait::async_trait;
use stash_core::BlobId;

#[async_trait]
pub trait BlobRepo: Send + Sync {
    /// Point lookup by blob id.
    async fn get_blob(&self, blob_id: &BlobId) -> MetadataResult<Option<BlobRow>>;
}
