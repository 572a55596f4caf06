//! Garbage collection and maintenance repository.

use crate::error::MetadataResult;
use crate::models::{BlobRow, RefcountDiscrepancy, RemovedFile, StoreStats, UploadRow};
use async_trait::async_trait;
use stash_core::BlobId;
use time::OffsetDateTime;

/// Repository for GC queries.
///
/// Find and delete steps are separate calls so callers can delete bytes
/// from the blob store in between, outside any transaction.
#[async_trait]
pub trait GcRepo: Send + Sync {
    /// Pending uploads whose deadline is strictly before `before`.
    async fn expired_uploads(
        &self,
        before: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<UploadRow>>;

    /// Delete pending upload records. Returns the number removed.
    async fn delete_uploads(&self, blob_ids: &[BlobId]) -> MetadataResult<u64>;

    /// Blobs with no references whose last change is strictly before
    /// `before`.
    async fn orphaned_blobs(
        &self,
        before: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<BlobRow>>;

    /// Delete blob records, re-checking that each is still unreferenced and
    /// older than `before`. Returns the ids actually removed.
    async fn delete_orphaned_blobs(
        &self,
        blob_ids: &[BlobId],
        before: OffsetDateTime,
    ) -> MetadataResult<Vec<BlobId>>;

    /// Delete files whose expiry is strictly before `now`, decrementing
    /// their blobs, in one transaction.
    async fn expire_files(
        &self,
        now: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<RemovedFile>>;

    /// Delete up to `limit` files in path order, decrementing their blobs.
    async fn clear_files(&self, limit: u32, now: OffsetDateTime)
    -> MetadataResult<Vec<RemovedFile>>;

    /// Record counts for diagnostics.
    async fn stats(&self) -> MetadataResult<StoreStats>;

    /// Blobs whose stored reference count disagrees with file records.
    async fn audit_refcounts(&self) -> MetadataResult<Vec<RefcountDiscrepancy>>;
}
