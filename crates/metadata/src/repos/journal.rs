//! Atomic namespace mutations: commit, transact and restore.

use crate::error::MetadataResult;
use async_trait::async_trait;
use stash_core::{BlobId, CommitEntry, Op};
use time::OffsetDateTime;

/// Repository for namespace mutations. Each call is one atomic unit.
#[async_trait]
pub trait JournalRepo: Send + Sync {
    /// Bind pending uploads to paths.
    ///
    /// Fails with `MissingUploadMetadata` naming every upload without
    /// content metadata, or with a `CAS_CONFLICT` conflict. No entry takes
    /// effect unless all do.
    async fn commit_files(&self, entries: &[CommitEntry], now: OffsetDateTime)
    -> MetadataResult<()>;

    /// Apply a journal of operations in order, all or nothing.
    async fn transact(&self, ops: &[Op], now: OffsetDateTime) -> MetadataResult<()>;

    /// Link an existing blob to an unoccupied path, incrementing its
    /// reference count.
    async fn restore(
        &self,
        blob_id: &BlobId,
        path: &str,
        now: OffsetDateTime,
    ) -> MetadataResult<()>;
}
