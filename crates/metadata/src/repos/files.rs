//! File (path) repository.

use crate::error::MetadataResult;
use async_trait::async_trait;
use stash_core::{FileMetadata, FilePage, PageOpts};

/// Read access to file records joined with their blobs.
#[async_trait]
pub trait FileRepo: Send + Sync {
    /// Point lookup by path.
    async fn get_file(&self, path: &str) -> MetadataResult<Option<FileMetadata>>;

    /// One page of files in ascending path order, restricted to the
    /// half-open range `[prefix, prefix + char::MAX)` when a prefix is given.
    async fn list_files(&self, prefix: Option<&str>, opts: &PageOpts) -> MetadataResult<FilePage>;
}
