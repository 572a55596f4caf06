//! Blob store trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use time::OffsetDateTime;

/// Result of a delete against the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The object existed and was removed.
    Deleted,
    /// The object was already absent.
    NotFound,
}

/// Where a client should send upload bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadTarget {
    /// A time-limited URL accepting a direct PUT.
    Presigned { url: String },
    /// The backend cannot presign; bytes must go through the proxy upload.
    Proxy,
}

/// Metadata about a stored object.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time (if available).
    pub last_modified: Option<OffsetDateTime>,
    /// Content type (if available).
    pub content_type: Option<String>,
}

/// Options for download URL generation.
#[derive(Clone, Debug, Default)]
pub struct DownloadOptions {
    /// Friendly file name appended to the URL path.
    pub file_name: Option<String>,
    /// Passthrough query parameters. Signed backends include them in the
    /// signature in sorted order.
    pub extra_params: Vec<(String, String)>,
}

/// Uniform capability set over blob storage backends.
///
/// Objects are keyed by blob id. Implementations hold no durable state of
/// their own.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Store bytes under a key.
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> StorageResult<()>;

    /// Fetch an object's bytes; `None` when absent.
    async fn get(&self, key: &str) -> StorageResult<Option<Bytes>>;

    /// Fetch an object's metadata; `None` when absent.
    async fn head(&self, key: &str) -> StorageResult<Option<ObjectMeta>>;

    /// Delete an object.
    ///
    /// Returns `NotFound` when the object was already gone. Errors are
    /// reserved for transport and server faults, including timeouts.
    async fn delete(&self, key: &str) -> StorageResult<DeleteOutcome>;

    /// Generate a time-limited upload URL, or report that uploads must be
    /// proxied.
    async fn generate_upload_url(&self, key: &str, ttl: Duration) -> StorageResult<UploadTarget>;

    /// Generate a time-limited download URL.
    async fn generate_download_url(
        &self,
        key: &str,
        ttl: Duration,
        options: &DownloadOptions,
    ) -> StorageResult<String>;

    /// Static identifier of the backend type, for logs and metrics.
    fn backend_name(&self) -> &'static str;

    /// Verify backend connectivity.
    ///
    /// The default implementation returns Ok(()), suitable for backends that
    /// don't require connectivity verification (e.g., local filesystem).
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}
