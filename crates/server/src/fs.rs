//! The filesystem facade: every caller-facing operation over the metadata
//! store and the blob store.

use crate::error::{FsError, FsResult};
use crate::metrics;
use bytes::Bytes;
use stash_core::config::{AppConfig, OperatorFlags, PersistedConfig, StorageConfig, UploadConfig};
use stash_core::{
    Basis, BlobId, CommitEntry, ConflictCode, ConflictError, DEFAULT_CONTENT_TYPE, DestRef,
    FileMetadata, FilePage, Op, PageOpts,
};
use stash_metadata::repos::{
    BlobRepo, ConfigRepo, FileRepo, GcRepo, JournalRepo, UploadRepo,
};
use stash_metadata::{
    MetadataStore, RefcountDiscrepancy, RemovedFile, StoreStats, StoredConfigRow, UploadRow,
};
use stash_storage::signing::{self, ParsedUrl};
use stash_storage::{BlobStore, DownloadOptions, UploadTarget};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::instrument;

/// A freshly issued upload slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadHandle {
    pub blob_id: BlobId,
    pub target: UploadTarget,
    /// Commit deadline. Upload GC reclaims the slot some time after this.
    pub expires_at: OffsetDateTime,
}

/// Virtual filesystem over a metadata store and a blob store.
pub struct FileSystem {
    metadata: Arc<dyn MetadataStore>,
    storage: Arc<dyn BlobStore>,
    storage_config: StorageConfig,
    uploads: UploadConfig,
}

impl FileSystem {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        storage: Arc<dyn BlobStore>,
        storage_config: StorageConfig,
        uploads: UploadConfig,
    ) -> Self {
        Self {
            metadata,
            storage,
            storage_config,
            uploads,
        }
    }

    /// Open the metadata store and blob store named by `config`, and persist
    /// the storage and GC settings for background jobs.
    pub async fn from_config(config: &AppConfig) -> FsResult<Self> {
        let metadata = stash_metadata::from_config(&config.metadata).await?;
        let storage = stash_storage::from_config(&config.storage).await?;
        let fs = Self::new(
            metadata,
            storage,
            config.storage.clone(),
            config.uploads.clone(),
        );
        fs.store_config(&PersistedConfig {
            storage: config.storage.clone(),
            gc: config.gc.clone(),
        })
        .await?;
        Ok(fs)
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    pub fn storage(&self) -> &Arc<dyn BlobStore> {
        &self.storage
    }

    // =========================================================================
    // Uploads
    // =========================================================================

    /// Issue an upload slot: a presigned URL where the backend supports one,
    /// otherwise a pointer to the proxy upload.
    ///
    /// The pending upload carries no content metadata yet; presigned uploads
    /// must be finalized before they can be committed.
    #[instrument(skip(self))]
    pub async fn generate_upload_url(&self) -> FsResult<UploadHandle> {
        let blob_id = BlobId::generate();
        let ttl = self.uploads.upload_url_ttl();
        let target = self
            .storage
            .generate_upload_url(blob_id.as_str(), ttl.unsigned_abs())
            .await?;

        let now = OffsetDateTime::now_utc();
        let expires_at = now + ttl;
        self.metadata
            .create_upload(&UploadRow::new(&blob_id, now, expires_at))
            .await?;

        let mode = match target {
            UploadTarget::Presigned { .. } => "presigned",
            UploadTarget::Proxy => "proxy",
        };
        metrics::UPLOADS_STARTED.with_label_values(&[mode]).inc();
        tracing::debug!(blob_id = %blob_id, mode, "Upload slot issued");
        Ok(UploadHandle {
            blob_id,
            target,
            expires_at,
        })
    }

    /// Store bytes through the service and register them as a committable
    /// pending upload.
    ///
    /// The pending record is written before the bytes so that a failure at
    /// any point leaves something for upload GC to reclaim.
    #[instrument(skip(self, data), fields(size = data.len()))]
    pub async fn upload_blob(&self, data: Bytes, content_type: &str) -> FsResult<BlobId> {
        let size = data.len() as u64;
        if size > self.uploads.max_proxy_upload_bytes {
            return Err(FsError::Precondition(format!(
                "upload of {size} bytes exceeds the {} byte limit",
                self.uploads.max_proxy_upload_bytes
            )));
        }

        let blob_id = BlobId::generate();
        let now = OffsetDateTime::now_utc();
        self.metadata
            .create_upload(&UploadRow::new(
                &blob_id,
                now,
                now + self.uploads.upload_url_ttl(),
            ))
            .await?;
        self.storage
            .put(blob_id.as_str(), data, content_type)
            .await?;
        self.record_upload_content(&blob_id, content_type, size)
            .await?;

        metrics::UPLOADS_STARTED.with_label_values(&["proxy"]).inc();
        metrics::BYTES_UPLOADED.inc_by(size);
        Ok(blob_id)
    }

    /// Capture content type and size of a presigned upload from the backend.
    #[instrument(skip(self))]
    pub async fn finalize_upload(&self, blob_id: &BlobId) -> FsResult<()> {
        if self.metadata.get_upload(blob_id).await?.is_none() {
            return Err(FsError::Precondition(format!(
                "no pending upload for blob {blob_id}"
            )));
        }
        let Some(object) = self.storage.head(blob_id.as_str()).await? else {
            return Err(FsError::Precondition(format!(
                "blob {blob_id} has not been uploaded"
            )));
        };
        let content_type = object
            .content_type
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
        self.record_upload_content(blob_id, &content_type, object.size)
            .await
    }

    async fn record_upload_content(
        &self,
        blob_id: &BlobId,
        content_type: &str,
        size: u64,
    ) -> FsResult<()> {
        if self
            .metadata
            .set_upload_content(blob_id, content_type, size)
            .await?
        {
            Ok(())
        } else {
            Err(FsError::Precondition(format!(
                "pending upload for blob {blob_id} expired before it was finalized"
            )))
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn stat(&self, path: &str) -> FsResult<Option<FileMetadata>> {
        Ok(self.metadata.get_file(path).await?)
    }

    /// One page of files in ascending path order.
    pub async fn list(&self, prefix: Option<&str>, opts: &PageOpts) -> FsResult<FilePage> {
        Ok(self.metadata.list_files(prefix, opts).await?)
    }

    /// Bytes of a committed or pending blob; `None` when absent.
    pub async fn get_blob(&self, blob_id: &BlobId) -> FsResult<Option<Bytes>> {
        Ok(self.storage.get(blob_id.as_str()).await?)
    }

    /// A time-limited download URL for the file at `path`, or `None` when no
    /// file is there.
    pub async fn get_download_url(
        &self,
        path: &str,
        options: &DownloadOptions,
    ) -> FsResult<Option<String>> {
        let Some(file) = self.stat(path).await? else {
            return Ok(None);
        };
        let url = self
            .storage
            .generate_download_url(
                file.blob_id.as_str(),
                self.uploads.download_url_ttl().unsigned_abs(),
                options,
            )
            .await?;
        Ok(Some(url))
    }

    /// Check token and expiry of a download URL issued by this service.
    pub fn verify_download_url(&self, url: &str, now: OffsetDateTime) -> FsResult<ParsedUrl> {
        let (base, prefix, secret) = match &self.storage_config {
            StorageConfig::Filesystem {
                public_base_url: Some(base),
                signing_secret: Some(secret),
                ..
            } => (base.as_str(), "", secret.as_str()),
            StorageConfig::Cdn {
                pull_zone_url,
                path_prefix,
                token_key: Some(secret),
                ..
            } => (
                pull_zone_url.as_str(),
                path_prefix.as_deref().unwrap_or(""),
                secret.as_str(),
            ),
            other => {
                return Err(FsError::Precondition(format!(
                    "{} storage does not issue signed download urls",
                    other.kind()
                )));
            }
        };
        Ok(signing::verify_url(
            url,
            base,
            prefix,
            secret,
            now.unix_timestamp(),
        )?)
    }

    // =========================================================================
    // Namespace mutations
    // =========================================================================

    /// Bind pending uploads to paths as one atomic unit.
    #[instrument(skip(self, entries), fields(entries = entries.len()))]
    pub async fn commit_files(&self, entries: &[CommitEntry]) -> FsResult<()> {
        self.metadata
            .commit_files(entries, OffsetDateTime::now_utc())
            .await?;
        metrics::COMMITS.inc();
        metrics::FILES_COMMITTED.inc_by(entries.len() as u64);
        Ok(())
    }

    /// Apply a journal as one atomic unit.
    #[instrument(skip(self, ops), fields(ops = ops.len()))]
    pub async fn transact(&self, ops: &[Op]) -> FsResult<()> {
        self.metadata
            .transact(ops, OffsetDateTime::now_utc())
            .await?;
        metrics::TRANSACTIONS.inc();
        Ok(())
    }

    async fn current_source(&self, path: &str) -> FsResult<FileMetadata> {
        self.stat(path).await?.ok_or_else(|| {
            ConflictError::new(ConflictCode::SourceNotFound, path, None, None)
                .at_operation(1)
                .into()
        })
    }

    /// Copy `source` to an unoccupied `dest`.
    ///
    /// Reads then writes without holding anything in between; callers that
    /// race on these paths should build the journal themselves from a fresh
    /// stat.
    pub async fn copy(&self, source: &str, dest: &str) -> FsResult<()> {
        let source = self.current_source(source).await?;
        self.transact(&[Op::Copy {
            source,
            dest: DestRef::new(dest, Basis::MustNotExist),
        }])
        .await
    }

    /// Move `source` to an unoccupied `dest`. Same race caveat as [`copy`](Self::copy).
    pub async fn move_file(&self, source: &str, dest: &str) -> FsResult<()> {
        let source = self.current_source(source).await?;
        self.transact(&[Op::Move {
            source,
            dest: DestRef::new(dest, Basis::MustNotExist),
        }])
        .await
    }

    /// Delete the file at `path`. Deleting a missing path is a no-op.
    pub async fn delete(&self, path: &str) -> FsResult<()> {
        let Some(source) = self.stat(path).await? else {
            return Ok(());
        };
        self.transact(&[Op::Delete { source }]).await
    }

    /// Re-link a blob that has no remaining references to a new path.
    ///
    /// Racing blob GC is possible once the grace period has passed.
    #[instrument(skip(self))]
    pub async fn restore(&self, blob_id: &BlobId, path: &str) -> FsResult<()> {
        self.metadata
            .restore(blob_id, path, OffsetDateTime::now_utc())
            .await?;
        tracing::info!(blob_id = %blob_id, path, "Blob restored");
        Ok(())
    }

    /// Delete up to `batch` files in path order. Refused unless the operator
    /// has opted in with the `allow_clear_all_files` flag.
    #[instrument(skip(self))]
    pub async fn clear_all_files(&self, batch: u32) -> FsResult<Vec<RemovedFile>> {
        let allowed = self
            .metadata
            .get_stored_config()
            .await?
            .is_some_and(|row| row.allow_clear_all_files);
        if !allowed {
            return Err(FsError::Precondition(
                "clearing all files requires the allow_clear_all_files operator flag".to_string(),
            ));
        }
        let removed = self
            .metadata
            .clear_files(batch, OffsetDateTime::now_utc())
            .await?;
        tracing::warn!(removed = removed.len(), "Cleared files");
        Ok(removed)
    }

    // =========================================================================
    // Configuration and diagnostics
    // =========================================================================

    /// Persist client-supplied configuration for background jobs. Operator
    /// flags are preserved.
    pub async fn store_config(&self, config: &PersistedConfig) -> FsResult<StoredConfigRow> {
        config.storage.validate().map_err(FsError::Precondition)?;
        Ok(self
            .metadata
            .store_config(config, OffsetDateTime::now_utc())
            .await?)
    }

    pub async fn set_operator_flags(&self, flags: OperatorFlags) -> FsResult<StoredConfigRow> {
        Ok(self
            .metadata
            .set_operator_flags(flags, OffsetDateTime::now_utc())
            .await?)
    }

    pub async fn stats(&self) -> FsResult<StoreStats> {
        Ok(self.metadata.stats().await?)
    }

    /// Recompute reference counts from file records and report mismatches.
    /// Nothing is corrected.
    pub async fn audit_refcounts(&self) -> FsResult<Vec<RefcountDiscrepancy>> {
        Ok(self.metadata.audit_refcounts().await?)
    }

    /// Blob record for diagnostics.
    pub async fn blob_record(&self, blob_id: &BlobId) -> FsResult<Option<stash_metadata::BlobRow>> {
        Ok(self.metadata.get_blob(blob_id).await?)
    }
}
