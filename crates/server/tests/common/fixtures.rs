//! Test fixtures: a SQLite store and a mock blob store behind a facade.

use super::storage::MockBlobStore;
use stash_core::config::{GcConfig, OperatorFlags, PersistedConfig, StorageConfig, UploadConfig};
use stash_metadata::{MetadataStore, SqliteStore};
use stash_server::{FileSystem, GarbageCollector};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use time::OffsetDateTime;

#[allow(dead_code)]
pub struct Harness {
    pub fs: FileSystem,
    pub metadata: Arc<SqliteStore>,
    pub blobs: Arc<MockBlobStore>,
    pub gc: GarbageCollector,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
pub fn storage_config() -> StorageConfig {
    StorageConfig::Filesystem {
        path: PathBuf::from("/unused"),
        public_base_url: Some("https://files.example.com/b".to_string()),
        signing_secret: Some("test-secret".to_string()),
    }
}

#[allow(dead_code)]
pub fn gc_config(batch_size: u32) -> GcConfig {
    GcConfig {
        batch_size,
        ..GcConfig::default()
    }
}

#[allow(dead_code)]
impl Harness {
    /// Facade over a fresh store, with configuration already stored.
    pub async fn new() -> Self {
        Self::build(MockBlobStore::new(), UploadConfig::default(), Some(gc_config(100))).await
    }

    pub async fn with_blob_store(blobs: MockBlobStore) -> Self {
        Self::build(blobs, UploadConfig::default(), Some(gc_config(100))).await
    }

    pub async fn with_batch_size(batch_size: u32) -> Self {
        Self::build(MockBlobStore::new(), UploadConfig::default(), Some(gc_config(batch_size)))
            .await
    }

    /// No configuration stored, as on a system that was never used.
    pub async fn unconfigured() -> Self {
        Self::build(MockBlobStore::new(), UploadConfig::default(), None).await
    }

    pub async fn build(
        blobs: MockBlobStore,
        uploads: UploadConfig,
        gc: Option<GcConfig>,
    ) -> Self {
        let temp_dir = tempfile::tempdir().unwrap();
        let metadata = Arc::new(
            SqliteStore::new(temp_dir.path().join("metadata.db"), None)
                .await
                .unwrap(),
        );
        let blobs = Arc::new(blobs);
        let dyn_metadata: Arc<dyn MetadataStore> = metadata.clone();
        let fs = FileSystem::new(dyn_metadata.clone(), blobs.clone(), storage_config(), uploads);
        if let Some(gc) = gc {
            fs.store_config(&PersistedConfig {
                storage: storage_config(),
                gc,
            })
            .await
            .unwrap();
        }
        let gc = GarbageCollector::with_blob_store(dyn_metadata, blobs.clone());
        Self {
            fs,
            metadata,
            blobs,
            gc,
            _temp_dir: temp_dir,
        }
    }

    pub async fn set_flags(&self, freeze_gc: bool, allow_clear_all_files: bool) {
        self.fs
            .set_operator_flags(OperatorFlags {
                freeze_gc,
                allow_clear_all_files,
            })
            .await
            .unwrap();
    }

    /// Upload `data` through the proxy and commit it at `path`.
    pub async fn put(&self, path: &str, data: &[u8]) -> stash_core::BlobId {
        let blob_id = self
            .fs
            .upload_blob(bytes::Bytes::copy_from_slice(data), "text/plain")
            .await
            .unwrap();
        self.fs
            .commit_files(&[stash_core::CommitEntry::new(path, blob_id.clone())])
            .await
            .unwrap();
        blob_id
    }

    pub fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}
