//! Local filesystem blob store.

use crate::error::{StorageError, StorageResult};
use crate::signing::{self, UrlParts};
use crate::traits::{BlobStore, DeleteOutcome, DownloadOptions, ObjectMeta, UploadTarget};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;
use uuid::Uuid;

/// Blob store rooted at a local directory.
///
/// Uploads are always proxied. Download URLs point at `public_base_url`,
/// which an external route serves from the same directory.
pub struct FilesystemBackend {
    root: PathBuf,
    public_base_url: Option<String>,
    signing_secret: Option<String>,
}

impl FilesystemBackend {
    /// Create a backend, creating the root directory if needed.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            public_base_url: None,
            signing_secret: None,
        })
    }

    /// Serve download URLs from `base_url`, optionally signed.
    pub fn with_public_url(mut self, base_url: impl Into<String>, secret: Option<String>) -> Self {
        self.public_base_url = Some(base_url.into());
        self.signing_secret = secret;
        self
    }

    async fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        let root = self.root.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || Self::key_path_sync(&root, &key))
            .await
            .map_err(|e| {
                StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}")))
            })?
    }

    /// Resolve a key under the root. Keys are single path components; a
    /// symlink at the resolved location must not lead outside the root.
    fn key_path_sync(root: &Path, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty() || key.contains("..") || key.contains('/') || key.contains('\\') {
            return Err(StorageError::InvalidKey(format!(
                "path traversal not allowed: {key}"
            )));
        }
        let mut components = Path::new(key).components();
        if !matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        ) {
            return Err(StorageError::InvalidKey(format!(
                "contains unsafe path component: {key}"
            )));
        }

        let path = root.join(key);
        match std::fs::symlink_metadata(&path) {
            Ok(meta) if meta.file_type().is_symlink() => {
                let root_canonical = root.canonicalize()?;
                let canonical = path.canonicalize().map_err(|_| {
                    StorageError::InvalidKey(format!("symlink target missing or invalid: {key}"))
                })?;
                if !canonical.starts_with(&root_canonical) {
                    return Err(StorageError::InvalidKey(format!(
                        "resolved path escapes storage root: {key}"
                    )));
                }
                Ok(path)
            }
            Ok(_) => Ok(path),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(path),
            Err(err) => Err(StorageError::Io(err)),
        }
    }
}

fn not_found_as_none<T>(result: std::io::Result<T>) -> StorageResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::Io(e)),
    }
}

#[async_trait]
impl BlobStore for FilesystemBackend {
    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes, _content_type: &str) -> StorageResult<()> {
        let path = self.key_path(key).await?;

        // Unique temp name so concurrent writers of one key never share a file.
        let temp_path = self.root.join(format!(".{key}.tmp.{}", Uuid::new_v4()));
        {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
        }
        if let Err(e) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get(&self, key: &str) -> StorageResult<Option<Bytes>> {
        let path = self.key_path(key).await?;
        Ok(not_found_as_none(fs::read(&path).await)?.map(Bytes::from))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn head(&self, key: &str) -> StorageResult<Option<ObjectMeta>> {
        let path = self.key_path(key).await?;
        Ok(
            not_found_as_none(fs::metadata(&path).await)?.map(|metadata| ObjectMeta {
                size: metadata.len(),
                last_modified: metadata.modified().ok().map(OffsetDateTime::from),
                content_type: None,
            }),
        )
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, key: &str) -> StorageResult<DeleteOutcome> {
        let path = self.key_path(key).await?;
        match not_found_as_none(fs::remove_file(&path).await)? {
            Some(()) => Ok(DeleteOutcome::Deleted),
            None => Ok(DeleteOutcome::NotFound),
        }
    }

    async fn generate_upload_url(&self, key: &str, _ttl: Duration) -> StorageResult<UploadTarget> {
        self.key_path(key).await?;
        Ok(UploadTarget::Proxy)
    }

    async fn generate_download_url(
        &self,
        key: &str,
        ttl: Duration,
        options: &DownloadOptions,
    ) -> StorageResult<String> {
        let Some(base) = &self.public_base_url else {
            return Err(StorageError::Unsupported {
                backend: "filesystem",
                message: "download URLs require public_base_url".to_string(),
            });
        };
        self.key_path(key).await?;

        let parts = UrlParts {
            base: base.clone(),
            path_prefix: String::new(),
            blob_id: key.to_string(),
            file_name: options.file_name.clone(),
            extra_params: options.extra_params.clone(),
        };
        let expires = OffsetDateTime::now_utc().unix_timestamp() + ttl.as_secs() as i64;
        signing::build_url(
            &parts,
            self.signing_secret.as_deref().map(|secret| (secret, expires)),
        )
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn health_check(&self) -> StorageResult<()> {
        let metadata = fs::metadata(&self.root).await.map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("storage root not accessible: {e}"),
            ))
        })?;
        if !metadata.is_dir() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("storage root is not a directory: {:?}", self.root),
            )));
        }
        Ok(())
    }
}
