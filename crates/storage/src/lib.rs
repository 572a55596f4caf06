//! Blob store adapter contract and backends for stash.
//!
//! This crate provides:
//! - The [`BlobStore`] trait: put/get/head/delete plus upload and download URLs
//! - Download URL construction and token signing
//! - Backends: local filesystem, S3-compatible, CDN edge storage

pub mod backends;
pub mod error;
pub mod signing;
pub mod traits;

pub use backends::{
    cdn::{CdnBackend, CdnSettings},
    filesystem::FilesystemBackend,
    s3::{S3Backend, S3Settings},
};
pub use error::{StorageError, StorageResult};
pub use traits::{BlobStore, DeleteOutcome, DownloadOptions, ObjectMeta, UploadTarget};

use stash_core::config::StorageConfig;
use std::sync::Arc;
use std::time::Duration;

/// Create a blob store from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn BlobStore>> {
    config.validate().map_err(StorageError::Config)?;

    match config {
        StorageConfig::Filesystem {
            path,
            public_base_url,
            signing_secret,
        } => {
            let mut backend = FilesystemBackend::new(path).await?;
            if let Some(base) = public_base_url {
                backend = backend.with_public_url(base.clone(), signing_secret.clone());
            }
            Ok(Arc::new(backend))
        }
        StorageConfig::S3 {
            bucket,
            endpoint,
            region,
            prefix,
            access_key_id,
            secret_access_key,
            force_path_style,
            request_timeout_secs,
        } => {
            let backend = S3Backend::new(S3Settings {
                bucket: bucket.clone(),
                endpoint: endpoint.clone(),
                region: region.clone(),
                prefix: prefix.clone(),
                access_key_id: access_key_id.clone(),
                secret_access_key: secret_access_key.clone(),
                force_path_style: *force_path_style,
                request_timeout: Duration::from_secs(*request_timeout_secs),
            })?;
            Ok(Arc::new(backend))
        }
        StorageConfig::Cdn {
            storage_zone,
            storage_endpoint,
            access_key,
            pull_zone_url,
            path_prefix,
            token_key,
            request_timeout_secs,
        } => {
            let backend = CdnBackend::new(CdnSettings {
                storage_zone: storage_zone.clone(),
                storage_endpoint: storage_endpoint.clone(),
                access_key: access_key.clone(),
                pull_zone_url: pull_zone_url.clone(),
                path_prefix: path_prefix.clone(),
                token_key: token_key.clone(),
                request_timeout: Duration::from_secs(*request_timeout_secs),
            })?;
            Ok(Arc::new(backend))
        }
    }
}
