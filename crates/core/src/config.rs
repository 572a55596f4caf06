//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::Duration;

/// Top-level configuration loaded by the daemon.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    pub metadata: MetadataConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub gc: GcConfig,
    #[serde(default)]
    pub uploads: UploadConfig,
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    Sqlite {
        path: PathBuf,
        /// Advisory per-query timeout in seconds.
        #[serde(default = "default_sqlite_query_timeout_secs")]
        query_timeout_secs: Option<u64>,
    },
}

fn default_sqlite_query_timeout_secs() -> Option<u64> {
    Some(30)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
            query_timeout_secs: default_sqlite_query_timeout_secs(),
        }
    }
}

/// Blob storage backend configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local directory. Download URLs are only available when a public base
    /// URL is configured (served by an external proxy route).
    Filesystem {
        path: PathBuf,
        #[serde(default)]
        public_base_url: Option<String>,
        /// Secret for signing download URLs. Unsigned when absent.
        #[serde(default)]
        signing_secret: Option<String>,
    },
    /// S3-compatible object storage with presigned upload and download URLs.
    S3 {
        bucket: String,
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default)]
        region: Option<String>,
        #[serde(default)]
        prefix: Option<String>,
        #[serde(default)]
        access_key_id: Option<String>,
        #[serde(default)]
        secret_access_key: Option<String>,
        /// Path-style addressing, required by MinIO and similar services.
        #[serde(default)]
        force_path_style: bool,
        #[serde(default = "default_request_timeout_secs")]
        request_timeout_secs: u64,
    },
    /// CDN-backed edge storage: bytes written through the storage API,
    /// served through a pull zone with token-signed URLs.
    Cdn {
        storage_zone: String,
        #[serde(default = "default_cdn_storage_endpoint")]
        storage_endpoint: String,
        access_key: String,
        pull_zone_url: String,
        #[serde(default)]
        path_prefix: Option<String>,
        /// Token authentication key of the pull zone. Unsigned when absent.
        #[serde(default)]
        token_key: Option<String>,
        #[serde(default = "default_request_timeout_secs")]
        request_timeout_secs: u64,
    },
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_cdn_storage_endpoint() -> String {
    "https://storage.bunnycdn.com".to_string()
}

impl StorageConfig {
    /// Backend type name as used in configuration files.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Filesystem { .. } => "filesystem",
            Self::S3 { .. } => "s3",
            Self::Cdn { .. } => "cdn",
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Filesystem {
                public_base_url, ..
            } => {
                if let Some(url) = public_base_url
                    && !(url.starts_with("http://") || url.starts_with("https://"))
                {
                    return Err(format!(
                        "filesystem public_base_url must be an http(s) URL: {url}"
                    ));
                }
                Ok(())
            }
            Self::S3 {
                bucket,
                access_key_id,
                secret_access_key,
                request_timeout_secs,
                ..
            } => {
                if bucket.trim().is_empty() {
                    return Err("s3 config requires a non-empty bucket".to_string());
                }
                if access_key_id.is_some() ^ secret_access_key.is_some() {
                    return Err("s3 config requires both access_key_id and secret_access_key when either is set".to_string());
                }
                if *request_timeout_secs == 0 {
                    return Err("s3 request_timeout_secs must be positive".to_string());
                }
                Ok(())
            }
            Self::Cdn {
                storage_zone,
                access_key,
                pull_zone_url,
                request_timeout_secs,
                ..
            } => {
                if storage_zone.trim().is_empty() {
                    return Err("cdn config requires a storage_zone".to_string());
                }
                if access_key.is_empty() {
                    return Err("cdn config requires an access_key".to_string());
                }
                if !(pull_zone_url.starts_with("http://") || pull_zone_url.starts_with("https://"))
                {
                    return Err(format!(
                        "cdn pull_zone_url must be an http(s) URL: {pull_zone_url}"
                    ));
                }
                if *request_timeout_secs == 0 {
                    return Err("cdn request_timeout_secs must be positive".to_string());
                }
                Ok(())
            }
        }
    }
}

/// Garbage collection configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcConfig {
    /// Run the GC scheduler in the daemon.
    #[serde(default = "default_gc_enabled")]
    pub enabled: bool,
    /// Seconds between scheduler ticks.
    #[serde(default = "default_gc_interval_secs")]
    pub interval_secs: u64,
    /// Seconds an orphaned blob must stay unreferenced before its bytes are
    /// deleted.
    #[serde(default = "default_blob_grace_period_secs")]
    pub blob_grace_period_secs: u64,
    /// Records claimed per GC batch.
    #[serde(default = "default_gc_batch_size")]
    pub batch_size: u32,
    /// Upper bound on back-to-back batches of one GC kind per tick.
    #[serde(default = "default_max_batches_per_tick")]
    pub max_batches_per_tick: u32,
}

fn default_gc_enabled() -> bool {
    true
}

fn default_gc_interval_secs() -> u64 {
    300
}

fn default_blob_grace_period_secs() -> u64 {
    86400 // 24 hours
}

fn default_gc_batch_size() -> u32 {
    100
}

fn default_max_batches_per_tick() -> u32 {
    50
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: default_gc_enabled(),
            interval_secs: default_gc_interval_secs(),
            blob_grace_period_secs: default_blob_grace_period_secs(),
            batch_size: default_gc_batch_size(),
            max_batches_per_tick: default_max_batches_per_tick(),
        }
    }
}

impl GcConfig {
    /// Get the blob grace period as a Duration.
    pub fn blob_grace_period(&self) -> Duration {
        Duration::seconds(self.blob_grace_period_secs as i64)
    }

    /// Get the scheduler interval.
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_secs.max(1))
    }
}

/// Upload and download URL configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Lifetime of an upload handle; also the commit deadline of the pending
    /// upload it registers.
    #[serde(default = "default_upload_url_ttl_secs")]
    pub upload_url_ttl_secs: u64,
    /// Default lifetime of download URLs.
    #[serde(default = "default_download_url_ttl_secs")]
    pub download_url_ttl_secs: u64,
    /// Largest payload accepted by proxy upload.
    #[serde(default = "default_max_proxy_upload_bytes")]
    pub max_proxy_upload_bytes: u64,
}

fn default_upload_url_ttl_secs() -> u64 {
    3600
}

fn default_download_url_ttl_secs() -> u64 {
    3600
}

fn default_max_proxy_upload_bytes() -> u64 {
    64 * 1024 * 1024
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            upload_url_ttl_secs: default_upload_url_ttl_secs(),
            download_url_ttl_secs: default_download_url_ttl_secs(),
            max_proxy_upload_bytes: default_max_proxy_upload_bytes(),
        }
    }
}

impl UploadConfig {
    pub fn upload_url_ttl(&self) -> Duration {
        Duration::seconds(self.upload_url_ttl_secs as i64)
    }

    pub fn download_url_ttl(&self) -> Duration {
        Duration::seconds(self.download_url_ttl_secs as i64)
    }
}

/// Configuration persisted in the metadata store so background jobs can
/// reach the blob store without caller-supplied arguments.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedConfig {
    pub storage: StorageConfig,
    #[serde(default)]
    pub gc: GcConfig,
}

/// Operator-only flags. Client configuration writes never change them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorFlags {
    /// Suspend every GC loop that deletes physical bytes.
    pub freeze_gc: bool,
    /// Permit destructive bulk-delete utilities.
    pub allow_clear_all_files: bool,
}
