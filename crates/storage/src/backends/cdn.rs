//! CDN edge-storage blob store.
//!
//! Bytes go through the storage API (`{endpoint}/{zone}/{prefix}/{key}`,
//! authenticated with an `AccessKey` header). Reads are served by the pull
//! zone, optionally with token-signed URLs.

use crate::backends::with_timeout;
use crate::error::{StorageError, StorageResult};
use crate::signing::{self, UrlParts};
use crate::traits::{BlobStore, DeleteOutcome, DownloadOptions, ObjectMeta, UploadTarget};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Method, StatusCode};
use std::time::Duration;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc2822;
use tracing::instrument;

/// Connection settings for [`CdnBackend::new`].
#[derive(Clone, Debug)]
pub struct CdnSettings {
    pub storage_zone: String,
    pub storage_endpoint: String,
    pub access_key: String,
    pub pull_zone_url: String,
    pub path_prefix: Option<String>,
    pub token_key: Option<String>,
    pub request_timeout: Duration,
}

/// Blob store on CDN edge storage.
pub struct CdnBackend {
    http: reqwest::Client,
    storage_base: String,
    access_key: String,
    pull_zone_url: String,
    path_prefix: String,
    token_key: Option<String>,
    timeout: Duration,
}

impl std::fmt::Debug for CdnBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdnBackend")
            .field("storage_base", &self.storage_base)
            .field("pull_zone_url", &self.pull_zone_url)
            .field("path_prefix", &self.path_prefix)
            .finish_non_exhaustive()
    }
}

impl CdnBackend {
    pub fn new(settings: CdnSettings) -> StorageResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| StorageError::Config(format!("failed to build HTTP client: {e}")))?;
        let storage_base = format!(
            "{}/{}",
            settings.storage_endpoint.trim_end_matches('/'),
            settings.storage_zone.trim_matches('/')
        );
        Ok(Self {
            http,
            storage_base,
            access_key: settings.access_key,
            pull_zone_url: settings.pull_zone_url.trim_end_matches('/').to_string(),
            path_prefix: settings
                .path_prefix
                .unwrap_or_default()
                .trim_matches('/')
                .to_string(),
            token_key: settings.token_key,
            timeout: settings.request_timeout,
        })
    }

    fn object_url(&self, key: &str) -> StorageResult<String> {
        if key.is_empty() || key.contains('/') || key.contains("..") {
            return Err(StorageError::InvalidKey(format!("invalid blob key: {key:?}")));
        }
        Ok(if self.path_prefix.is_empty() {
            format!("{}/{key}", self.storage_base)
        } else {
            format!("{}/{}/{key}", self.storage_base, self.path_prefix)
        })
    }

    async fn send(
        &self,
        operation: &'static str,
        method: Method,
        url: &str,
        body: Option<(Bytes, &str)>,
    ) -> StorageResult<reqwest::Response> {
        let mut request = self
            .http
            .request(method, url)
            .header("AccessKey", &self.access_key);
        if let Some((data, content_type)) = body {
            request = request
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .body(data);
        }
        request.send().await.map_err(|e| {
            if e.is_timeout() {
                StorageError::Timeout {
                    operation,
                    after: self.timeout,
                }
            } else {
                StorageError::Transport {
                    operation,
                    message: e.to_string(),
                }
            }
        })
    }
}

async fn http_error(operation: &'static str, response: reqwest::Response) -> StorageError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    StorageError::Http {
        operation,
        status,
        message,
    }
}

#[async_trait]
impl BlobStore for CdnBackend {
    #[instrument(skip(self, data), fields(backend = "cdn", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> StorageResult<()> {
        let url = self.object_url(key)?;
        with_timeout(self.timeout, "cdn.put", async {
            let response = self
                .send("cdn.put", Method::PUT, &url, Some((data, content_type)))
                .await?;
            if !response.status().is_success() {
                return Err(http_error("cdn.put", response).await);
            }
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), fields(backend = "cdn"))]
    async fn get(&self, key: &str) -> StorageResult<Option<Bytes>> {
        let url = self.object_url(key)?;
        with_timeout(self.timeout, "cdn.get", async {
            let response = self.send("cdn.get", Method::GET, &url, None).await?;
            match response.status() {
                StatusCode::NOT_FOUND => Ok(None),
                s if s.is_success() => {
                    let bytes = response.bytes().await.map_err(|e| StorageError::Transport {
                        operation: "cdn.get",
                        message: e.to_string(),
                    })?;
                    Ok(Some(bytes))
                }
                _ => Err(http_error("cdn.get", response).await),
            }
        })
        .await
    }

    #[instrument(skip(self), fields(backend = "cdn"))]
    async fn head(&self, key: &str) -> StorageResult<Option<ObjectMeta>> {
        let url = self.object_url(key)?;
        with_timeout(self.timeout, "cdn.head", async {
            let response = self.send("cdn.head", Method::HEAD, &url, None).await?;
            match response.status() {
                StatusCode::NOT_FOUND => Ok(None),
                s if s.is_success() => {
                    let headers = response.headers();
                    let header = |name: reqwest::header::HeaderName| {
                        headers.get(name).and_then(|v| v.to_str().ok())
                    };
                    Ok(Some(ObjectMeta {
                        size: header(reqwest::header::CONTENT_LENGTH)
                            .and_then(|v| v.parse().ok())
                            .unwrap_or(0),
                        last_modified: header(reqwest::header::LAST_MODIFIED)
                            .and_then(|v| OffsetDateTime::parse(v, &Rfc2822).ok()),
                        content_type: header(reqwest::header::CONTENT_TYPE).map(str::to_string),
                    }))
                }
                _ => Err(http_error("cdn.head", response).await),
            }
        })
        .await
    }

    #[instrument(skip(self), fields(backend = "cdn"))]
    async fn delete(&self, key: &str) -> StorageResult<DeleteOutcome> {
        let url = self.object_url(key)?;
        with_timeout(self.timeout, "cdn.delete", async {
            let response = self.send("cdn.delete", Method::DELETE, &url, None).await?;
            match response.status() {
                StatusCode::NOT_FOUND => Ok(DeleteOutcome::NotFound),
                s if s.is_success() => Ok(DeleteOutcome::Deleted),
                _ => Err(http_error("cdn.delete", response).await),
            }
        })
        .await
    }

    async fn generate_upload_url(&self, key: &str, _ttl: Duration) -> StorageResult<UploadTarget> {
        // The storage API key is account-wide and cannot be handed out.
        self.object_url(key)?;
        Ok(UploadTarget::Proxy)
    }

    async fn generate_download_url(
        &self,
        key: &str,
        ttl: Duration,
        options: &DownloadOptions,
    ) -> StorageResult<String> {
        self.object_url(key)?;
        let parts = UrlParts {
            base: self.pull_zone_url.clone(),
            path_prefix: self.path_prefix.clone(),
            blob_id: key.to_string(),
            file_name: options.file_name.clone(),
            extra_params: options.extra_params.clone(),
        };
        let expires = OffsetDateTime::now_utc().unix_timestamp() + ttl.as_secs() as i64;
        signing::build_url(&parts, self.token_key.as_deref().map(|k| (k, expires)))
    }

    fn backend_name(&self) -> &'static str {
        "cdn"
    }
}
