//! S3-compatible blob store using the AWS SDK.

use crate::backends::with_timeout;
use crate::error::{StorageError, StorageResult};
use crate::traits::{BlobStore, DeleteOutcome, DownloadOptions, ObjectMeta, UploadTarget};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::ProvideCredentials;
use aws_credential_types::provider::error::CredentialsError;
use aws_credential_types::provider::future::ProvideCredentials as ProvideCredentialsFuture;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_smithy_http_client::Builder as SmithyHttpClientBuilder;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::instrument;

/// Marker included in lazy-credentials errors so they map to configuration
/// errors instead of generic transport failures.
const CREDENTIALS_INIT_ERROR_MARKER: &str = "stash-s3-lazy-credentials-init";
const CREDENTIALS_RESOLVE_ERROR_MARKER: &str = "stash-s3-lazy-credentials-resolve";

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Lazily initializes the AWS default credentials chain on first signed request.
#[derive(Debug)]
struct LazyDefaultCredentialsProvider {
    region: String,
    chain: OnceCell<aws_config::default_provider::credentials::DefaultCredentialsChain>,
}

impl LazyDefaultCredentialsProvider {
    fn new(region: String) -> Self {
        Self {
            region,
            chain: OnceCell::new(),
        }
    }

    async fn chain(
        &self,
    ) -> Result<&aws_config::default_provider::credentials::DefaultCredentialsChain, CredentialsError>
    {
        self.chain
            .get_or_try_init(|| async {
                let region = aws_config::Region::new(self.region.clone());
                tokio::task::spawn(async move {
                    aws_config::default_provider::credentials::DefaultCredentialsChain::builder()
                        .region(region)
                        .build()
                        .await
                })
                .await
                .map_err(|join_err| {
                    CredentialsError::provider_error(format!(
                        "{CREDENTIALS_INIT_ERROR_MARKER}: failed to initialize AWS default credential chain: {join_err}"
                    ))
                })
            })
            .await
    }

    async fn credentials(&self) -> aws_credential_types::provider::Result {
        let chain = self.chain().await?;
        chain.provide_credentials().await.map_err(|err| {
            CredentialsError::provider_error(format!(
                "{CREDENTIALS_RESOLVE_ERROR_MARKER}: default AWS credentials resolution failed: {err}"
            ))
        })
    }
}

impl ProvideCredentials for LazyDefaultCredentialsProvider {
    fn provide_credentials<'a>(&'a self) -> ProvideCredentialsFuture<'a>
    where
        Self: 'a,
    {
        ProvideCredentialsFuture::new(self.credentials())
    }
}

fn map_s3_error<E>(err: SdkError<E>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let err_text = err.to_string();
    if err_text.contains(CREDENTIALS_INIT_ERROR_MARKER)
        || err_text.contains(CREDENTIALS_RESOLVE_ERROR_MARKER)
    {
        return StorageError::Config(
            "S3 credential initialization failed. Configure AWS credentials explicitly or ensure ambient AWS credentials are available."
                .to_string(),
        );
    }
    StorageError::S3(Box::new(err))
}

fn is_not_found<E>(err: &SdkError<E>) -> bool {
    matches!(err, SdkError::ServiceError(service_err) if service_err.raw().status().as_u16() == 404)
}

/// Connection settings for [`S3Backend::new`].
#[derive(Clone, Debug, Default)]
pub struct S3Settings {
    pub bucket: String,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub prefix: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Path-style URLs (`endpoint/bucket/key`), required by MinIO and some
    /// S3-compatible services.
    pub force_path_style: bool,
    pub request_timeout: Duration,
}

/// S3-compatible blob store with presigned upload and download URLs.
pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: Option<String>,
    timeout: Duration,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Create a new S3 backend. No network calls are made here.
    pub fn new(settings: S3Settings) -> StorageResult<Self> {
        if settings.access_key_id.is_some() ^ settings.secret_access_key.is_some() {
            return Err(StorageError::Config(
                "s3 config requires both access_key_id and secret_access_key when either is set"
                    .to_string(),
            ));
        }

        let resolved_region = settings.region.unwrap_or_else(|| "us-east-1".to_string());
        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(resolved_region.clone()));

        if let (Some(key_id), Some(secret)) = (settings.access_key_id, settings.secret_access_key)
        {
            let credentials =
                aws_sdk_s3::config::Credentials::new(key_id, secret, None, None, "stash-config");
            builder = builder.credentials_provider(credentials);
        } else {
            builder = builder
                .credentials_provider(LazyDefaultCredentialsProvider::new(resolved_region));
        }

        if let Some(endpoint) = &settings.endpoint {
            // Bare host:port endpoints (e.g. "minio:9000") default to http.
            let lower = endpoint.to_ascii_lowercase();
            let endpoint = if lower.starts_with("http://") || lower.starts_with("https://") {
                endpoint.clone()
            } else {
                format!("http://{endpoint}")
            };
            if endpoint.to_ascii_lowercase().starts_with("http://") {
                builder = builder.http_client(SmithyHttpClientBuilder::new().build_http());
            }
            builder = builder.endpoint_url(endpoint);
        }

        if settings.force_path_style {
            builder = builder.force_path_style(true);
        }

        let prefix = settings
            .prefix
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty());

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: settings.bucket,
            prefix,
            timeout: settings.request_timeout,
        })
    }

    fn full_key(&self, key: &str) -> StorageResult<String> {
        if key.is_empty() || key.contains('/') {
            return Err(StorageError::InvalidKey(format!("invalid blob key: {key:?}")));
        }
        Ok(match &self.prefix {
            Some(prefix) => format!("{prefix}/{key}"),
            None => key.to_string(),
        })
    }

    fn presigning_config(ttl: Duration) -> StorageResult<PresigningConfig> {
        PresigningConfig::expires_in(ttl)
            .map_err(|e| StorageError::Config(format!("invalid presign ttl {ttl:?}: {e}")))
    }

    async fn head_inner(&self, full_key: &str) -> StorageResult<Option<ObjectMeta>> {
        let output = match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(full_key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(err) if is_not_found(&err) => return Ok(None),
            Err(err) => return Err(map_s3_error(err)),
        };

        let last_modified = output.last_modified().and_then(|dt| {
            time::OffsetDateTime::from_unix_timestamp(dt.secs())
                .inspect_err(|e| {
                    tracing::warn!(key = %full_key, timestamp = dt.secs(), error = %e, "Failed to convert S3 timestamp");
                })
                .ok()
        });

        Ok(Some(ObjectMeta {
            size: output.content_length().unwrap_or(0).max(0) as u64,
            last_modified,
            content_type: output.content_type().map(str::to_string),
        }))
    }
}

#[async_trait]
impl BlobStore for S3Backend {
    #[instrument(skip(self, data), fields(backend = "s3", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> StorageResult<()> {
        let full_key = self.full_key(key)?;
        with_timeout(self.timeout, "s3.put", async {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&full_key)
                .content_type(content_type)
                .body(data.into())
                .send()
                .await
                .map_err(map_s3_error)?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get(&self, key: &str) -> StorageResult<Option<Bytes>> {
        let full_key = self.full_key(key)?;
        with_timeout(self.timeout, "s3.get", async {
            let output = match self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&full_key)
                .send()
                .await
            {
                Ok(output) => output,
                Err(err) if is_not_found(&err) => return Ok(None),
                Err(err) => return Err(map_s3_error(err)),
            };
            let bytes = output
                .body
                .collect()
                .await
                .map_err(|e| StorageError::S3(Box::new(e)))?
                .into_bytes();
            Ok(Some(bytes))
        })
        .await
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn head(&self, key: &str) -> StorageResult<Option<ObjectMeta>> {
        let full_key = self.full_key(key)?;
        with_timeout(self.timeout, "s3.head", self.head_inner(&full_key)).await
    }

    /// S3 deletes succeed on missing keys, so a head request runs first to
    /// report `NotFound`.
    #[instrument(skip(self), fields(backend = "s3"))]
    async fn delete(&self, key: &str) -> StorageResult<DeleteOutcome> {
        let full_key = self.full_key(key)?;
        with_timeout(self.timeout, "s3.delete", async {
            if self.head_inner(&full_key).await?.is_none() {
                return Ok(DeleteOutcome::NotFound);
            }
            match self
                .client
                .delete_object()
                .bucket(&self.bucket)
                .key(&full_key)
                .send()
                .await
            {
                Ok(_) => Ok(DeleteOutcome::Deleted),
                Err(err) if is_not_found(&err) => Ok(DeleteOutcome::NotFound),
                Err(err) => Err(map_s3_error(err)),
            }
        })
        .await
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn generate_upload_url(&self, key: &str, ttl: Duration) -> StorageResult<UploadTarget> {
        let full_key = self.full_key(key)?;
        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .presigned(Self::presigning_config(ttl)?)
            .await
            .map_err(map_s3_error)?;
        Ok(UploadTarget::Presigned {
            url: presigned.uri().to_string(),
        })
    }

    #[instrument(skip(self, options), fields(backend = "s3"))]
    async fn generate_download_url(
        &self,
        key: &str,
        ttl: Duration,
        options: &DownloadOptions,
    ) -> StorageResult<String> {
        let full_key = self.full_key(key)?;
        let mut request = self.client.get_object().bucket(&self.bucket).key(&full_key);

        if let Some(name) = &options.file_name {
            let escaped = name.replace('\\', "\\\\").replace('"', "\\\"");
            request = request.response_content_disposition(format!("inline; filename=\"{escaped}\""));
        }
        for (k, v) in &options.extra_params {
            request = match k.as_str() {
                "response-content-type" => request.response_content_type(v),
                "response-content-disposition" => request.response_content_disposition(v),
                "response-cache-control" => request.response_cache_control(v),
                "response-content-language" => request.response_content_language(v),
                "response-content-encoding" => request.response_content_encoding(v),
                other => {
                    return Err(StorageError::Unsupported {
                        backend: "s3",
                        message: format!("query parameter '{other}' cannot be presigned"),
                    });
                }
            };
        }

        let presigned = request
            .presigned(Self::presigning_config(ttl)?)
            .await
            .map_err(map_s3_error)?;
        Ok(presigned.uri().to_string())
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn health_check(&self) -> StorageResult<()> {
        with_timeout(HEALTH_CHECK_TIMEOUT, "s3.health_check", async {
            self.client
                .head_bucket()
                .bucket(&self.bucket)
                .send()
                .await
                .map_err(map_s3_error)?;
            Ok(())
        })
        .await
    }
}
