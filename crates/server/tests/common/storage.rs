//! In-memory blob store that records deletes and fails on request.

use async_trait::async_trait;
use bytes::Bytes;
use stash_storage::{
    BlobStore, DeleteOutcome, DownloadOptions, ObjectMeta, StorageError, StorageResult,
    UploadTarget,
};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
#[derive(Default)]
pub struct MockBlobStore {
    objects: Mutex<HashMap<String, (Bytes, String)>>,
    deletes: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    presign: bool,
}

#[allow(dead_code)]
impl MockBlobStore {
    /// A store that requires proxy uploads.
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that hands out presigned upload URLs.
    pub fn presigning() -> Self {
        Self {
            presign: true,
            ..Self::default()
        }
    }

    /// Place an object directly, as a presigned PUT would.
    pub fn insert(&self, key: &str, data: &[u8], content_type: &str) {
        self.objects.lock().unwrap().insert(
            key.to_string(),
            (Bytes::copy_from_slice(data), content_type.to_string()),
        );
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    /// Make deletes of `key` fail with a transport error.
    pub fn fail_deletes_of(&self, key: &str) {
        self.failing.lock().unwrap().insert(key.to_string());
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    /// Every key a delete was attempted on, in order.
    pub fn delete_calls(&self) -> Vec<String> {
        self.deletes.lock().unwrap().clone()
    }
}

#[async_trait]
impl BlobStore for MockBlobStore {
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> StorageResult<()> {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (data, content_type.to_string()));
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Bytes>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .map(|(data, _)| data.clone()))
    }

    async fn head(&self, key: &str) -> StorageResult<Option<ObjectMeta>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .map(|(data, content_type)| ObjectMeta {
                size: data.len() as u64,
                last_modified: None,
                content_type: Some(content_type.clone()),
            }))
    }

    async fn delete(&self, key: &str) -> StorageResult<DeleteOutcome> {
        self.deletes.lock().unwrap().push(key.to_string());
        if self.failing.lock().unwrap().contains(key) {
            return Err(StorageError::Http {
                operation: "delete",
                status: 503,
                message: "injected failure".to_string(),
            });
        }
        Ok(match self.objects.lock().unwrap().remove(key) {
            Some(_) => DeleteOutcome::Deleted,
            None => DeleteOutcome::NotFound,
        })
    }

    async fn generate_upload_url(&self, key: &str, _ttl: Duration) -> StorageResult<UploadTarget> {
        if self.presign {
            Ok(UploadTarget::Presigned {
                url: format!("https://mock.invalid/upload/{key}"),
            })
        } else {
            Ok(UploadTarget::Proxy)
        }
    }

    async fn generate_download_url(
        &self,
        key: &str,
        ttl: Duration,
        options: &DownloadOptions,
    ) -> StorageResult<String> {
        let mut url = format!("https://mock.invalid/download/{key}?ttl={}", ttl.as_secs());
        for (name, value) in &options.extra_params {
            url.push_str(&format!("&{name}={value}"));
        }
        Ok(url)
    }

    fn backend_name(&self) -> &'static str {
        "mock"
    }
}
