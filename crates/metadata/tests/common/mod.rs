#![allow(dead_code)]

use stash_core::{BlobId, CommitEntry, FileMetadata};
use stash_metadata::repos::{BlobRepo, FileRepo, JournalRepo, UploadRepo};
use stash_metadata::{SqliteStore, UploadRow};
use tempfile::TempDir;
use time::{Duration, OffsetDateTime};

/// Fresh store in a temporary directory. Keep the `TempDir` alive for the
/// duration of the test.
pub async fn open_store() -> (TempDir, SqliteStore) {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::new(dir.path().join("metadata.db"), None)
        .await
        .unwrap();
    (dir, store)
}

/// Register a finalized pending upload and return its id.
pub async fn pending_upload(store: &SqliteStore, content_type: &str, size: u64) -> BlobId {
    pending_upload_at(store, content_type, size, OffsetDateTime::now_utc()).await
}

/// Like [`pending_upload`], issued at `at` with a one hour deadline.
pub async fn pending_upload_at(
    store: &SqliteStore,
    content_type: &str,
    size: u64,
    at: OffsetDateTime,
) -> BlobId {
    let blob_id = BlobId::generate();
    let upload =
        UploadRow::new(&blob_id, at, at + Duration::hours(1)).with_content(content_type, size);
    store.create_upload(&upload).await.unwrap();
    blob_id
}

/// Commit a new blob at `path`, overwriting whatever is there.
pub async fn put_file(store: &SqliteStore, path: &str) -> BlobId {
    let blob_id = pending_upload(store, "text/plain", 11).await;
    store
        .commit_files(
            &[CommitEntry::new(path, blob_id.clone())],
            OffsetDateTime::now_utc(),
        )
        .await
        .unwrap();
    blob_id
}

pub async fn stat(store: &SqliteStore, path: &str) -> Option<FileMetadata> {
    store.get_file(path).await.unwrap()
}

pub async fn must_stat(store: &SqliteStore, path: &str) -> FileMetadata {
    stat(store, path)
        .await
        .unwrap_or_else(|| panic!("expected a file at {path}"))
}

pub async fn ref_count(store: &SqliteStore, blob_id: &BlobId) -> i64 {
    store
        .get_blob(blob_id)
        .await
        .unwrap()
        .unwrap_or_else(|| panic!("expected a blob record for {blob_id}"))
        .ref_count
}

/// Every file and blob in the store, for before/after comparisons.
pub async fn snapshot(store: &SqliteStore) -> (Vec<(String, String, Option<i64>)>, Vec<(String, i64)>) {
    let files = sqlx::query_as("SELECT path, blob_id, expires_at FROM files ORDER BY path")
        .fetch_all(store.pool())
        .await
        .unwrap();
    let blobs = sqlx::query_as("SELECT blob_id, ref_count FROM blobs ORDER BY blob_id")
        .fetch_all(store.pool())
        .await
        .unwrap();
    (files, blobs)
}
