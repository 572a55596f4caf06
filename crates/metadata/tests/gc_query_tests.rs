//! GC find/delete queries, listing, stats and stored configuration.

mod common;

use common::{must_stat, open_store, pending_upload, pending_upload_at, put_file, ref_count, stat};
use stash_core::config::{GcConfig, OperatorFlags, PersistedConfig, StorageConfig};
use stash_core::{Basis, BlobId, CommitEntry, DestRef, FileAttributes, Op, PageOpts};
use stash_metadata::repos::{BlobRepo, ConfigRepo, FileRepo, GcRepo, JournalRepo, UploadRepo};
use stash_metadata::{MetadataError, RefcountDiscrepancy, SqliteStore, UploadRow};
use std::path::PathBuf;
use time::macros::datetime;
use time::{Duration, OffsetDateTime};

const T0: OffsetDateTime = datetime!(2030-01-01 12:00 UTC);
const MS: Duration = Duration::milliseconds(1);

async fn commit_at(store: &SqliteStore, path: &str, at: OffsetDateTime) -> BlobId {
    let blob = pending_upload_at(store, "text/plain", 10, at).await;
    store
        .commit_files(&[CommitEntry::new(path, blob.clone())], at)
        .await
        .unwrap();
    blob
}

async fn delete_at(store: &SqliteStore, path: &str, at: OffsetDateTime) {
    store
        .transact(
            &[Op::Delete {
                source: must_stat(store, path).await,
            }],
            at,
        )
        .await
        .unwrap();
}

fn filesystem_config(dir: &str) -> PersistedConfig {
    PersistedConfig {
        storage: StorageConfig::Filesystem {
            path: PathBuf::from(dir),
            public_base_url: None,
            signing_secret: None,
        },
        gc: GcConfig::default(),
    }
}

#[tokio::test]
async fn expired_uploads_use_strict_deadline() {
    let (_dir, store) = open_store().await;
    let blob = BlobId::generate();
    store
        .create_upload(&UploadRow::new(&blob, T0 - Duration::hours(1), T0))
        .await
        .unwrap();

    assert!(store.expired_uploads(T0, 100).await.unwrap().is_empty());
    let expired = store.expired_uploads(T0 + MS, 100).await.unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].id().unwrap(), blob);

    assert_eq!(store.delete_uploads(&[blob.clone()]).await.unwrap(), 1);
    assert_eq!(store.delete_uploads(&[blob]).await.unwrap(), 0);
    assert!(store.expired_uploads(T0 + MS, 100).await.unwrap().is_empty());
}

#[tokio::test]
async fn expired_uploads_respect_limit() {
    let (_dir, store) = open_store().await;
    for i in 0..5 {
        let blob = BlobId::generate();
        store
            .create_upload(&UploadRow::new(&blob, T0, T0 + Duration::minutes(i)))
            .await
            .unwrap();
    }
    let batch = store
        .expired_uploads(T0 + Duration::hours(1), 3)
        .await
        .unwrap();
    assert_eq!(batch.len(), 3);
    assert_eq!(batch[0].expires_at().unwrap(), T0);
}

#[tokio::test]
async fn orphaned_blob_needs_zero_refs_and_strictly_older_update() {
    let (_dir, store) = open_store().await;
    let kept = commit_at(&store, "/kept", T0).await;
    let orphan = commit_at(&store, "/orphan", T0).await;
    let released = T0 + Duration::minutes(5);
    delete_at(&store, "/orphan", released).await;

    let updated = store.get_blob(&orphan).await.unwrap().unwrap().updated_at().unwrap();
    assert_eq!(updated, released);

    assert!(store.orphaned_blobs(released, 100).await.unwrap().is_empty());
    let found = store.orphaned_blobs(released + MS, 100).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id().unwrap(), orphan);

    let deleted = store
        .delete_orphaned_blobs(&[orphan.clone(), kept.clone()], released + MS)
        .await
        .unwrap();
    assert_eq!(deleted, vec![orphan.clone()]);
    assert!(store.get_blob(&orphan).await.unwrap().is_none());
    assert_eq!(ref_count(&store, &kept).await, 1);
}

#[tokio::test]
async fn restore_between_find_and_delete_keeps_blob() {
    let (_dir, store) = open_store().await;
    let blob = commit_at(&store, "/a", T0).await;
    delete_at(&store, "/a", T0).await;

    let cutoff = T0 + Duration::hours(25);
    let candidates = store.orphaned_blobs(cutoff, 100).await.unwrap();
    assert_eq!(candidates.len(), 1);

    store.restore(&blob, "/a", T0 + Duration::hours(1)).await.unwrap();

    let deleted = store.delete_orphaned_blobs(&[blob.clone()], cutoff).await.unwrap();
    assert!(deleted.is_empty());
    assert_eq!(ref_count(&store, &blob).await, 1);
}

#[tokio::test]
async fn recently_released_blob_survives_delete_recheck() {
    let (_dir, store) = open_store().await;
    let blob = commit_at(&store, "/a", T0).await;
    delete_at(&store, "/a", T0).await;
    let cutoff = T0 + MS;
    assert_eq!(store.orphaned_blobs(cutoff, 100).await.unwrap().len(), 1);

    // Restored and released again after the scan.
    store.restore(&blob, "/a", T0 + Duration::hours(2)).await.unwrap();
    delete_at(&store, "/a", T0 + Duration::hours(2)).await;

    assert!(store.delete_orphaned_blobs(&[blob.clone()], cutoff).await.unwrap().is_empty());
    assert!(store.get_blob(&blob).await.unwrap().is_some());
}

#[tokio::test]
async fn expire_files_removes_only_strictly_past_expiry() {
    let (_dir, store) = open_store().await;
    let expiry = T0 + Duration::days(1);
    let blob = pending_upload_at(&store, "text/plain", 10, T0).await;
    store
        .commit_files(
            &[CommitEntry::new("/tmp/report", blob.clone())
                .with_attributes(FileAttributes::expiring_at(expiry))],
            T0,
        )
        .await
        .unwrap();
    let forever = commit_at(&store, "/keep", T0).await;

    assert!(store.expire_files(expiry, 100).await.unwrap().is_empty());

    let removed = store.expire_files(expiry + MS, 100).await.unwrap();
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].path, "/tmp/report");
    assert_eq!(removed[0].blob_id, blob);
    assert!(stat(&store, "/tmp/report").await.is_none());
    assert_eq!(ref_count(&store, &blob).await, 0);
    assert_eq!(ref_count(&store, &forever).await, 1);

    // The release stamps the blob, so blob GC waits a full grace period.
    let updated = store.get_blob(&blob).await.unwrap().unwrap().updated_at().unwrap();
    assert_eq!(updated, expiry + MS);
}

#[tokio::test]
async fn expiry_cleared_by_move() {
    let (_dir, store) = open_store().await;
    let blob = pending_upload_at(&store, "text/plain", 10, T0).await;
    store
        .commit_files(
            &[CommitEntry::new("/a", blob.clone())
                .with_attributes(FileAttributes::expiring_at(T0))],
            T0,
        )
        .await
        .unwrap();
    store
        .transact(
            &[Op::Move {
                source: must_stat(&store, "/a").await,
                dest: DestRef::new("/b", Basis::Overwrite),
            }],
            T0,
        )
        .await
        .unwrap();

    assert!(store.expire_files(T0 + Duration::days(1), 100).await.unwrap().is_empty());
    assert_eq!(must_stat(&store, "/b").await.blob_id, blob);
}

#[tokio::test]
async fn clear_files_in_batches() {
    let (_dir, store) = open_store().await;
    let shared = commit_at(&store, "/a", T0).await;
    store
        .transact(
            &[Op::Copy {
                source: must_stat(&store, "/a").await,
                dest: DestRef::new("/b", Basis::MustNotExist),
            }],
            T0,
        )
        .await
        .unwrap();
    commit_at(&store, "/c", T0).await;

    let first = store.clear_files(2, T0).await.unwrap();
    assert_eq!(
        first.iter().map(|f| f.path.as_str()).collect::<Vec<_>>(),
        vec!["/a", "/b"]
    );
    assert_eq!(ref_count(&store, &shared).await, 0);

    let second = store.clear_files(2, T0).await.unwrap();
    assert_eq!(second.len(), 1);
    assert!(store.clear_files(2, T0).await.unwrap().is_empty());
    assert_eq!(store.stats().await.unwrap().files, 0);
}

#[tokio::test]
async fn stats_count_records() {
    let (_dir, store) = open_store().await;
    commit_at(&store, "/a", T0).await;
    commit_at(&store, "/b", T0).await;
    delete_at(&store, "/b", T0).await;
    pending_upload(&store, "text/plain", 1).await;

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.files, 1);
    assert_eq!(stats.blobs, 2);
    assert_eq!(stats.orphaned_blobs, 1);
    assert_eq!(stats.pending_uploads, 1);
    assert_eq!(stats.referenced_bytes, 10);
}

#[tokio::test]
async fn audit_reports_drift_and_dangling_files() {
    let (_dir, store) = open_store().await;
    let healthy = put_file(&store, "/ok").await;
    let drifted = put_file(&store, "/drift").await;
    let dangling = put_file(&store, "/dangling").await;
    assert!(store.audit_refcounts().await.unwrap().is_empty());

    sqlx::query("UPDATE blobs SET ref_count = 3 WHERE blob_id = ?")
        .bind(drifted.as_str())
        .execute(store.pool())
        .await
        .unwrap();
    sqlx::query("DELETE FROM blobs WHERE blob_id = ?")
        .bind(dangling.as_str())
        .execute(store.pool())
        .await
        .unwrap();

    let report = store.audit_refcounts().await.unwrap();
    assert_eq!(
        report,
        vec![
            RefcountDiscrepancy {
                blob_id: drifted.to_string(),
                stored: Some(3),
                actual: 1,
            },
            RefcountDiscrepancy {
                blob_id: dangling.to_string(),
                stored: None,
                actual: 1,
            },
        ]
    );
    assert!(report.iter().all(|d| d.blob_id != healthy.as_str()));

    // A file whose blob record is gone cannot be read back.
    assert!(matches!(
        store.get_file("/dangling").await,
        Err(MetadataError::Invariant(_))
    ));
}

#[tokio::test]
async fn list_pages_through_prefix() {
    let (_dir, store) = open_store().await;
    for path in [
        "/uploads/a",
        "/uploads/b",
        "/uploads/c",
        "/uploads/sub/d",
        "/uploadsX",
        "/other",
    ] {
        put_file(&store, path).await;
    }

    let first = store
        .list_files(Some("/uploads/"), &PageOpts::first(2))
        .await
        .unwrap();
    assert_eq!(
        first.page.iter().map(|f| f.path.as_str()).collect::<Vec<_>>(),
        vec!["/uploads/a", "/uploads/b"]
    );
    assert!(!first.is_done);

    let second = store
        .list_files(
            Some("/uploads/"),
            &PageOpts::next(2, first.continue_cursor.clone()),
        )
        .await
        .unwrap();
    assert_eq!(
        second.page.iter().map(|f| f.path.as_str()).collect::<Vec<_>>(),
        vec!["/uploads/c", "/uploads/sub/d"]
    );
    assert!(second.is_done);

    let third = store
        .list_files(Some("/uploads/"), &PageOpts::next(2, second.continue_cursor.clone()))
        .await
        .unwrap();
    assert!(third.page.is_empty());
    assert!(third.is_done);
    assert_eq!(third.continue_cursor, second.continue_cursor);

    let everything = store.list_files(None, &PageOpts::first(100)).await.unwrap();
    assert_eq!(everything.page.len(), 6);
    assert_eq!(everything.page[0].path, "/other");
    assert!(everything.is_done);

    let empty_prefix = store.list_files(Some(""), &PageOpts::first(100)).await.unwrap();
    assert_eq!(empty_prefix.page.len(), 6);
}

#[tokio::test]
async fn prefix_listing_includes_four_byte_characters() {
    let (_dir, store) = open_store().await;
    for path in [
        "/uploads/a",
        "/uploads/\u{FFFF}",
        "/uploads/\u{1F600}.png",
        "/uploads/\u{20000}/deep",
        "/uploads0",
    ] {
        put_file(&store, path).await;
    }

    let everything = store.list_files(None, &PageOpts::first(100)).await.unwrap();
    let prefixed = store
        .list_files(Some("/uploads/"), &PageOpts::first(100))
        .await
        .unwrap();
    assert_eq!(
        prefixed.page.iter().map(|f| f.path.as_str()).collect::<Vec<_>>(),
        vec![
            "/uploads/a",
            "/uploads/\u{FFFF}",
            "/uploads/\u{1F600}.png",
            "/uploads/\u{20000}/deep",
        ]
    );
    assert_eq!(everything.page.len(), prefixed.page.len() + 1);

    // Paging across the four-byte entries neither skips nor repeats.
    let mut seen = Vec::new();
    let mut opts = PageOpts::first(1);
    loop {
        let page = store.list_files(Some("/uploads/"), &opts).await.unwrap();
        seen.extend(page.page.into_iter().map(|f| f.path));
        if page.is_done {
            break;
        }
        opts = PageOpts::next(1, page.continue_cursor);
    }
    assert_eq!(seen.len(), 4);
}

#[tokio::test]
async fn stored_config_versions_and_flags() {
    let (_dir, store) = open_store().await;
    assert!(matches!(
        store.set_operator_flags(OperatorFlags::default(), T0).await,
        Err(MetadataError::NotFound(_))
    ));

    let first = store.store_config(&filesystem_config("/srv/a"), T0).await.unwrap();
    assert_eq!(first.version, 1);
    assert_eq!(first.flags(), OperatorFlags::default());

    let unchanged = store.store_config(&filesystem_config("/srv/a"), T0).await.unwrap();
    assert_eq!(unchanged.version, 1);

    let flags = OperatorFlags {
        freeze_gc: true,
        allow_clear_all_files: true,
    };
    store.set_operator_flags(flags, T0).await.unwrap();

    let second = store.store_config(&filesystem_config("/srv/b"), T0).await.unwrap();
    assert_eq!(second.version, 2);
    assert_eq!(second.flags(), flags);
    assert_eq!(second.config().unwrap(), filesystem_config("/srv/b"));

    let read = store.get_stored_config().await.unwrap().unwrap();
    assert_eq!(read.version, 2);
    assert!(read.freeze_gc);
}
