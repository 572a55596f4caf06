//! Garbage collection against a real metadata store and a mock blob store.

mod common;

use common::{Harness, MockBlobStore};
use stash_core::{BlobId, CommitEntry, FileAttributes, Op};
use stash_metadata::UploadRow;
use stash_metadata::repos::{BlobRepo, FileRepo, JournalRepo, UploadRepo};
use stash_server::{GcKind, SkipReason, UPLOAD_GRACE_PERIOD};
use time::macros::datetime;
use time::{Duration, OffsetDateTime};

const T0: OffsetDateTime = datetime!(2030-06-01 12:00 UTC);

async fn expired_upload(h: &Harness, expires_at: OffsetDateTime, with_bytes: bool) -> BlobId {
    let blob_id = BlobId::generate();
    h.metadata
        .create_upload(&UploadRow::new(
            &blob_id,
            expires_at - Duration::hours(1),
            expires_at,
        ))
        .await
        .unwrap();
    if with_bytes {
        h.blobs.insert(blob_id.as_str(), b"partial", "text/plain");
    }
    blob_id
}

/// Commit a blob at `path`, then delete the file at `released` so the blob
/// is orphaned with a known `updated_at`.
async fn orphan_blob(h: &Harness, path: &str, released: OffsetDateTime) -> BlobId {
    let blob_id = h.put(path, b"orphan").await;
    let source = h.metadata.get_file(path).await.unwrap().unwrap();
    h.metadata
        .transact(&[Op::Delete { source }], released)
        .await
        .unwrap();
    blob_id
}

#[tokio::test]
async fn upload_gc_respects_grace_window() {
    let h = Harness::new().await;
    let stale = expired_upload(&h, T0 - UPLOAD_GRACE_PERIOD - Duration::seconds(1), true).await;
    let fresh = expired_upload(&h, T0 - UPLOAD_GRACE_PERIOD + Duration::seconds(1), true).await;

    let report = h.gc.run_batch_at(GcKind::Upload, T0).await.unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.deleted, 1);
    assert_eq!(report.errors, 0);
    assert!(!report.should_continue());

    assert!(h.metadata.get_upload(&stale).await.unwrap().is_none());
    assert!(!h.blobs.contains(stale.as_str()));
    assert!(h.metadata.get_upload(&fresh).await.unwrap().is_some());
    assert!(h.blobs.contains(fresh.as_str()));
}

#[tokio::test]
async fn upload_without_bytes_counts_as_not_found() {
    let h = Harness::new().await;
    let never_landed = expired_upload(&h, T0 - Duration::days(1), false).await;

    let report = h.gc.run_batch_at(GcKind::Upload, T0).await.unwrap();
    assert_eq!(report.not_found, 1);
    assert_eq!(report.deleted, 0);
    assert!(h.metadata.get_upload(&never_landed).await.unwrap().is_none());
}

#[tokio::test]
async fn backend_error_keeps_record_and_stops_rescheduling() {
    let h = Harness::with_batch_size(2).await;
    let ok = expired_upload(&h, T0 - Duration::days(1), true).await;
    let broken = expired_upload(&h, T0 - Duration::days(1), true).await;
    h.blobs.fail_deletes_of(broken.as_str());

    let report = h.gc.run_batch_at(GcKind::Upload, T0).await.unwrap();
    assert_eq!(report.scanned, 2);
    assert!(report.is_full());
    assert_eq!(report.errors, 1);
    assert!(!report.should_continue());
    assert!(h.metadata.get_upload(&ok).await.unwrap().is_none());
    assert!(h.metadata.get_upload(&broken).await.unwrap().is_some());

    h.blobs.heal();
    let retry = h.gc.run_batch_at(GcKind::Upload, T0).await.unwrap();
    assert_eq!(retry.deleted, 1);
    assert!(h.metadata.get_upload(&broken).await.unwrap().is_none());
}

#[tokio::test]
async fn full_batches_are_followed_up() {
    let h = Harness::with_batch_size(2).await;
    for _ in 0..3 {
        expired_upload(&h, T0 - Duration::days(1), true).await;
    }

    let first = h.gc.run_batch_at(GcKind::Upload, T0).await.unwrap();
    assert!(first.should_continue());

    let summary = h
        .gc
        .run_until_drained_at(GcKind::Upload, 10, T0)
        .await
        .unwrap();
    assert_eq!(summary.batches, 1);
    assert_eq!(summary.scanned, 1);
}

#[tokio::test]
async fn drain_stops_at_batch_cap() {
    let h = Harness::with_batch_size(1).await;
    for _ in 0..5 {
        expired_upload(&h, T0 - Duration::days(1), true).await;
    }
    let summary = h
        .gc
        .run_until_drained_at(GcKind::Upload, 3, T0)
        .await
        .unwrap();
    assert_eq!(summary.batches, 3);
    assert_eq!(summary.deleted, 3);
    assert_eq!(h.fs.stats().await.unwrap().pending_uploads, 2);
}

#[tokio::test]
async fn blob_gc_boundary_is_strict() {
    let h = Harness::new().await;
    let blob = orphan_blob(&h, "/a", T0).await;
    let grace = Duration::hours(24);

    let at_threshold = h.gc.run_batch_at(GcKind::Blob, T0 + grace).await.unwrap();
    assert_eq!(at_threshold.scanned, 0);
    assert!(h.blobs.contains(blob.as_str()));

    let past = h
        .gc
        .run_batch_at(GcKind::Blob, T0 + grace + Duration::milliseconds(1))
        .await
        .unwrap();
    assert_eq!(past.deleted, 1);
    assert!(!h.blobs.contains(blob.as_str()));
    assert!(h.metadata.get_blob(&blob).await.unwrap().is_none());
}

#[tokio::test]
async fn referenced_blobs_are_never_collected() {
    let h = Harness::new().await;
    let live = h.put("/live", b"data").await;
    let report = h
        .gc
        .run_batch_at(GcKind::Blob, OffsetDateTime::now_utc() + Duration::days(365))
        .await
        .unwrap();
    assert_eq!(report.scanned, 0);
    assert!(h.blobs.delete_calls().is_empty());
    assert!(h.blobs.contains(live.as_str()));
}

#[tokio::test]
async fn blob_record_kept_until_bytes_are_confirmed_gone() {
    let h = Harness::new().await;
    let blob = orphan_blob(&h, "/a", T0).await;
    h.blobs.fail_deletes_of(blob.as_str());
    let later = T0 + Duration::days(2);

    let report = h.gc.run_batch_at(GcKind::Blob, later).await.unwrap();
    assert_eq!(report.errors, 1);
    assert!(h.metadata.get_blob(&blob).await.unwrap().is_some());

    h.blobs.heal();
    let report = h.gc.run_batch_at(GcKind::Blob, later).await.unwrap();
    assert_eq!(report.deleted, 1);
    assert!(h.metadata.get_blob(&blob).await.unwrap().is_none());
}

#[tokio::test]
async fn restored_blob_survives() {
    let h = Harness::new().await;
    let blob = orphan_blob(&h, "/a", T0).await;
    h.fs.restore(&blob, "/recovered").await.unwrap();

    let report = h
        .gc
        .run_batch_at(GcKind::Blob, T0 + Duration::days(2))
        .await
        .unwrap();
    assert_eq!(report.scanned, 0);
    assert!(h.blobs.contains(blob.as_str()));
}

#[tokio::test]
async fn file_expiry_releases_reference_without_touching_bytes() {
    let h = Harness::new().await;
    let expiry = T0;
    let blob = h
        .fs
        .upload_blob(bytes::Bytes::from_static(b"temp"), "text/plain")
        .await
        .unwrap();
    h.fs
        .commit_files(&[CommitEntry::new("/tmp/x", blob.clone())
            .with_attributes(FileAttributes::expiring_at(expiry))])
        .await
        .unwrap();

    let report = h
        .gc
        .run_batch_at(GcKind::File, expiry + Duration::milliseconds(1))
        .await
        .unwrap();
    assert_eq!(report.deleted, 1);
    assert!(h.fs.stat("/tmp/x").await.unwrap().is_none());
    assert_eq!(h.metadata.get_blob(&blob).await.unwrap().unwrap().ref_count, 0);
    assert!(h.blobs.contains(blob.as_str()));
    assert!(h.blobs.delete_calls().is_empty());
}

#[tokio::test]
async fn freeze_stops_storage_gc_but_not_file_expiry() {
    let h = Harness::new().await;
    expired_upload(&h, T0 - Duration::days(1), true).await;
    let orphan = orphan_blob(&h, "/orphan", T0 - Duration::days(3)).await;
    let blob = h
        .fs
        .upload_blob(bytes::Bytes::from_static(b"temp"), "text/plain")
        .await
        .unwrap();
    h.fs
        .commit_files(&[CommitEntry::new("/expiring", blob)
            .with_attributes(FileAttributes::expiring_at(T0 - Duration::days(1)))])
        .await
        .unwrap();
    h.set_flags(true, false).await;

    for kind in [GcKind::Upload, GcKind::Blob] {
        let report = h.gc.run_batch_at(kind, T0).await.unwrap();
        assert_eq!(report.skipped, Some(SkipReason::Frozen), "{kind}");
        assert!(!report.should_continue());
    }
    assert!(h.blobs.delete_calls().is_empty());
    assert!(h.metadata.get_blob(&orphan).await.unwrap().is_some());

    let files = h.gc.run_batch_at(GcKind::File, T0).await.unwrap();
    assert_eq!(files.skipped, None);
    assert_eq!(files.deleted, 1);
    assert!(h.fs.stat("/expiring").await.unwrap().is_none());
}

#[tokio::test]
async fn unconfigured_system_skips_everything() {
    let h = Harness::unconfigured().await;
    for kind in GcKind::ALL {
        let report = h.gc.run_batch_at(kind, T0).await.unwrap();
        assert_eq!(report.skipped, Some(SkipReason::Unconfigured));
        assert_eq!(report.scanned, 0);
    }
}

#[tokio::test]
async fn presigned_slot_that_never_landed_is_reclaimed() {
    let h = Harness::with_blob_store(MockBlobStore::presigning()).await;
    let handle = h.fs.generate_upload_url().await.unwrap();

    let after_deadline = handle.expires_at + UPLOAD_GRACE_PERIOD + Duration::seconds(1);
    let report = h
        .gc
        .run_batch_at(GcKind::Upload, after_deadline)
        .await
        .unwrap();
    assert_eq!(report.not_found, 1);
    assert_eq!(h.blobs.delete_calls(), vec![handle.blob_id.to_string()]);
    assert!(h.metadata.get_upload(&handle.blob_id).await.unwrap().is_none());
}
