//! Garbage collection of pending uploads, orphaned blobs and expired files.
//!
//! Each batch follows the same shape: find a bounded set of candidates
//! (metadata read), delete their bytes from the blob store (no transaction
//! held), then delete only the records whose bytes are confirmed gone
//! (short metadata write). A crash between the last two steps leaves a
//! record pointing at missing bytes, which the next pass treats as
//! not-found.

use crate::error::FsResult;
use crate::metrics;
use futures::StreamExt;
use stash_core::BlobId;
use stash_core::config::PersistedConfig;
use stash_metadata::repos::{ConfigRepo, GcRepo};
use stash_metadata::{MetadataStore, StoredConfigRow};
use stash_storage::{BlobStore, DeleteOutcome};
use std::fmt;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;

/// How long past its deadline a pending upload is kept, to absorb clock
/// skew and uploads still in flight.
pub const UPLOAD_GRACE_PERIOD: Duration = Duration::hours(1);

/// Blob store deletes in flight at once within one batch.
const DELETE_CONCURRENCY: usize = 8;

/// The three independent GC lifecycles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GcKind {
    Upload,
    Blob,
    File,
}

impl GcKind {
    pub const ALL: [GcKind; 3] = [GcKind::Upload, GcKind::Blob, GcKind::File];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Blob => "blob",
            Self::File => "file",
        }
    }

    /// File expiry never touches the blob store, so it runs while GC is
    /// frozen.
    pub fn honors_freeze(&self) -> bool {
        !matches!(self, Self::File)
    }
}

impl fmt::Display for GcKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for GcKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upload" => Ok(Self::Upload),
            "blob" => Ok(Self::Blob),
            "file" => Ok(Self::File),
            other => Err(format!("unknown gc kind: {other}")),
        }
    }
}

/// Why a batch did nothing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// No configuration was ever stored; the system has not been used.
    Unconfigured,
    /// The operator set `freeze_gc`.
    Frozen,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unconfigured => "unconfigured",
            Self::Frozen => "frozen",
        }
    }
}

/// Outcome of one GC batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GcBatchReport {
    pub kind: GcKind,
    /// Candidates found.
    pub scanned: usize,
    /// Records removed after the blob store confirmed a delete.
    pub deleted: usize,
    /// Records removed whose bytes were already absent.
    pub not_found: usize,
    /// Candidates left in place because the blob store failed.
    pub errors: usize,
    pub skipped: Option<SkipReason>,
    batch_size: u32,
}

impl GcBatchReport {
    fn new(kind: GcKind, batch_size: u32) -> Self {
        Self {
            kind,
            scanned: 0,
            deleted: 0,
            not_found: 0,
            errors: 0,
            skipped: None,
            batch_size,
        }
    }

    fn skipped(kind: GcKind, reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::new(kind, 0)
        }
    }

    /// The batch came back full.
    pub fn is_full(&self) -> bool {
        self.batch_size > 0 && self.scanned >= self.batch_size as usize
    }

    /// Run another batch right away: the last one was full and the blob store
    /// reported no errors.
    pub fn should_continue(&self) -> bool {
        self.skipped.is_none() && self.is_full() && self.errors == 0
    }
}

/// Totals over the batches of one kind within a tick.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GcRunSummary {
    pub kind: GcKind,
    pub batches: u32,
    pub scanned: usize,
    pub deleted: usize,
    pub not_found: usize,
    pub errors: usize,
    pub skipped: Option<SkipReason>,
}

impl GcRunSummary {
    fn new(kind: GcKind) -> Self {
        Self {
            kind,
            batches: 0,
            scanned: 0,
            deleted: 0,
            not_found: 0,
            errors: 0,
            skipped: None,
        }
    }

    fn absorb(&mut self, report: &GcBatchReport) {
        self.batches += 1;
        self.scanned += report.scanned;
        self.deleted += report.deleted;
        self.not_found += report.not_found;
        self.errors += report.errors;
        self.skipped = report.skipped;
    }
}

struct CachedBackend {
    version: i64,
    store: Arc<dyn BlobStore>,
}

enum BackendSource {
    /// Built from the stored configuration, rebuilt when its version changes.
    Stored(Mutex<Option<CachedBackend>>),
    Fixed(Arc<dyn BlobStore>),
}

/// Runs GC batches against the stored configuration.
pub struct GarbageCollector {
    metadata: Arc<dyn MetadataStore>,
    backend: BackendSource,
}

impl GarbageCollector {
    /// Collector that builds its blob store from the stored configuration.
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        Self {
            metadata,
            backend: BackendSource::Stored(Mutex::new(None)),
        }
    }

    /// Collector that always deletes through `store`. Flags and tunables are
    /// still read from the stored configuration.
    pub fn with_blob_store(metadata: Arc<dyn MetadataStore>, store: Arc<dyn BlobStore>) -> Self {
        Self {
            metadata,
            backend: BackendSource::Fixed(store),
        }
    }

    async fn blob_store(
        &self,
        row: &StoredConfigRow,
        config: &PersistedConfig,
    ) -> FsResult<Arc<dyn BlobStore>> {
        match &self.backend {
            BackendSource::Fixed(store) => Ok(store.clone()),
            BackendSource::Stored(cache) => {
                let mut cache = cache.lock().await;
                if let Some(cached) = cache.as_ref()
                    && cached.version == row.version
                {
                    return Ok(cached.store.clone());
                }
                let store = stash_storage::from_config(&config.storage).await?;
                tracing::info!(
                    version = row.version,
                    backend = store.backend_name(),
                    "GC blob store configured"
                );
                *cache = Some(CachedBackend {
                    version: row.version,
                    store: store.clone(),
                });
                Ok(store)
            }
        }
    }

    /// Run one batch of `kind` now.
    pub async fn run_batch(&self, kind: GcKind) -> FsResult<GcBatchReport> {
        self.run_batch_at(kind, OffsetDateTime::now_utc()).await
    }

    /// Run one batch of `kind` as if the current time were `now`.
    pub async fn run_batch_at(&self, kind: GcKind, now: OffsetDateTime) -> FsResult<GcBatchReport> {
        let Some(row) = self.metadata.get_stored_config().await? else {
            tracing::debug!(kind = %kind, "No stored configuration, skipping GC");
            return Ok(self.skip(kind, SkipReason::Unconfigured));
        };
        if kind.honors_freeze() && row.freeze_gc {
            tracing::info!(kind = %kind, "GC frozen by operator flag, skipping");
            return Ok(self.skip(kind, SkipReason::Frozen));
        }

        let config = row.config()?;
        let batch_size = config.gc.batch_size.max(1);
        let report = match kind {
            GcKind::File => self.expire_files(now, batch_size).await?,
            GcKind::Upload => {
                let store = self.blob_store(&row, &config).await?;
                self.collect_uploads(store.as_ref(), now, batch_size).await?
            }
            GcKind::Blob => {
                let store = self.blob_store(&row, &config).await?;
                let cutoff = now - config.gc.blob_grace_period();
                self.collect_blobs(store.as_ref(), cutoff, batch_size)
                    .await?
            }
        };

        metrics::GC_BATCHES.with_label_values(&[kind.as_str()]).inc();
        metrics::record_gc_items(kind.as_str(), report.deleted, report.not_found, report.errors);
        let rescheduled = report.should_continue();
        if report.scanned > 0 || report.errors > 0 {
            tracing::info!(
                kind = %kind,
                scanned = report.scanned,
                deleted = report.deleted,
                not_found = report.not_found,
                errors = report.errors,
                rescheduled,
                "GC batch finished"
            );
        } else {
            tracing::debug!(kind = %kind, "GC batch found nothing");
        }
        Ok(report)
    }

    /// Run batches of `kind` while each one says to continue, up to
    /// `max_batches`.
    pub async fn run_until_drained(&self, kind: GcKind, max_batches: u32) -> FsResult<GcRunSummary> {
        self.run_until_drained_at(kind, max_batches, OffsetDateTime::now_utc())
            .await
    }

    pub async fn run_until_drained_at(
        &self,
        kind: GcKind,
        max_batches: u32,
        now: OffsetDateTime,
    ) -> FsResult<GcRunSummary> {
        let mut summary = GcRunSummary::new(kind);
        for _ in 0..max_batches.max(1) {
            let report = self.run_batch_at(kind, now).await?;
            summary.absorb(&report);
            if !report.should_continue() {
                return Ok(summary);
            }
        }
        tracing::warn!(
            kind = %kind,
            batches = summary.batches,
            "GC stopped at the per-tick batch cap with work remaining"
        );
        Ok(summary)
    }

    fn skip(&self, kind: GcKind, reason: SkipReason) -> GcBatchReport {
        metrics::GC_SKIPPED
            .with_label_values(&[kind.as_str(), reason.as_str()])
            .inc();
        GcBatchReport::skipped(kind, reason)
    }

    async fn expire_files(&self, now: OffsetDateTime, batch_size: u32) -> FsResult<GcBatchReport> {
        let removed = self.metadata.expire_files(now, batch_size).await?;
        let mut report = GcBatchReport::new(GcKind::File, batch_size);
        report.scanned = removed.len();
        report.deleted = removed.len();
        for file in &removed {
            tracing::debug!(path = %file.path, blob_id = %file.blob_id, "Expired file removed");
        }
        Ok(report)
    }

    async fn collect_uploads(
        &self,
        store: &dyn BlobStore,
        now: OffsetDateTime,
        batch_size: u32,
    ) -> FsResult<GcBatchReport> {
        let expired = self
            .metadata
            .expired_uploads(now - UPLOAD_GRACE_PERIOD, batch_size)
            .await?;
        let ids = expired
            .iter()
            .map(|upload| upload.id())
            .collect::<Result<Vec<_>, _>>()?;

        let mut report = GcBatchReport::new(GcKind::Upload, batch_size);
        report.scanned = ids.len();
        let confirmed = delete_bytes(store, GcKind::Upload, ids, &mut report).await;
        if !confirmed.is_empty() {
            self.metadata.delete_uploads(&confirmed).await?;
        }
        Ok(report)
    }

    async fn collect_blobs(
        &self,
        store: &dyn BlobStore,
        cutoff: OffsetDateTime,
        batch_size: u32,
    ) -> FsResult<GcBatchReport> {
        let orphans = self.metadata.orphaned_blobs(cutoff, batch_size).await?;
        let ids = orphans
            .iter()
            .map(|blob| blob.id())
            .collect::<Result<Vec<_>, _>>()?;

        let mut report = GcBatchReport::new(GcKind::Blob, batch_size);
        report.scanned = ids.len();
        let confirmed = delete_bytes(store, GcKind::Blob, ids, &mut report).await;
        if !confirmed.is_empty() {
            let removed = self
                .metadata
                .delete_orphaned_blobs(&confirmed, cutoff)
                .await?;
            if removed.len() < confirmed.len() {
                tracing::error!(
                    kept = confirmed.len() - removed.len(),
                    "Blobs were re-referenced while their bytes were being deleted"
                );
            }
        }
        Ok(report)
    }
}

/// Delete each blob's bytes and return the ids confirmed gone. Failures are
/// counted and logged per item, never fatal to the batch.
async fn delete_bytes(
    store: &dyn BlobStore,
    kind: GcKind,
    ids: Vec<BlobId>,
    report: &mut GcBatchReport,
) -> Vec<BlobId> {
    let outcomes: Vec<_> = futures::stream::iter(ids)
        .map(|blob_id| async move {
            let outcome = store.delete(blob_id.as_str()).await;
            (blob_id, outcome)
        })
        .buffer_unordered(DELETE_CONCURRENCY)
        .collect()
        .await;

    let mut confirmed = Vec::with_capacity(outcomes.len());
    for (blob_id, outcome) in outcomes {
        match outcome {
            Ok(DeleteOutcome::Deleted) => {
                report.deleted += 1;
                confirmed.push(blob_id);
            }
            Ok(DeleteOutcome::NotFound) => {
                report.not_found += 1;
                confirmed.push(blob_id);
            }
            Err(e) => {
                report.errors += 1;
                tracing::warn!(
                    kind = %kind,
                    blob_id = %blob_id,
                    error = %e,
                    "Blob store delete failed, record kept for retry"
                );
            }
        }
    }
    confirmed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continue_requires_full_batch_without_errors() {
        let mut report = GcBatchReport::new(GcKind::Blob, 2);
        report.scanned = 2;
        assert!(report.should_continue());

        report.errors = 1;
        assert!(!report.should_continue());

        let mut partial = GcBatchReport::new(GcKind::Upload, 2);
        partial.scanned = 1;
        assert!(!partial.should_continue());

        assert!(!GcBatchReport::skipped(GcKind::Upload, SkipReason::Frozen).should_continue());
    }

    #[test]
    fn only_file_gc_ignores_freeze() {
        assert!(GcKind::Upload.honors_freeze());
        assert!(GcKind::Blob.honors_freeze());
        assert!(!GcKind::File.honors_freeze());
        assert_eq!("blob".parse::<GcKind>().unwrap(), GcKind::Blob);
        assert!("chunks".parse::<GcKind>().is_err());
    }
}
