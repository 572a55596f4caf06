//! Prometheus metrics for stash.
//!
//! Counters live in a process-wide registry. Nothing here is exposed over
//! HTTP; [`gather_metrics`] renders the text format for whoever wants it.

use prometheus::{self, Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use stash_core::ConflictCode;
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Namespace mutations
pub static COMMITS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("stash_commits_total", "Total number of successful commits")
        .expect("metric creation failed")
});

pub static FILES_COMMITTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stash_files_committed_total",
        "Total number of files bound to new blobs by commits",
    )
    .expect("metric creation failed")
});

pub static TRANSACTIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stash_transactions_total",
        "Total number of successfully applied journals",
    )
    .expect("metric creation failed")
});

pub static CONFLICTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("stash_conflicts_total", "Optimistic-concurrency conflicts by code"),
        &["code"],
    )
    .expect("metric creation failed")
});

// Uploads
pub static UPLOADS_STARTED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("stash_uploads_started_total", "Pending uploads registered"),
        &["mode"],
    )
    .expect("metric creation failed")
});

pub static BYTES_UPLOADED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stash_bytes_uploaded_total",
        "Total bytes received through proxy uploads",
    )
    .expect("metric creation failed")
});

// GC
pub static GC_BATCHES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("stash_gc_batches_total", "GC batches run by kind"),
        &["kind"],
    )
    .expect("metric creation failed")
});

pub static GC_ITEMS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "stash_gc_items_total",
            "GC items processed by kind and outcome (deleted, not_found, error)",
        ),
        &["kind", "outcome"],
    )
    .expect("metric creation failed")
});

pub static GC_SKIPPED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("stash_gc_skipped_total", "GC batches skipped by kind and reason"),
        &["kind", "reason"],
    )
    .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Idempotent; later calls are no-ops.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(COMMITS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(FILES_COMMITTED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(TRANSACTIONS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CONFLICTS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOADS_STARTED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BYTES_UPLOADED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(GC_BATCHES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(GC_ITEMS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(GC_SKIPPED.clone()))
            .expect("metric registration failed");
    });
}

/// Render every registered metric in the Prometheus text format.
pub fn gather_metrics() -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

pub fn record_conflict(code: ConflictCode) {
    CONFLICTS.with_label_values(&[code.as_str()]).inc();
}

pub fn record_gc_items(kind: &str, deleted: usize, not_found: usize, errors: usize) {
    GC_ITEMS
        .with_label_values(&[kind, "deleted"])
        .inc_by(deleted as u64);
    GC_ITEMS
        .with_label_values(&[kind, "not_found"])
        .inc_by(not_found as u64);
    GC_ITEMS
        .with_label_values(&[kind, "error"])
        .inc_by(errors as u64);
}
