//! Filesystem facade and background garbage collection for stash.
//!
//! This crate provides:
//! - [`FileSystem`]: uploads, stat/list, commit, journals, convenience
//!   wrappers, restore, download URLs and bulk clear
//! - [`GarbageCollector`]: upload, blob and file-expiry GC batches
//! - [`GcScheduler`]: the periodic driver for those batches
//! - Prometheus metrics

pub mod error;
pub mod fs;
pub mod gc;
pub mod metrics;
pub mod scheduler;

pub use error::{FsError, FsResult};
pub use fs::{FileSystem, UploadHandle};
pub use gc::{GarbageCollector, GcBatchReport, GcKind, GcRunSummary, SkipReason, UPLOAD_GRACE_PERIOD};
pub use scheduler::GcScheduler;
