//! Repository traits for metadata operations.

pub mod blobs;
pub mod config;
pub mod files;
pub mod gc;
pub mod journal;
pub mod uploads;

pub use blobs::BlobRepo;
pub use config::ConfigRepo;
pub use files::FileRepo;
pub use gc::GcRepo;
pub use journal::JournalRepo;
pub use uploads::UploadRepo;
