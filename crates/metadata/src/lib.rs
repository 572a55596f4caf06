//! Metadata store for the stash virtual filesystem.
//!
//! This crate owns every durable record:
//! - File records (the path namespace) and blob records with reference counts
//! - Pending uploads awaiting commit
//! - The stored configuration singleton with operator flags
//!
//! It also hosts the transaction journal engine and commit pipeline, which
//! apply each logical operation as one SQLite transaction, and the find and
//! delete queries used by garbage collection.

pub mod error;
mod journal;
pub mod models;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use models::{BlobRow, RefcountDiscrepancy, RemovedFile, StoreStats, StoredConfigRow, UploadRow};
pub use store::{MetadataStore, SqliteStore};

use stash_core::config::MetadataConfig;
use std::sync::Arc;

/// Create a metadata store from configuration.
pub async fn from_config(config: &MetadataConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
    match config {
        MetadataConfig::Sqlite {
            path,
            query_timeout_secs,
        } => {
            let store = SqliteStore::new(path, *query_timeout_secs).await?;
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repos::{ConfigRepo, GcRepo};

    #[tokio::test]
    async fn from_config_sqlite_creates_schema() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = MetadataConfig::Sqlite {
            path: temp_dir.path().join("nested").join("metadata.db"),
            query_timeout_secs: Some(5),
        };

        let store = from_config(&config).await.unwrap();
        store.health_check().await.unwrap();
        assert_eq!(store.stats().await.unwrap(), StoreStats::default());
        assert!(store.get_stored_config().await.unwrap().is_none());
    }
}
