//! Stored configuration repository.

use crate::error::MetadataResult;
use crate::models::StoredConfigRow;
use async_trait::async_trait;
use stash_core::config::{OperatorFlags, PersistedConfig};
use time::OffsetDateTime;

/// Repository for the stored configuration singleton.
#[async_trait]
pub trait ConfigRepo: Send + Sync {
    /// Current stored configuration, or `None` if none was ever stored.
    async fn get_stored_config(&self) -> MetadataResult<Option<StoredConfigRow>>;

    /// Replace the client-supplied configuration and bump the version.
    ///
    /// Operator flags are read and carried over in the same transaction.
    async fn store_config(
        &self,
        config: &PersistedConfig,
        now: OffsetDateTime,
    ) -> MetadataResult<StoredConfigRow>;

    /// Set operator flags. Fails with `NotFound` before any configuration
    /// has been stored.
    async fn set_operator_flags(
        &self,
        flags: OperatorFlags,
        now: OffsetDateTime,
    ) -> MetadataResult<StoredConfigRow>;
}
