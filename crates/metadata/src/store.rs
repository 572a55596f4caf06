//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::{BlobRepo, ConfigRepo, FileRepo, GcRepo, JournalRepo, UploadRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore:
    FileRepo + BlobRepo + UploadRepo + ConfigRepo + JournalRepo + GcRepo + Send + Sync
{
    /// Create tables and indices if missing.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
///
/// The pool holds a single connection, so every logical operation runs as
/// one serialized transaction and reads inside it are consistent.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    ///
    /// `busy_timeout_secs` bounds how long a statement waits on a lock held
    /// by another process.
    pub async fn new(path: impl AsRef<Path>, busy_timeout_secs: Option<u64>) -> MetadataResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(busy_timeout_secs.unwrap_or(5)));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        tracing::info!(path = %path.display(), "Opened SQLite metadata store");
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

mod sqlite_impl {
    use super::*;
    use crate::journal;
    use crate::models::*;
    use sqlx::QueryBuilder;
    use stash_core::config::{OperatorFlags, PersistedConfig};
    use stash_core::{
        BlobId, CommitEntry, FileMetadata, FilePage, ListCursor, Op, PageOpts,
        prefix_upper_bound,
    };
    use time::OffsetDateTime;

    const FILE_COLUMNS: &str = "SELECT f.path, f.blob_id, f.expires_at, b.content_type, b.size \
         FROM files f LEFT JOIN blobs b ON b.blob_id = f.blob_id";

    #[async_trait]
    impl FileRepo for SqliteStore {
        async fn get_file(&self, path: &str) -> MetadataResult<Option<FileMetadata>> {
            let row: Option<FileRow> = sqlx::query_as(&format!("{FILE_COLUMNS} WHERE f.path = ?"))
                .bind(path)
                .fetch_optional(&self.pool)
                .await?;
            row.map(FileRow::into_metadata).transpose()
        }

        async fn list_files(
            &self,
            prefix: Option<&str>,
            opts: &PageOpts,
        ) -> MetadataResult<FilePage> {
            let limit = opts.normalized_num_items();
            let after = opts.cursor.as_ref().and_then(ListCursor::last_path);

            let mut query = QueryBuilder::<Sqlite>::new(FILE_COLUMNS);
            query.push(" WHERE 1 = 1");
            if let Some(prefix) = prefix.filter(|p| !p.is_empty()) {
                query.push(" AND f.path >= ").push_bind(prefix.to_string());
                query
                    .push(" AND f.path < ")
                    .push_bind(prefix_upper_bound(prefix));
            }
            if let Some(after) = after {
                query.push(" AND f.path > ").push_bind(after.to_string());
            }
            // One extra row tells whether another page exists.
            query
                .push(" ORDER BY f.path LIMIT ")
                .push_bind(i64::from(limit) + 1);

            let mut rows: Vec<FileRow> = query.build_query_as().fetch_all(&self.pool).await?;
            let is_done = rows.len() <= limit as usize;
            rows.truncate(limit as usize);

            let page = rows
                .into_iter()
                .map(FileRow::into_metadata)
                .collect::<MetadataResult<Vec<_>>>()?;
            let continue_cursor = match page.last() {
                Some(last) => ListCursor::after(last.path.clone()),
                None => opts.cursor.clone().unwrap_or_default(),
            };
            Ok(FilePage {
                page,
                continue_cursor,
                is_done,
            })
        }
    }

    #[async_trait]
    impl BlobRepo for SqliteStore {
        async fn get_blob(&self, blob_id: &BlobId) -> MetadataResult<Option<BlobRow>> {
            let row = sqlx::query_as::<_, BlobRow>(
                "SELECT blob_id, content_type, size, ref_count, updated_at FROM blobs WHERE blob_id = ?",
            )
            .bind(blob_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }
    }

    #[async_trait]
    impl UploadRepo for SqliteStore {
        async fn create_upload(&self, upload: &UploadRow) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;

            let blob_exists: Option<i64> =
                sqlx::query_scalar("SELECT 1 FROM blobs WHERE blob_id = ?")
                    .bind(&upload.blob_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            if blob_exists.is_some() {
                return Err(MetadataError::InvalidInput(format!(
                    "blob id {} is already committed",
                    upload.blob_id
                )));
            }

            let inserted = sqlx::query(
                "INSERT OR IGNORE INTO uploads (blob_id, expires_at, content_type, size, created_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&upload.blob_id)
            .bind(upload.expires_at)
            .bind(&upload.content_type)
            .bind(upload.size)
            .bind(upload.created_at)
            .execute(&mut *tx)
            .await?;
            if inserted.rows_affected() == 0 {
                return Err(MetadataError::InvalidInput(format!(
                    "upload {} already exists",
                    upload.blob_id
                )));
            }

            tx.commit().await?;
            Ok(())
        }

        async fn get_upload(&self, blob_id: &BlobId) -> MetadataResult<Option<UploadRow>> {
            let row = sqlx::query_as::<_, UploadRow>("SELECT * FROM uploads WHERE blob_id = ?")
                .bind(blob_id.as_str())
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn set_upload_content(
            &self,
            blob_id: &BlobId,
            content_type: &str,
            size: u64,
        ) -> MetadataResult<bool> {
            let updated =
                sqlx::query("UPDATE uploads SET content_type = ?, size = ? WHERE blob_id = ?")
                    .bind(content_type)
                    .bind(size as i64)
                    .bind(blob_id.as_str())
                    .execute(&self.pool)
                    .await?;
            Ok(updated.rows_affected() > 0)
        }
    }

    const CONFIG_COLUMNS: &str =
        "SELECT version, config_json, freeze_gc, allow_clear_all_files, updated_at FROM stored_config WHERE id = 1";

    #[async_trait]
    impl ConfigRepo for SqliteStore {
        async fn get_stored_config(&self) -> MetadataResult<Option<StoredConfigRow>> {
            let row = sqlx::query_as::<_, StoredConfigRow>(CONFIG_COLUMNS)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn store_config(
            &self,
            config: &PersistedConfig,
            now: OffsetDateTime,
        ) -> MetadataResult<StoredConfigRow> {
            let config_json = serde_json::to_string(config)?;
            let mut tx = self.pool.begin().await?;

            let existing = sqlx::query_as::<_, StoredConfigRow>(CONFIG_COLUMNS)
                .fetch_optional(&mut *tx)
                .await?;
            match &existing {
                Some(row) if row.config_json == config_json => return Ok(row.clone()),
                Some(row) => {
                    // Operator flags are left as they are.
                    sqlx::query(
                        "UPDATE stored_config SET version = ?, config_json = ?, updated_at = ? WHERE id = 1",
                    )
                    .bind(row.version + 1)
                    .bind(&config_json)
                    .bind(to_millis(now))
                    .execute(&mut *tx)
                    .await?;
                }
                None => {
                    sqlx::query(
                        "INSERT INTO stored_config (id, version, config_json, freeze_gc, allow_clear_all_files, updated_at) VALUES (1, 1, ?, 0, 0, ?)",
                    )
                    .bind(&config_json)
                    .bind(to_millis(now))
                    .execute(&mut *tx)
                    .await?;
                }
            }

            let row = sqlx::query_as::<_, StoredConfigRow>(CONFIG_COLUMNS)
                .fetch_one(&mut *tx)
                .await?;
            tx.commit().await?;
            tracing::info!(version = row.version, "Stored configuration updated");
            Ok(row)
        }

        async fn set_operator_flags(
            &self,
            flags: OperatorFlags,
            now: OffsetDateTime,
        ) -> MetadataResult<StoredConfigRow> {
            let mut tx = self.pool.begin().await?;
            let updated = sqlx::query(
                "UPDATE stored_config SET freeze_gc = ?, allow_clear_all_files = ?, updated_at = ? WHERE id = 1",
            )
            .bind(flags.freeze_gc)
            .bind(flags.allow_clear_all_files)
            .bind(to_millis(now))
            .execute(&mut *tx)
            .await?;
            if updated.rows_affected() == 0 {
                return Err(MetadataError::NotFound(
                    "stored configuration (store a configuration before setting flags)"
                        .to_string(),
                ));
            }
            let row = sqlx::query_as::<_, StoredConfigRow>(CONFIG_COLUMNS)
                .fetch_one(&mut *tx)
                .await?;
            tx.commit().await?;
            tracing::warn!(
                freeze_gc = flags.freeze_gc,
                allow_clear_all_files = flags.allow_clear_all_files,
                "Operator flags changed"
            );
            Ok(row)
        }
    }

    #[async_trait]
    impl JournalRepo for SqliteStore {
        async fn commit_files(
            &self,
            entries: &[CommitEntry],
            now: OffsetDateTime,
        ) -> MetadataResult<()> {
            if entries.is_empty() {
                return Ok(());
            }
            let mut tx = self.pool.begin().await?;
            journal::apply_commit(&mut tx, entries, now).await?;
            tx.commit().await?;
            Ok(())
        }

        async fn transact(&self, ops: &[Op], now: OffsetDateTime) -> MetadataResult<()> {
            if ops.is_empty() {
                return Ok(());
            }
            let mut tx = self.pool.begin().await?;
            journal::apply_journal(&mut tx, ops, now).await?;
            tx.commit().await?;
            Ok(())
        }

        async fn restore(
            &self,
            blob_id: &BlobId,
            path: &str,
            now: OffsetDateTime,
        ) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;
            journal::apply_restore(&mut tx, blob_id, path, now).await?;
            tx.commit().await?;
            Ok(())
        }
    }

    #[async_trait]
    impl GcRepo for SqliteStore {
        async fn expired_uploads(
            &self,
            before: OffsetDateTime,
            limit: u32,
        ) -> MetadataResult<Vec<UploadRow>> {
            let rows = sqlx::query_as::<_, UploadRow>(
                "SELECT * FROM uploads WHERE expires_at < ? ORDER BY expires_at LIMIT ?",
            )
            .bind(to_millis(before))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn delete_uploads(&self, blob_ids: &[BlobId]) -> MetadataResult<u64> {
            let mut tx = self.pool.begin().await?;
            let mut deleted = 0;
            for blob_id in blob_ids {
                deleted += sqlx::query("DELETE FROM uploads WHERE blob_id = ?")
                    .bind(blob_id.as_str())
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
            }
            tx.commit().await?;
            Ok(deleted)
        }

        async fn orphaned_blobs(
            &self,
            before: OffsetDateTime,
            limit: u32,
        ) -> MetadataResult<Vec<BlobRow>> {
            let rows = sqlx::query_as::<_, BlobRow>(
                r#"
                SELECT blob_id, content_type, size, ref_count, updated_at FROM blobs
                WHERE ref_count = 0 AND updated_at < ?
                ORDER BY updated_at
                LIMIT ?
                "#,
            )
            .bind(to_millis(before))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn delete_orphaned_blobs(
            &self,
            blob_ids: &[BlobId],
            before: OffsetDateTime,
        ) -> MetadataResult<Vec<BlobId>> {
            let mut tx = self.pool.begin().await?;
            let mut deleted = Vec::with_capacity(blob_ids.len());
            for blob_id in blob_ids {
                // Re-check: a restore may have referenced the blob since it
                // was selected.
                let result = sqlx::query(
                    "DELETE FROM blobs WHERE blob_id = ? AND ref_count = 0 AND updated_at < ?",
                )
                .bind(blob_id.as_str())
                .bind(to_millis(before))
                .execute(&mut *tx)
                .await?;
                if result.rows_affected() > 0 {
                    deleted.push(blob_id.clone());
                } else {
                    tracing::warn!(
                        blob_id = %blob_id,
                        "Blob referenced again after its bytes were deleted; record kept"
                    );
                }
            }
            tx.commit().await?;
            Ok(deleted)
        }

        async fn expire_files(
            &self,
            now: OffsetDateTime,
            limit: u32,
        ) -> MetadataResult<Vec<RemovedFile>> {
            let mut tx = self.pool.begin().await?;
            let rows: Vec<(String, String)> = sqlx::query_as(
                r#"
                SELECT path, blob_id FROM files
                WHERE expires_at IS NOT NULL AND expires_at < ?
                ORDER BY expires_at
                LIMIT ?
                "#,
            )
            .bind(to_millis(now))
            .bind(limit)
            .fetch_all(&mut *tx)
            .await?;
            let removed = journal::remove_files(&mut tx, rows, now).await?;
            tx.commit().await?;
            Ok(removed)
        }

        async fn clear_files(
            &self,
            limit: u32,
            now: OffsetDateTime,
        ) -> MetadataResult<Vec<RemovedFile>> {
            let mut tx = self.pool.begin().await?;
            let rows: Vec<(String, String)> =
                sqlx::query_as("SELECT path, blob_id FROM files ORDER BY path LIMIT ?")
                    .bind(limit)
                    .fetch_all(&mut *tx)
                    .await?;
            let removed = journal::remove_files(&mut tx, rows, now).await?;
            tx.commit().await?;
            Ok(removed)
        }

        async fn stats(&self) -> MetadataResult<StoreStats> {
            let (files, blobs, orphaned_blobs, pending_uploads, referenced_bytes): (
                i64,
                i64,
                i64,
                i64,
                i64,
            ) = sqlx::query_as(
                r#"
                SELECT
                    (SELECT COUNT(*) FROM files),
                    (SELECT COUNT(*) FROM blobs),
                    (SELECT COUNT(*) FROM blobs WHERE ref_count = 0),
                    (SELECT COUNT(*) FROM uploads),
                    (SELECT COALESCE(SUM(size), 0) FROM blobs WHERE ref_count > 0)
                "#,
            )
            .fetch_one(&self.pool)
            .await?;
            Ok(StoreStats {
                files: files as u64,
                blobs: blobs as u64,
                orphaned_blobs: orphaned_blobs as u64,
                pending_uploads: pending_uploads as u64,
                referenced_bytes: referenced_bytes as u64,
            })
        }

        async fn audit_refcounts(&self) -> MetadataResult<Vec<RefcountDiscrepancy>> {
            let mismatched: Vec<(String, i64, i64)> = sqlx::query_as(
                r#"
                SELECT b.blob_id, b.ref_count, COUNT(f.path)
                FROM blobs b LEFT JOIN files f ON f.blob_id = b.blob_id
                GROUP BY b.blob_id, b.ref_count
                HAVING b.ref_count != COUNT(f.path)
                ORDER BY b.blob_id
                "#,
            )
            .fetch_all(&self.pool)
            .await?;
            let dangling: Vec<(String, i64)> = sqlx::query_as(
                r#"
                SELECT f.blob_id, COUNT(*)
                FROM files f LEFT JOIN blobs b ON b.blob_id = f.blob_id
                WHERE b.blob_id IS NULL
                GROUP BY f.blob_id
                ORDER BY f.blob_id
                "#,
            )
            .fetch_all(&self.pool)
            .await?;

            let discrepancies: Vec<RefcountDiscrepancy> = mismatched
                .into_iter()
                .map(|(blob_id, stored, actual)| RefcountDiscrepancy {
                    blob_id,
                    stored: Some(stored),
                    actual,
                })
                .chain(
                    dangling
                        .into_iter()
                        .map(|(blob_id, actual)| RefcountDiscrepancy {
                            blob_id,
                            stored: None,
                            actual,
                        }),
                )
                .collect();
            if !discrepancies.is_empty() {
                tracing::error!(
                    count = discrepancies.len(),
                    "Reference count audit found discrepancies"
                );
            }
            Ok(discrepancies)
        }
    }
}

const SCHEMA_SQL: &str = r#"
-- Blob records: one physical object each
CREATE TABLE IF NOT EXISTS blobs (
    blob_id TEXT PRIMARY KEY,
    content_type TEXT NOT NULL,
    size INTEGER NOT NULL CHECK (size >= 0),
    ref_count INTEGER NOT NULL CHECK (ref_count >= 0),
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_blobs_gc ON blobs(ref_count, updated_at);

-- File records: the namespace
CREATE TABLE IF NOT EXISTS files (
    path TEXT PRIMARY KEY,
    blob_id TEXT NOT NULL,
    expires_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_files_blob ON files(blob_id);
CREATE INDEX IF NOT EXISTS idx_files_expires ON files(expires_at) WHERE expires_at IS NOT NULL;

-- Pending uploads not yet bound to a path
CREATE TABLE IF NOT EXISTS uploads (
    blob_id TEXT PRIMARY KEY,
    expires_at INTEGER NOT NULL,
    content_type TEXT,
    size INTEGER CHECK (size IS NULL OR size >= 0),
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_uploads_expires ON uploads(expires_at);

-- Stored configuration singleton
CREATE TABLE IF NOT EXISTS stored_config (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL,
    config_json TEXT NOT NULL,
    freeze_gc INTEGER NOT NULL DEFAULT 0,
    allow_clear_all_files INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL
);
"#;
