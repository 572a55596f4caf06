//! Transaction journal engine and commit pipeline.
//!
//! Every function here runs against a connection that already holds an open
//! transaction. Errors leave the transaction to be rolled back by the caller
//! dropping it, so a failing operation undoes the ones applied before it.

use crate::error::{MetadataError, MetadataResult};
use crate::models::{RemovedFile, UploadRow, from_millis, to_millis};
use sqlx::SqliteConnection;
use stash_core::{
    BlobId, CommitEntry, ConflictCode, ConflictError, DestRef, FileAttributes, FileMetadata, Op,
    validate_path,
};
use std::collections::HashSet;
use time::OffsetDateTime;

/// The file currently occupying a path.
struct Occupant {
    blob_id: BlobId,
    expires_at: Option<i64>,
}

impl Occupant {
    fn attributes(&self) -> MetadataResult<Option<FileAttributes>> {
        self.expires_at
            .map(|ms| from_millis(ms).map(FileAttributes::expiring_at))
            .transpose()
    }
}

fn check_path(path: &str) -> MetadataResult<()> {
    validate_path(path).map_err(|e| MetadataError::InvalidInput(e.to_string()))
}

fn parse_stored_id(raw: &str) -> MetadataResult<BlobId> {
    BlobId::parse(raw).map_err(|e| MetadataError::Invariant(format!("stored blob id {raw:?}: {e}")))
}

async fn occupant(conn: &mut SqliteConnection, path: &str) -> MetadataResult<Option<Occupant>> {
    let row: Option<(String, Option<i64>)> =
        sqlx::query_as("SELECT blob_id, expires_at FROM files WHERE path = ?")
            .bind(path)
            .fetch_optional(&mut *conn)
            .await?;
    row.map(|(blob_id, expires_at)| {
        Ok(Occupant {
            blob_id: parse_stored_id(&blob_id)?,
            expires_at,
        })
    })
    .transpose()
}

/// Add `delta` to a blob's reference count and stamp `updated_at`.
///
/// A missing blob record or a count that would go negative means the store
/// is corrupt; both fail the whole unit.
async fn adjust_ref_count(
    conn: &mut SqliteConnection,
    blob_id: &BlobId,
    delta: i64,
    now_ms: i64,
) -> MetadataResult<()> {
    let updated = sqlx::query(
        "UPDATE blobs SET ref_count = ref_count + ?, updated_at = ? WHERE blob_id = ? AND ref_count + ? >= 0",
    )
    .bind(delta)
    .bind(now_ms)
    .bind(blob_id.as_str())
    .bind(delta)
    .execute(&mut *conn)
    .await?;
    if updated.rows_affected() == 1 {
        return Ok(());
    }

    let current: Option<i64> = sqlx::query_scalar("SELECT ref_count FROM blobs WHERE blob_id = ?")
        .bind(blob_id.as_str())
        .fetch_optional(&mut *conn)
        .await?;
    let err = match current {
        None => MetadataError::Invariant(format!("blob {blob_id} is referenced but has no record")),
        Some(count) => MetadataError::Invariant(format!(
            "reference count of blob {blob_id} would drop below zero (currently {count})"
        )),
    };
    tracing::error!(blob_id = %blob_id, delta, error = %err, "Reference count update rejected");
    Err(err)
}

async fn insert_file(
    conn: &mut SqliteConnection,
    path: &str,
    blob_id: &BlobId,
    expires_at: Option<i64>,
) -> MetadataResult<()> {
    sqlx::query("INSERT INTO files (path, blob_id, expires_at) VALUES (?, ?, ?)")
        .bind(path)
        .bind(blob_id.as_str())
        .bind(expires_at)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn repoint_file(
    conn: &mut SqliteConnection,
    path: &str,
    blob_id: &BlobId,
    expires_at: Option<i64>,
) -> MetadataResult<()> {
    sqlx::query("UPDATE files SET blob_id = ?, expires_at = ? WHERE path = ?")
        .bind(blob_id.as_str())
        .bind(expires_at)
        .bind(path)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn delete_file(conn: &mut SqliteConnection, path: &str) -> MetadataResult<()> {
    sqlx::query("DELETE FROM files WHERE path = ?")
        .bind(path)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Check an operation's source predicate: the file must exist and point at
/// the expected blob.
async fn check_source(
    conn: &mut SqliteConnection,
    source: &FileMetadata,
) -> MetadataResult<Occupant> {
    match occupant(conn, &source.path).await? {
        None => Err(ConflictError::new(
            ConflictCode::SourceNotFound,
            &source.path,
            Some(source.blob_id.clone()),
            None,
        )
        .into()),
        Some(current) if current.blob_id != source.blob_id => Err(ConflictError::new(
            ConflictCode::SourceChanged,
            &source.path,
            Some(source.blob_id.clone()),
            Some(current.blob_id),
        )
        .into()),
        Some(current) => Ok(current),
    }
}

async fn check_dest(conn: &mut SqliteConnection, dest: &DestRef) -> MetadataResult<()> {
    check_path(&dest.path)?;
    if dest.basis.is_overwrite() {
        return Ok(());
    }
    let found = occupant(conn, &dest.path).await?.map(|o| o.blob_id);
    dest.basis.check(found.as_ref()).map_err(|violation| {
        ConflictError::new(
            ConflictCode::for_dest(violation),
            &dest.path,
            dest.basis.expected().cloned(),
            found,
        )
        .into()
    })
}

async fn apply_op(conn: &mut SqliteConnection, op: &Op, now_ms: i64) -> MetadataResult<()> {
    let source = op.source();
    let current = check_source(conn, source).await?;

    match op {
        Op::Move { dest, .. } => {
            check_dest(conn, dest).await?;
            if dest.path == source.path {
                // Same reference at the same path; only the attributes reset.
                repoint_file(conn, &source.path, &current.blob_id, None).await?;
                return Ok(());
            }
            // Re-read the destination: an earlier operation of this journal
            // may have changed it since the caller's snapshot.
            if let Some(previous) = occupant(conn, &dest.path).await? {
                delete_file(conn, &dest.path).await?;
                adjust_ref_count(conn, &previous.blob_id, -1, now_ms).await?;
            }
            sqlx::query("UPDATE files SET path = ?, expires_at = NULL WHERE path = ?")
                .bind(&dest.path)
                .bind(&source.path)
                .execute(&mut *conn)
                .await?;
        }
        Op::Copy { dest, .. } => {
            check_dest(conn, dest).await?;
            adjust_ref_count(conn, &current.blob_id, 1, now_ms).await?;
            match occupant(conn, &dest.path).await? {
                Some(previous) => {
                    repoint_file(conn, &dest.path, &current.blob_id, None).await?;
                    adjust_ref_count(conn, &previous.blob_id, -1, now_ms).await?;
                }
                None => insert_file(conn, &dest.path, &current.blob_id, None).await?,
            }
        }
        Op::Delete { .. } => {
            delete_file(conn, &source.path).await?;
            adjust_ref_count(conn, &current.blob_id, -1, now_ms).await?;
        }
        Op::SetAttributes { attributes, .. } => {
            let merged = attributes.clone().apply(current.attributes()?);
            let expires_at = merged.and_then(|a| a.expires_at).map(to_millis);
            sqlx::query("UPDATE files SET expires_at = ? WHERE path = ?")
                .bind(expires_at)
                .bind(&source.path)
                .execute(&mut *conn)
                .await?;
        }
    }
    Ok(())
}

/// Apply a journal in order. Conflicts carry the 1-indexed position of the
/// failing operation.
pub(crate) async fn apply_journal(
    conn: &mut SqliteConnection,
    ops: &[Op],
    now: OffsetDateTime,
) -> MetadataResult<()> {
    let now_ms = to_millis(now);
    for (i, op) in ops.iter().enumerate() {
        apply_op(conn, op, now_ms).await.map_err(|err| match err {
            MetadataError::Conflict(conflict) => MetadataError::Conflict(conflict.at_operation(i + 1)),
            other => other,
        })?;
    }
    Ok(())
}

/// Promote pending uploads to blobs and bind them to paths.
pub(crate) async fn apply_commit(
    conn: &mut SqliteConnection,
    entries: &[CommitEntry],
    now: OffsetDateTime,
) -> MetadataResult<()> {
    let now_ms = to_millis(now);

    let mut seen_blobs = HashSet::with_capacity(entries.len());
    let mut seen_paths = HashSet::with_capacity(entries.len());
    for entry in entries {
        check_path(&entry.path)?;
        if !seen_blobs.insert(&entry.blob_id) {
            return Err(MetadataError::InvalidInput(format!(
                "blob {} is committed more than once",
                entry.blob_id
            )));
        }
        if !seen_paths.insert(entry.path.as_str()) {
            return Err(MetadataError::InvalidInput(format!(
                "path {} is committed more than once",
                entry.path
            )));
        }
    }

    let mut contents = Vec::with_capacity(entries.len());
    let mut missing = Vec::new();
    let mut expired = Vec::new();
    for entry in entries {
        let upload: Option<UploadRow> = sqlx::query_as("SELECT * FROM uploads WHERE blob_id = ?")
            .bind(entry.blob_id.as_str())
            .fetch_optional(&mut *conn)
            .await?;
        match upload {
            // Past its deadline the upload belongs to upload GC, which may
            // already have deleted the bytes.
            Some(upload) if upload.expires_at < now_ms => expired.push(entry.blob_id.clone()),
            Some(UploadRow {
                content_type: Some(content_type),
                size: Some(size),
                ..
            }) => contents.push((content_type, size)),
            _ => missing.push(entry.blob_id.clone()),
        }
    }
    if !missing.is_empty() {
        return Err(MetadataError::MissingUploadMetadata { blob_ids: missing });
    }
    if !expired.is_empty() {
        return Err(MetadataError::UploadExpired { blob_ids: expired });
    }

    for entry in entries.iter().filter(|e| !e.basis.is_overwrite()) {
        let found = occupant(conn, &entry.path).await?.map(|o| o.blob_id);
        if entry.basis.check(found.as_ref()).is_err() {
            return Err(ConflictError::new(
                ConflictCode::CasConflict,
                &entry.path,
                entry.basis.expected().cloned(),
                found,
            )
            .into());
        }
    }

    for (entry, (content_type, size)) in entries.iter().zip(contents) {
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO blobs (blob_id, content_type, size, ref_count, updated_at) VALUES (?, ?, ?, 1, ?)",
        )
        .bind(entry.blob_id.as_str())
        .bind(&content_type)
        .bind(size)
        .bind(now_ms)
        .execute(&mut *conn)
        .await?;
        if inserted.rows_affected() == 0 {
            return Err(MetadataError::Invariant(format!(
                "pending upload {} collides with an existing blob record",
                entry.blob_id
            )));
        }

        // Attributes are replaced wholesale, never merged.
        let expires_at = entry
            .attributes
            .as_ref()
            .and_then(|a| a.expires_at)
            .map(to_millis);
        match occupant(conn, &entry.path).await? {
            Some(previous) => {
                repoint_file(conn, &entry.path, &entry.blob_id, expires_at).await?;
                adjust_ref_count(conn, &previous.blob_id, -1, now_ms).await?;
            }
            None => insert_file(conn, &entry.path, &entry.blob_id, expires_at).await?,
        }

        sqlx::query("DELETE FROM uploads WHERE blob_id = ?")
            .bind(entry.blob_id.as_str())
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Link an existing blob to an unoccupied path.
pub(crate) async fn apply_restore(
    conn: &mut SqliteConnection,
    blob_id: &BlobId,
    path: &str,
    now: OffsetDateTime,
) -> MetadataResult<()> {
    check_path(path)?;
    let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM blobs WHERE blob_id = ?")
        .bind(blob_id.as_str())
        .fetch_optional(&mut *conn)
        .await?;
    if exists.is_none() {
        return Err(MetadataError::NotFound(format!("blob {blob_id}")));
    }
    if let Some(current) = occupant(conn, path).await? {
        return Err(ConflictError::new(
            ConflictCode::DestExists,
            path,
            None,
            Some(current.blob_id),
        )
        .into());
    }
    insert_file(conn, path, blob_id, None).await?;
    adjust_ref_count(conn, blob_id, 1, to_millis(now)).await
}

/// Delete the given files and release their blob references.
pub(crate) async fn remove_files(
    conn: &mut SqliteConnection,
    rows: Vec<(String, String)>,
    now: OffsetDateTime,
) -> MetadataResult<Vec<RemovedFile>> {
    let now_ms = to_millis(now);
    let mut removed = Vec::with_capacity(rows.len());
    for (path, blob_id) in rows {
        let blob_id = parse_stored_id(&blob_id)?;
        delete_file(conn, &path).await?;
        adjust_ref_count(conn, &blob_id, -1, now_ms).await?;
        removed.push(RemovedFile { path, blob_id });
    }
    Ok(removed)
}
