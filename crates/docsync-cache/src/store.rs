//! SQLite implementation of IChangeStore
//!
//! One [`SqliteChangeStore`] serves one folder pair: every statement is
//! filtered by the pair's name, so several pairs can share a database.
//!
//! ## Type Mapping
//!
//! | Domain Type      | SQL Type | Strategy                                      |
//! |------------------|----------|-----------------------------------------------|
//! | RelativePath     | TEXT     | `.as_str()` / `RelativePath::new()` (root = "") |
//! | RemoteId         | TEXT     | `.as_str()` / `RemoteId::new()`               |
//! | Checksum         | TEXT     | `.as_str()` / `Checksum::new()`               |
//! | ChangeToken      | TEXT     | `.as_str()` / `ChangeToken::new()`            |
//! | DateTime<Utc>    | TEXT     | RFC 3339 with full precision                  |
//! | metadata map     | TEXT     | serde_json object                             |
//! | OperationKind    | TEXT     | `.as_str()`                                   |
//!
//! Subtree queries compare whole path components: a row belongs to the
//! subtree of `p` when its path equals `p` or starts with `p/`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use docsync_core::domain::{
    ChangeRecord, ChangeToken, Checksum, OperationKind, RelativePath, RemoteId, SyncItem,
};
use docsync_core::ports::IChangeStore;

use crate::CacheError;

const RECORD_COLUMNS: &str =
    "local_path, remote_path, remote_id, is_folder, server_modified, checksum, metadata";

/// SQLite-backed change store for one folder pair
#[derive(Clone)]
pub struct SqliteChangeStore {
    pool: SqlitePool,
    folder: String,
}

impl SqliteChangeStore {
    pub fn new(pool: SqlitePool, folder: impl Into<String>) -> Self {
        Self {
            pool,
            folder: folder.into(),
        }
    }

    /// Name of the folder pair this store is scoped to
    pub fn folder(&self) -> &str {
        &self.folder
    }

    async fn fetch_one_record(
        &self,
        column: &str,
        value: &str,
    ) -> anyhow::Result<Option<ChangeRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM change_records \
             WHERE folder = ? AND {column} = ? ORDER BY local_path LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(&self.folder)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| record_from_row(&r)).transpose()?)
    }
}

// ============================================================================
// Helper functions for type conversion
// ============================================================================

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, CacheError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            CacheError::SerializationError(format!("Failed to parse datetime '{}': {}", s, e))
        })
}

fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, CacheError> {
    match s {
        Some(ref val) if !val.is_empty() => parse_datetime(val).map(Some),
        _ => Ok(None),
    }
}

fn parse_path(s: &str) -> Result<RelativePath, CacheError> {
    RelativePath::new(s)
        .map_err(|e| CacheError::SerializationError(format!("Invalid stored path '{}': {}", s, e)))
}

fn record_from_row(row: &SqliteRow) -> Result<ChangeRecord, CacheError> {
    let local_path: String = row.get("local_path");
    let remote_path: String = row.get("remote_path");
    let remote_id: String = row.get("remote_id");
    let is_folder: bool = row.get("is_folder");
    let server_modified: Option<String> = row.get("server_modified");
    let checksum: Option<String> = row.get("checksum");
    let metadata: String = row.get("metadata");

    let remote_id = RemoteId::new(remote_id)
        .map_err(|e| CacheError::SerializationError(e.to_string()))?;
    let checksum = checksum
        .map(Checksum::new)
        .transpose()
        .map_err(|e| CacheError::SerializationError(e.to_string()))?;
    let metadata: BTreeMap<String, String> = serde_json::from_str(&metadata)
        .map_err(|e| CacheError::SerializationError(format!("Invalid metadata JSON: {}", e)))?;

    Ok(ChangeRecord {
        local_path: parse_path(&local_path)?,
        remote_path: parse_path(&remote_path)?,
        remote_id,
        is_folder,
        server_modified: parse_optional_datetime(server_modified)?,
        checksum,
        metadata,
    })
}

/// `(clause, bind values)` selecting `prefix` and its subtree on `column`
fn subtree_clause(column: &str, prefix: &RelativePath) -> (String, Vec<String>) {
    if prefix.is_root() {
        ("1 = 1".to_string(), Vec::new())
    } else {
        let p = prefix.as_str().to_string();
        (
            format!("({column} = ? OR substr({column}, 1, length(?) + 1) = ? || '/')"),
            vec![p.clone(), p.clone(), p],
        )
    }
}

// ============================================================================
// IChangeStore implementation
// ============================================================================

#[async_trait::async_trait]
impl IChangeStore for SqliteChangeStore {
    async fn lookup(&self, local: &RelativePath) -> anyhow::Result<Option<ChangeRecord>> {
        self.fetch_one_record("local_path", local.as_str()).await
    }

    async fn lookup_by_remote_path(
        &self,
        remote: &RelativePath,
    ) -> anyhow::Result<Option<ChangeRecord>> {
        self.fetch_one_record("remote_path", remote.as_str()).await
    }

    async fn lookup_by_remote_id(&self, id: &RemoteId) -> anyhow::Result<Option<ChangeRecord>> {
        self.fetch_one_record("remote_id", id.as_str()).await
    }

    async fn upsert(&self, record: &ChangeRecord) -> anyhow::Result<()> {
        let metadata = serde_json::to_string(&record.metadata)
            .map_err(|e| CacheError::SerializationError(e.to_string()))?;

        sqlx::query(
            "INSERT OR REPLACE INTO change_records \
             (folder, local_path, remote_path, remote_id, is_folder, server_modified, \
              checksum, metadata, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&self.folder)
        .bind(record.local_path.as_str())
        .bind(record.remote_path.as_str())
        .bind(record.remote_id.as_str())
        .bind(record.is_folder)
        .bind(record.server_modified.map(|t| t.to_rfc3339()))
        .bind(record.checksum.as_ref().map(|c| c.as_str().to_string()))
        .bind(metadata)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        tracing::trace!(folder = %self.folder, path = %record.local_path, "Record upserted");
        Ok(())
    }

    async fn remove(&self, local: &RelativePath) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM change_records WHERE folder = ? AND local_path = ?")
            .bind(&self.folder)
            .bind(local.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove_tree(&self, local: &RelativePath) -> anyhow::Result<()> {
        let (clause, binds) = subtree_clause("local_path", local);
        let sql = format!("DELETE FROM change_records WHERE folder = ? AND {clause}");
        let mut query = sqlx::query(&sql).bind(&self.folder);
        for b in &binds {
            query = query.bind(b);
        }
        let result = query.execute(&self.pool).await?;

        tracing::debug!(
            folder = %self.folder,
            path = %local,
            removed = result.rows_affected(),
            "Record subtree removed"
        );
        Ok(())
    }

    async fn move_item(&self, from: &SyncItem, to: &SyncItem) -> anyhow::Result<()> {
        let from_local = from.local_relative();
        let to_local = to.local_relative();
        if from_local == to_local && from.remote_relative() == to.remote_relative() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        let (clause, binds) = subtree_clause("local_path", from_local);
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM change_records WHERE folder = ? AND {clause} \
             ORDER BY local_path"
        );
        let mut query = sqlx::query(&sql).bind(&self.folder);
        for b in &binds {
            query = query.bind(b);
        }
        let rows = query.fetch_all(&mut *tx).await?;
        let records = rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        // Whatever occupied the target subtree is replaced
        if from_local != to_local {
            let (clause, binds) = subtree_clause("local_path", to_local);
            let sql = format!("DELETE FROM change_records WHERE folder = ? AND {clause}");
            let mut query = sqlx::query(&sql).bind(&self.folder);
            for b in &binds {
                query = query.bind(b);
            }
            query.execute(&mut *tx).await?;
        }

        let now = Utc::now().to_rfc3339();
        for record in &records {
            let new_local = record
                .local_path
                .rebase(from_local, to_local)
                .unwrap_or_else(|| record.local_path.clone());
            let new_remote = record
                .remote_path
                .rebase(from.remote_relative(), to.remote_relative())
                .unwrap_or_else(|| record.remote_path.clone());

            sqlx::query(
                "UPDATE change_records SET local_path = ?, remote_path = ?, updated_at = ? \
                 WHERE folder = ? AND local_path = ?",
            )
            .bind(new_local.as_str())
            .bind(new_remote.as_str())
            .bind(&now)
            .bind(&self.folder)
            .bind(record.local_path.as_str())
            .execute(&mut *tx)
            .await?;
        }

        // Failures recorded under the old name do not follow the item
        let (clause, binds) = subtree_clause("local_path", from_local);
        let sql = format!("DELETE FROM retry_counters WHERE folder = ? AND {clause}");
        let mut query = sqlx::query(&sql).bind(&self.folder);
        for b in &binds {
            query = query.bind(b);
        }
        query.execute(&mut *tx).await?;

        tx.commit().await?;

        tracing::debug!(
            folder = %self.folder,
            from = %from,
            to = %to,
            records = records.len(),
            "Record subtree moved"
        );
        Ok(())
    }

    async fn list_tree(&self, prefix: &RelativePath) -> anyhow::Result<Vec<ChangeRecord>> {
        let (clause, binds) = subtree_clause("local_path", prefix);
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM change_records WHERE folder = ? AND {clause} \
             ORDER BY local_path"
        );
        let mut query = sqlx::query(&sql).bind(&self.folder);
        for b in &binds {
            query = query.bind(b);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn retry_count(&self, local: &RelativePath, kind: OperationKind) -> anyhow::Result<u32> {
        let count: Option<i64> = sqlx::query_scalar(
            "SELECT count FROM retry_counters WHERE folder = ? AND local_path = ? AND operation = ?",
        )
        .bind(&self.folder)
        .bind(local.as_str())
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(count.unwrap_or(0).max(0) as u32)
    }

    async fn increment_retry(
        &self,
        local: &RelativePath,
        kind: OperationKind,
    ) -> anyhow::Result<u32> {
        let count: i64 = sqlx::query_scalar(
            "INSERT INTO retry_counters (folder, local_path, operation, count, updated_at) \
             VALUES (?, ?, ?, 1, ?) \
             ON CONFLICT (folder, local_path, operation) \
             DO UPDATE SET count = count + 1, updated_at = excluded.updated_at \
             RETURNING count",
        )
        .bind(&self.folder)
        .bind(local.as_str())
        .bind(kind.as_str())
        .bind(Utc::now().to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!(folder = %self.folder, path = %local, operation = %kind, count, "Retry counter incremented");
        Ok(count.max(0) as u32)
    }

    async fn reset_retry(&self, local: &RelativePath, kind: OperationKind) -> anyhow::Result<()> {
        sqlx::query(
            "DELETE FROM retry_counters WHERE folder = ? AND local_path = ? AND operation = ?",
        )
        .bind(&self.folder)
        .bind(local.as_str())
        .bind(kind.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn change_log_token(&self) -> anyhow::Result<Option<ChangeToken>> {
        let token: Option<Option<String>> =
            sqlx::query_scalar("SELECT change_log_token FROM folder_state WHERE folder = ?")
                .bind(&self.folder)
                .fetch_optional(&self.pool)
                .await?;

        match token.flatten() {
            Some(t) if !t.is_empty() => Ok(Some(
                ChangeToken::new(t).map_err(|e| CacheError::SerializationError(e.to_string()))?,
            )),
            _ => Ok(None),
        }
    }

    async fn set_change_log_token(&self, token: &ChangeToken) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO folder_state (folder, change_log_token) VALUES (?, ?) \
             ON CONFLICT (folder) DO UPDATE SET change_log_token = excluded.change_log_token",
        )
        .bind(&self.folder)
        .bind(token.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last_full_sync(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        let at: Option<Option<String>> =
            sqlx::query_scalar("SELECT last_full_sync FROM folder_state WHERE folder = ?")
                .bind(&self.folder)
                .fetch_optional(&self.pool)
                .await?;
        Ok(parse_optional_datetime(at.flatten())?)
    }

    async fn mark_full_sync(&self, at: DateTime<Utc>) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO folder_state (folder, last_full_sync) VALUES (?, ?) \
             ON CONFLICT (folder) DO UPDATE SET last_full_sync = excluded.last_full_sync",
        )
        .bind(&self.folder)
        .bind(at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
