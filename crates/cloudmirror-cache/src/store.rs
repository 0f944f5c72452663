//! SQLite implementation of IMetadataStore
//!
//! ## Type Mapping
//!
//! | Domain Type                      | SQL Type | Strategy                               |
//! |----------------------------------|----------|----------------------------------------|
//! | FileId, ReplicaId, FragmentId    | TEXT     | UUID string via `Display` / `FromStr`  |
//! | LogicalPath                      | TEXT     | normalized string, `NOCASE` on `files` |
//! | ProviderId, AccountId            | TEXT     | normalized lowercase string            |
//! | ContentHash                      | TEXT     | tagged `algorithm:value`               |
//! | EntryStatus                      | TEXT     | `active` / `soft_deleted` / `deleted`  |
//! | DateTime<Utc>                    | TEXT     | RFC 3339                               |
//! | u64 sizes                        | INTEGER  | saturating i64 conversion              |
//!
//! Writes go through helpers taking `&mut SqliteConnection` so the same
//! statements serve single calls and the scan transaction.

use std::fmt::Display;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use cloudmirror_core::domain::{
    AccountKey, CalculatedId, EntryStatus, File, FileId, Folder, LogicalPath, ProviderId, Replica,
    ReplicaFragment, ReplicaId,
};
use cloudmirror_core::ports::{
    AccountStorageSummary, DuplicateCandidate, DuplicateGroup, FileFilter, IMetadataStore,
    ScanBatch,
};

use crate::CacheError;

/// SQLite-based implementation of the metadata store port
pub struct SqliteMetadataStore {
    pool: SqlitePool,
}

impl SqliteMetadataStore {
    /// Creates a new store instance with the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

// ============================================================================
// Helper functions for type conversion
// ============================================================================

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, CacheError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CacheError::SerializationError(format!("bad timestamp '{s}': {e}")))
}

fn parse_field<T>(column: &str, value: &str) -> Result<T, CacheError>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .parse()
        .map_err(|e| CacheError::SerializationError(format!("{column} '{value}': {e}")))
}

fn parse_path(column: &str, value: &str) -> Result<LogicalPath, CacheError> {
    LogicalPath::new(value)
        .map_err(|e| CacheError::SerializationError(format!("{column} '{value}': {e}")))
}

fn to_sql_size(size: u64) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}

fn from_sql_size(size: i64) -> u64 {
    u64::try_from(size).unwrap_or(0)
}

/// Escape `%`, `_` and `\` for a LIKE pattern using `\` as escape character
fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

// ============================================================================
// Row mapping functions
// ============================================================================

fn file_from_row(row: &SqliteRow) -> Result<File, CacheError> {
    let id: String = row.try_get("id")?;
    let path: String = row.try_get("path")?;
    let size: i64 = row.try_get("size")?;
    let calculated_id: String = row.try_get("calculated_id")?;
    let mod_time: String = row.try_get("mod_time")?;
    let status: String = row.try_get("status")?;

    Ok(File {
        id: parse_field("files.id", &id)?,
        path: parse_path("files.path", &path)?,
        name: row.try_get("name")?,
        size: from_sql_size(size),
        calculated_id: CalculatedId::from_stored(calculated_id),
        mod_time: parse_datetime(&mod_time)?,
        status: parse_field("files.status", &status)?,
    })
}

fn replica_from_row(row: &SqliteRow) -> Result<Replica, CacheError> {
    let id: String = row.try_get("id")?;
    let file_id: Option<String> = row.try_get("file_id")?;
    let path: String = row.try_get("path")?;
    let size: i64 = row.try_get("size")?;
    let provider: String = row.try_get("provider")?;
    let account_id: String = row.try_get("account_id")?;
    let native_hash: Option<String> = row.try_get("native_hash")?;
    let mod_time: String = row.try_get("mod_time")?;
    let status: String = row.try_get("status")?;

    Ok(Replica {
        id: parse_field("replicas.id", &id)?,
        file_id: file_id
            .as_deref()
            .map(|v| parse_field("replicas.file_id", v))
            .transpose()?,
        calculated_id: CalculatedId::from_stored(row.try_get("calculated_id")?),
        path: parse_path("replicas.path", &path)?,
        name: row.try_get("name")?,
        size: from_sql_size(size),
        provider: parse_field("replicas.provider", &provider)?,
        account_id: parse_field("replicas.account_id", &account_id)?,
        native_id: row.try_get("native_id")?,
        native_hash: native_hash
            .as_deref()
            .filter(|v| !v.is_empty())
            .map(|v| parse_field("replicas.native_hash", v))
            .transpose()?,
        mod_time: parse_datetime(&mod_time)?,
        status: parse_field("replicas.status", &status)?,
        fragmented: row.try_get("fragmented")?,
    })
}

fn fragment_from_row(row: &SqliteRow) -> Result<ReplicaFragment, CacheError> {
    let id: String = row.try_get("id")?;
    let replica_id: String = row.try_get("replica_id")?;
    let number: i64 = row.try_get("fragment_number")?;
    let total: i64 = row.try_get("fragments_total")?;
    let size: i64 = row.try_get("size")?;

    Ok(ReplicaFragment {
        id: parse_field("replica_fragments.id", &id)?,
        replica_id: parse_field("replica_fragments.replica_id", &replica_id)?,
        fragment_number: u32::try_from(number).map_err(|e| {
            CacheError::SerializationError(format!("replica_fragments.fragment_number: {e}"))
        })?,
        fragments_total: u32::try_from(total).map_err(|e| {
            CacheError::SerializationError(format!("replica_fragments.fragments_total: {e}"))
        })?,
        size: from_sql_size(size),
        native_fragment_id: row.try_get("native_fragment_id")?,
    })
}

fn folder_from_row(row: &SqliteRow) -> Result<Folder, CacheError> {
    let path: String = row.try_get("path")?;
    let provider: String = row.try_get("provider")?;
    let owner: String = row.try_get("owner_account_id")?;

    Ok(Folder {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        path: parse_path("folders.path", &path)?,
        provider: parse_field("folders.provider", &provider)?,
        owner_account_id: parse_field("folders.owner_account_id", &owner)?,
        parent_folder_id: row.try_get("parent_folder_id")?,
    })
}

fn map_rows<T>(
    rows: &[SqliteRow],
    f: fn(&SqliteRow) -> Result<T, CacheError>,
) -> Result<Vec<T>, CacheError> {
    rows.iter().map(f).collect()
}

// ============================================================================
// Statement helpers shared by single writes and transactions
// ============================================================================

async fn upsert_file_on(conn: &mut SqliteConnection, file: &File) -> Result<(), CacheError> {
    sqlx::query(
        "INSERT INTO files (id, path, name, size, calculated_id, mod_time, status) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET \
            path = excluded.path, name = excluded.name, size = excluded.size, \
            calculated_id = excluded.calculated_id, mod_time = excluded.mod_time, \
            status = excluded.status",
    )
    .bind(file.id.to_string())
    .bind(file.path.as_str())
    .bind(&file.name)
    .bind(to_sql_size(file.size))
    .bind(file.calculated_id.as_str())
    .bind(file.mod_time.to_rfc3339())
    .bind(file.status.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn upsert_replica_on(
    conn: &mut SqliteConnection,
    replica: &Replica,
) -> Result<(), CacheError> {
    sqlx::query(
        "INSERT INTO replicas \
            (id, file_id, calculated_id, path, name, size, provider, account_id, \
             native_id, native_hash, mod_time, status, fragmented) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET \
            file_id = excluded.file_id, calculated_id = excluded.calculated_id, \
            path = excluded.path, name = excluded.name, size = excluded.size, \
            provider = excluded.provider, account_id = excluded.account_id, \
            native_id = excluded.native_id, native_hash = excluded.native_hash, \
            mod_time = excluded.mod_time, status = excluded.status, \
            fragmented = excluded.fragmented",
    )
    .bind(replica.id.to_string())
    .bind(replica.file_id.map(|id| id.to_string()))
    .bind(replica.calculated_id.as_str())
    .bind(replica.path.as_str())
    .bind(&replica.name)
    .bind(to_sql_size(replica.size))
    .bind(replica.provider.as_str())
    .bind(replica.account_id.as_str())
    .bind(&replica.native_id)
    .bind(replica.native_hash.as_ref().map(|h| h.to_string()))
    .bind(replica.mod_time.to_rfc3339())
    .bind(replica.status.as_str())
    .bind(replica.fragmented)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn replace_fragments_on(
    conn: &mut SqliteConnection,
    replica_id: &ReplicaId,
    fragments: &[ReplicaFragment],
) -> Result<(), CacheError> {
    sqlx::query("DELETE FROM replica_fragments WHERE replica_id = ?")
        .bind(replica_id.to_string())
        .execute(&mut *conn)
        .await?;
    for fragment in fragments {
        sqlx::query(
            "INSERT INTO replica_fragments \
                (id, replica_id, fragment_number, fragments_total, size, native_fragment_id) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(fragment.id.to_string())
        .bind(replica_id.to_string())
        .bind(i64::from(fragment.fragment_number))
        .bind(i64::from(fragment.fragments_total))
        .bind(to_sql_size(fragment.size))
        .bind(&fragment.native_fragment_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn upsert_folder_on(conn: &mut SqliteConnection, folder: &Folder) -> Result<(), CacheError> {
    sqlx::query(
        "INSERT INTO folders (id, name, path, provider, owner_account_id, parent_folder_id) \
         VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT(provider, owner_account_id, id) DO UPDATE SET \
            name = excluded.name, path = excluded.path, \
            parent_folder_id = excluded.parent_folder_id",
    )
    .bind(&folder.id)
    .bind(&folder.name)
    .bind(folder.path.as_str())
    .bind(folder.provider.as_str())
    .bind(folder.owner_account_id.as_str())
    .bind(&folder.parent_folder_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn mark_status_on(
    conn: &mut SqliteConnection,
    replica_id: &ReplicaId,
    status: EntryStatus,
) -> Result<(), CacheError> {
    sqlx::query("UPDATE replicas SET status = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(replica_id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// A File is active if any replica is, else soft-deleted if any replica
/// is, else deleted
async fn refresh_status_on(
    conn: &mut SqliteConnection,
    file_id: &FileId,
) -> Result<EntryStatus, CacheError> {
    sqlx::query(
        "UPDATE files SET status = ( \
            SELECT CASE MIN(CASE r.status WHEN 'active' THEN 0 \
                                          WHEN 'soft_deleted' THEN 1 ELSE 2 END) \
                WHEN 0 THEN 'active' WHEN 1 THEN 'soft_deleted' ELSE 'deleted' END \
            FROM replicas r WHERE r.file_id = files.id) \
         WHERE id = ?",
    )
    .bind(file_id.to_string())
    .execute(&mut *conn)
    .await?;

    let status: Option<String> = sqlx::query_scalar("SELECT status FROM files WHERE id = ?")
        .bind(file_id.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    match status {
        Some(s) => parse_field("files.status", &s),
        None => Ok(EntryStatus::Deleted),
    }
}

// ============================================================================
// IMetadataStore implementation
// ============================================================================

#[async_trait]
impl IMetadataStore for SqliteMetadataStore {
    // --- Files ---

    async fn upsert_file(&self, file: &File) -> anyhow::Result<()> {
        let mut conn = self.pool.acquire().await?;
        upsert_file_on(&mut conn, file).await?;
        tracing::trace!(file_id = %file.id, path = %file.path, "Saved file");
        Ok(())
    }

    async fn get_file(&self, id: &FileId) -> anyhow::Result<Option<File>> {
        let row = sqlx::query("SELECT * FROM files WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(file_from_row).transpose()?)
    }

    async fn find_files_by_path(&self, path: &LogicalPath) -> anyhow::Result<Vec<File>> {
        let rows = sqlx::query("SELECT * FROM files WHERE path = ? COLLATE NOCASE ORDER BY mod_time, id")
            .bind(path.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(map_rows(&rows, file_from_row)?)
    }

    async fn find_files_by_calculated_id(&self, id: &CalculatedId) -> anyhow::Result<Vec<File>> {
        let rows = sqlx::query("SELECT * FROM files WHERE calculated_id = ? ORDER BY mod_time, id")
            .bind(id.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(map_rows(&rows, file_from_row)?)
    }

    async fn list_files(&self, filter: &FileFilter) -> anyhow::Result<Vec<File>> {
        let mut sql = String::from("SELECT * FROM files WHERE 1=1");
        let mut binds: Vec<String> = Vec::new();

        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            binds.push(status.as_str().to_string());
        }

        if let Some(prefix) = filter.path_prefix.as_ref().filter(|p| !p.is_root()) {
            sql.push_str(" AND (path = ? OR path LIKE ? ESCAPE '\\')");
            binds.push(prefix.as_str().to_string());
            binds.push(format!("{}/%", escape_like(prefix.as_str())));
        }

        sql.push_str(" ORDER BY path, id");

        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(map_rows(&rows, file_from_row)?)
    }

    async fn delete_file(&self, id: &FileId) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        tracing::trace!(file_id = %id, "Deleted file");
        Ok(())
    }

    async fn refresh_file_status(&self, id: &FileId) -> anyhow::Result<EntryStatus> {
        let mut conn = self.pool.acquire().await?;
        Ok(refresh_status_on(&mut conn, id).await?)
    }

    // --- Replicas ---

    async fn upsert_replica(&self, replica: &Replica) -> anyhow::Result<()> {
        let mut conn = self.pool.acquire().await?;
        upsert_replica_on(&mut conn, replica).await?;
        tracing::trace!(replica_id = %replica.id, native_id = %replica.native_id, "Saved replica");
        Ok(())
    }

    async fn get_replica(&self, id: &ReplicaId) -> anyhow::Result<Option<Replica>> {
        let row = sqlx::query("SELECT * FROM replicas WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(replica_from_row).transpose()?)
    }

    async fn get_replica_by_native_id(
        &self,
        account: &AccountKey,
        native_id: &str,
    ) -> anyhow::Result<Option<Replica>> {
        let row = sqlx::query(
            "SELECT * FROM replicas WHERE provider = ? AND account_id = ? AND native_id = ?",
        )
        .bind(account.provider.as_str())
        .bind(account.account.as_str())
        .bind(native_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(replica_from_row).transpose()?)
    }

    async fn get_replicas_for_file(&self, file_id: &FileId) -> anyhow::Result<Vec<Replica>> {
        let rows = sqlx::query(
            "SELECT * FROM replicas WHERE file_id = ? ORDER BY provider, account_id, path, id",
        )
        .bind(file_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(map_rows(&rows, replica_from_row)?)
    }

    async fn get_replicas_by_account(&self, account: &AccountKey) -> anyhow::Result<Vec<Replica>> {
        let rows = sqlx::query(
            "SELECT * FROM replicas WHERE provider = ? AND account_id = ? ORDER BY path, id",
        )
        .bind(account.provider.as_str())
        .bind(account.account.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(map_rows(&rows, replica_from_row)?)
    }

    async fn mark_replica_status(
        &self,
        id: &ReplicaId,
        status: EntryStatus,
    ) -> anyhow::Result<()> {
        let mut conn = self.pool.acquire().await?;
        mark_status_on(&mut conn, id, status).await?;
        tracing::trace!(replica_id = %id, status = %status, "Replica status changed");
        Ok(())
    }

    async fn delete_replica(&self, id: &ReplicaId) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM replicas WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Fragments ---

    async fn replace_fragments(
        &self,
        replica_id: &ReplicaId,
        fragments: &[ReplicaFragment],
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        replace_fragments_on(&mut tx, replica_id, fragments).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_fragments(&self, replica_id: &ReplicaId) -> anyhow::Result<Vec<ReplicaFragment>> {
        let rows = sqlx::query(
            "SELECT * FROM replica_fragments WHERE replica_id = ? ORDER BY fragment_number",
        )
        .bind(replica_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(map_rows(&rows, fragment_from_row)?)
    }

    // --- Folders ---

    async fn upsert_folder(&self, folder: &Folder) -> anyhow::Result<()> {
        let mut conn = self.pool.acquire().await?;
        upsert_folder_on(&mut conn, folder).await?;
        Ok(())
    }

    async fn get_folders_by_account(&self, account: &AccountKey) -> anyhow::Result<Vec<Folder>> {
        let rows = sqlx::query(
            "SELECT * FROM folders WHERE provider = ? AND owner_account_id = ? ORDER BY path, id",
        )
        .bind(account.provider.as_str())
        .bind(account.account.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(map_rows(&rows, folder_from_row)?)
    }

    // --- Analysis ---

    async fn find_duplicate_groups(
        &self,
        provider: &ProviderId,
    ) -> anyhow::Result<Vec<DuplicateGroup>> {
        let calculated_ids: Vec<String> = sqlx::query_scalar(
            "SELECT f.calculated_id FROM files f \
             JOIN replicas r ON r.file_id = f.id \
             WHERE r.provider = ? AND r.status = 'active' AND f.status = 'active' \
             GROUP BY f.calculated_id HAVING COUNT(DISTINCT f.id) > 1 \
             ORDER BY f.calculated_id",
        )
        .bind(provider.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut groups = Vec::with_capacity(calculated_ids.len());
        for calculated_id in calculated_ids {
            let rows = sqlx::query(
                "SELECT * FROM files f WHERE f.calculated_id = ? AND f.status = 'active' \
                 AND EXISTS (SELECT 1 FROM replicas r WHERE r.file_id = f.id \
                             AND r.provider = ? AND r.status = 'active') \
                 ORDER BY f.mod_time, f.path, f.id",
            )
            .bind(&calculated_id)
            .bind(provider.as_str())
            .fetch_all(&self.pool)
            .await?;

            let mut members = Vec::with_capacity(rows.len());
            for file in map_rows(&rows, file_from_row)? {
                let replica_rows = sqlx::query(
                    "SELECT * FROM replicas WHERE file_id = ? AND provider = ? \
                     AND status = 'active' ORDER BY account_id, path, id",
                )
                .bind(file.id.to_string())
                .bind(provider.as_str())
                .fetch_all(&self.pool)
                .await?;
                members.push(DuplicateCandidate {
                    file,
                    replicas: map_rows(&replica_rows, replica_from_row)?,
                });
            }

            groups.push(DuplicateGroup {
                provider: provider.clone(),
                calculated_id: CalculatedId::from_stored(calculated_id),
                members,
            });
        }

        tracing::debug!(provider = %provider, groups = groups.len(), "Duplicate groups found");
        Ok(groups)
    }

    async fn get_largest_files_exclusive(
        &self,
        account: &AccountKey,
    ) -> anyhow::Result<Vec<(File, Replica)>> {
        let rows = sqlx::query(
            "SELECT r.* FROM replicas r JOIN files f ON f.id = r.file_id \
             WHERE r.provider = ? AND r.account_id = ? AND r.status = 'active' \
             AND NOT EXISTS ( \
                SELECT 1 FROM replicas o JOIN files fo ON fo.id = o.file_id \
                WHERE o.provider = r.provider AND o.account_id <> r.account_id \
                AND o.status = 'active' AND fo.calculated_id = f.calculated_id) \
             ORDER BY r.size DESC, r.path, r.id",
        )
        .bind(account.provider.as_str())
        .bind(account.account.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut result = Vec::with_capacity(rows.len());
        for replica in map_rows(&rows, replica_from_row)? {
            let Some(file_id) = replica.file_id else {
                continue;
            };
            if let Some(file) = self.get_file(&file_id).await? {
                result.push((file, replica));
            }
        }
        Ok(result)
    }

    async fn apply_scan(&self, batch: &ScanBatch) -> anyhow::Result<()> {
        let account = &batch.account;
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM folders WHERE provider = ? AND owner_account_id = ?")
            .bind(account.provider.as_str())
            .bind(account.account.as_str())
            .execute(&mut *tx)
            .await?;
        for folder in &batch.folders {
            upsert_folder_on(&mut tx, folder).await?;
        }
        for file in &batch.files {
            upsert_file_on(&mut tx, file).await?;
        }
        for replica in &batch.replicas {
            upsert_replica_on(&mut tx, replica).await?;
        }
        for (replica_id, fragments) in &batch.fragments {
            replace_fragments_on(&mut tx, replica_id, fragments).await?;
        }
        for (replica_id, status) in &batch.status_changes {
            mark_status_on(&mut tx, replica_id, *status).await?;
        }
        for file_id in &batch.touched_files {
            refresh_status_on(&mut tx, file_id).await?;
        }

        tx.commit().await?;
        tracing::debug!(
            account = %account,
            folders = batch.folders.len(),
            files = batch.files.len(),
            replicas = batch.replicas.len(),
            status_changes = batch.status_changes.len(),
            "Scan batch committed"
        );
        Ok(())
    }

    async fn storage_summary(&self) -> anyhow::Result<Vec<AccountStorageSummary>> {
        let rows = sqlx::query(
            "SELECT provider, account_id, \
                SUM(CASE WHEN status = 'active' THEN 1 ELSE 0 END) AS active_replicas, \
                SUM(CASE WHEN status = 'active' THEN size ELSE 0 END) AS active_bytes, \
                SUM(CASE WHEN status = 'soft_deleted' THEN 1 ELSE 0 END) AS soft_deleted_replicas, \
                SUM(CASE WHEN status = 'deleted' THEN 1 ELSE 0 END) AS deleted_replicas, \
                SUM(CASE WHEN status = 'active' AND fragmented = 1 THEN 1 ELSE 0 END) AS fragmented_replicas \
             FROM replicas GROUP BY provider, account_id ORDER BY provider, account_id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in &rows {
            let provider: String = row.try_get("provider")?;
            let account: String = row.try_get("account_id")?;
            summaries.push(AccountStorageSummary {
                account: AccountKey::new(
                    parse_field("replicas.provider", &provider)?,
                    parse_field("replicas.account_id", &account)?,
                ),
                active_replicas: from_sql_size(row.try_get("active_replicas")?),
                active_bytes: from_sql_size(row.try_get("active_bytes")?),
                soft_deleted_replicas: from_sql_size(row.try_get("soft_deleted_replicas")?),
                deleted_replicas: from_sql_size(row.try_get("deleted_replicas")?),
                fragmented_replicas: from_sql_size(row.try_get("fragmented_replicas")?),
            });
        }
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("a_b%c\\d"), "a\\_b\\%c\\\\d");
        assert_eq!(escape_like("docs"), "docs");
    }

    #[test]
    fn test_size_conversion_saturates() {
        assert_eq!(to_sql_size(u64::MAX), i64::MAX);
        assert_eq!(from_sql_size(-1), 0);
        assert_eq!(from_sql_size(42), 42);
    }

    #[test]
    fn test_parse_datetime_roundtrip() {
        let now = Utc::now();
        assert_eq!(parse_datetime(&now.to_rfc3339()).unwrap(), now);
        assert!(parse_datetime("yesterday").is_err());
    }
}
