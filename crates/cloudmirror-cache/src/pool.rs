//! Database connection pool management
//!
//! Wraps SQLx's `SqlitePool`. File-backed databases run in WAL mode with
//! a small pool; in-memory databases use exactly one connection because
//! every SQLite memory database is private to its connection.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::CacheError;

const MAX_FILE_CONNECTIONS: u32 = 5;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const INITIAL_MIGRATION: &str = include_str!("migrations/20260301_initial.sql");

/// Connection pool for the metadata database
pub struct DatabasePool {
    pool: SqlitePool,
}

impl DatabasePool {
    /// Open (creating if needed) the database at `db_path` and migrate it
    ///
    /// # Errors
    ///
    /// `CacheError::ConnectionFailed` when the directory or database cannot
    /// be opened, `CacheError::MigrationFailed` when the schema cannot be
    /// applied.
    pub async fn new(db_path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                CacheError::ConnectionFailed(format!("cannot create {}: {e}", parent.display()))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = Self::connect(options, MAX_FILE_CONNECTIONS)
            .await
            .map_err(|e| {
                CacheError::ConnectionFailed(format!("cannot open {}: {e}", db_path.display()))
            })?;
        Self::run_migrations(&pool).await?;

        tracing::info!(path = %db_path.display(), "Metadata database opened");
        Ok(Self { pool })
    }

    /// Fresh in-memory database, used by tests
    pub async fn in_memory() -> Result<Self, CacheError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| CacheError::ConnectionFailed(e.to_string()))?
            .foreign_keys(true);
        // the database lives exactly as long as its single connection
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| CacheError::ConnectionFailed(format!("in-memory database: {e}")))?;
        Self::run_migrations(&pool).await?;

        tracing::debug!("In-memory metadata database ready");
        Ok(Self { pool })
    }

    /// The underlying SQLx pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn connect(
        options: SqliteConnectOptions,
        max_connections: u32,
    ) -> Result<SqlitePool, sqlx::Error> {
        SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
    }

    /// Apply the schema; every statement is `IF NOT EXISTS`, so re-running is harmless
    pub(crate) async fn run_migrations(pool: &SqlitePool) -> Result<(), CacheError> {
        sqlx::raw_sql(INITIAL_MIGRATION)
            .execute(pool)
            .await
            .map_err(|e| CacheError::MigrationFailed(e.to_string()))?;
        tracing::debug!("Metadata schema up to date");
        Ok(())
    }
}
