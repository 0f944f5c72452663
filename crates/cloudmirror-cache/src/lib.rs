//! SQLite implementation of the metadata store
//!
//! Tables `files`, `replicas`, `replica_fragments` and `folders` are read by
//! operators with plain database tools, so their columns are kept stable.
//! One scan of one account is written by [`SqliteMetadataStore`] in a single
//! transaction; readers never see half of it.
//!
//! ```no_run
//! use std::path::Path;
//! use cloudmirror_cache::{DatabasePool, SqliteMetadataStore};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let pool = DatabasePool::new(Path::new("/var/lib/cloudmirror/metadata.db")).await?;
//! let store = SqliteMetadataStore::new(pool.pool().clone());
//! # Ok(())
//! # }
//! ```

pub mod pool;
pub mod store;

pub use pool::DatabasePool;
pub use store::SqliteMetadataStore;

/// Failures of the SQLite store
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// A stored value could not be mapped back to a domain type
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<sqlx::Error> for CacheError {
    fn from(e: sqlx::Error) -> Self {
        CacheError::QueryFailed(e.to_string())
    }
}
