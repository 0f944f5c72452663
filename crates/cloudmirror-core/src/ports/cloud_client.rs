//! Cloud client port (driven/secondary port)
//!
//! The uniform interface every storage backend implements. One client is
//! bound to exactly one (provider, account) pair.
//!
//! ## Design Notes
//!
//! - Errors are classified in [`CloudError`] so callers can tell transient
//!   failures (retried) from permission, not-found and sync-root problems.
//! - `RemoteFile` and `RemoteFolder` are port-level DTOs; the scanner maps
//!   them to `Replica` and `Folder` entities.
//! - Streams are boxed `AsyncRead` so large objects never need to be held
//!   in memory.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncRead;

use crate::domain::newtypes::{AccountId, AccountKey, ContentHash};

/// Byte stream handed across the port
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

// ============================================================================
// Errors
// ============================================================================

/// Classified failures returned by cloud clients
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CloudError {
    /// Network or service hiccup, safe to retry
    #[error("Transient error: {0}")]
    Transient(String),

    /// Provider throttled the request
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    /// Provider-side failure (5xx equivalent)
    #[error("Server error: {0}")]
    ServerError(String),

    /// The account may not perform this operation on the object
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// More than one folder carries the sync folder name
    #[error("Ambiguous sync root: {count} folders named '{name}'")]
    AmbiguousSyncRoot { name: String, count: usize },

    #[error("Sync root '{0}' not found")]
    SyncRootMissing(String),

    /// The backend does not implement the operation
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("{0}")]
    Other(String),
}

impl CloudError {
    /// Whether retrying the same request may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::RateLimited { .. } | Self::ServerError(_)
        )
    }
}

impl From<std::io::Error> for CloudError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => Self::NotFound(err.to_string()),
            ErrorKind::PermissionDenied => Self::PermissionDenied(err.to_string()),
            ErrorKind::TimedOut | ErrorKind::Interrupted | ErrorKind::ConnectionReset => {
                Self::Transient(err.to_string())
            }
            _ => Self::Io(err.to_string()),
        }
    }
}

// ============================================================================
// DTOs
// ============================================================================

/// A folder as listed by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFolder {
    pub native_id: String,
    pub name: String,
    pub parent_id: Option<String>,
}

/// A stored object as listed by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub native_id: String,
    pub name: String,
    pub size: u64,
    pub mod_time: DateTime<Utc>,
    /// Provider-computed digest, when the provider exposes one
    pub native_hash: Option<ContentHash>,
    pub parent_id: Option<String>,
}

/// Storage usage of one account, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub total: u64,
    pub used: u64,
}

impl Quota {
    #[must_use]
    pub fn free(&self) -> u64 {
        self.total.saturating_sub(self.used)
    }

    /// Fraction of the quota in use; a zero quota counts as full
    #[must_use]
    pub fn usage_ratio(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.used as f64 / self.total as f64
    }
}

/// Result of an ownership transfer request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferOutcome {
    /// The target account now owns the object
    Transferred,
    /// The target must accept the transfer before it takes effect
    PendingConsent,
}

/// Access level granted when sharing a folder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShareRole {
    Reader,
    Writer,
}

/// Identity of the authenticated account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub account_id: AccountId,
    pub display_name: Option<String>,
}

// ============================================================================
// ICloudClient trait
// ============================================================================

/// Port trait for one account's cloud storage
///
/// All methods except [`ICloudClient::account`] perform I/O against the
/// provider. Folder and file arguments are provider-native ids.
#[async_trait]
pub trait ICloudClient: Send + Sync {
    /// The (provider, account) this client is bound to
    fn account(&self) -> &AccountKey;

    /// Verify the account is reachable and the sync root is unambiguous
    ///
    /// Returns the sync root folder id. Fails with
    /// [`CloudError::AmbiguousSyncRoot`] when several folders carry the
    /// sync folder name.
    async fn pre_flight_check(&self) -> Result<String, CloudError>;

    /// Locate the sync root folder without further checks
    async fn get_sync_folder_id(&self) -> Result<String, CloudError>;

    async fn list_folders(&self, parent_id: &str) -> Result<Vec<RemoteFolder>, CloudError>;

    async fn list_files(&self, folder_id: &str) -> Result<Vec<RemoteFile>, CloudError>;

    /// Store `size` bytes read from `content` as `name` inside `folder_id`
    async fn upload_file(
        &self,
        folder_id: &str,
        name: &str,
        content: ByteStream,
        size: u64,
    ) -> Result<RemoteFile, CloudError>;

    async fn download_file(&self, native_id: &str) -> Result<ByteStream, CloudError>;

    /// Permanently remove an object
    async fn delete_file(&self, native_id: &str) -> Result<(), CloudError>;

    /// Move an object into another folder, returning its new metadata
    async fn move_file(&self, native_id: &str, folder_id: &str) -> Result<RemoteFile, CloudError>;

    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<RemoteFolder, CloudError>;

    async fn share_folder(
        &self,
        folder_id: &str,
        with: &AccountId,
        role: ShareRole,
    ) -> Result<(), CloudError>;

    async fn get_quota(&self) -> Result<Quota, CloudError>;

    /// Hand an object over to another account of the same provider
    async fn transfer_ownership(
        &self,
        native_id: &str,
        to: &AccountId,
    ) -> Result<TransferOutcome, CloudError>;

    async fn get_user_identity(&self) -> Result<UserIdentity, CloudError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(CloudError::Transient("reset".into()).is_transient());
        assert!(CloudError::RateLimited { retry_after: None }.is_transient());
        assert!(CloudError::ServerError("503".into()).is_transient());
        assert!(!CloudError::PermissionDenied("no".into()).is_transient());
        assert!(!CloudError::NotFound("x".into()).is_transient());
        assert!(!CloudError::AmbiguousSyncRoot { name: "s".into(), count: 2 }.is_transient());
    }

    #[test]
    fn test_io_error_mapping() {
        let err: CloudError = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert!(matches!(err, CloudError::NotFound(_)));
        let err: CloudError = std::io::Error::from(std::io::ErrorKind::PermissionDenied).into();
        assert!(matches!(err, CloudError::PermissionDenied(_)));
    }

    #[test]
    fn test_quota_ratio() {
        let q = Quota { total: 100, used: 96 };
        assert_eq!(q.free(), 4);
        assert!(q.usage_ratio() > 0.95);
        assert_eq!(Quota { total: 0, used: 0 }.usage_ratio(), 1.0);
        assert_eq!(Quota { total: 10, used: 20 }.free(), 0);
    }
}
