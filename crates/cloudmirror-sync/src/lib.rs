//! cloudmirror sync - replica reconciliation engines
//!
//! Provides:
//! - Metadata scanning that rebuilds the replica index from remote listings
//! - Cross-provider reconciliation (missing replicas, collisions, restores)
//! - Deduplication within a provider
//! - Quota-driven balancing and main-account evacuation
//! - Fragmentation for providers with an object size ceiling
//!
//! ## Modules
//!
//! - [`scanner`] - Per-account metadata scan
//! - [`reconcile`] - Cross-provider replica reconciliation
//! - [`dedup`] - Duplicate removal policies
//! - [`balance`] - Storage balancing and evacuation
//! - [`fragment`] - Split and reassemble oversized objects
//! - [`operations`] - Top-level commands, each starting with a metadata refresh

pub mod balance;
pub mod context;
pub mod dedup;
pub mod fragment;
pub mod hashing;
pub mod markers;
pub mod namer;
pub mod operations;
pub mod ops;
pub mod reconcile;
pub mod report;
pub mod scanner;

use std::time::Duration;

use thiserror::Error;

use cloudmirror_core::domain::{AccountKey, DomainError, ProviderId, ReplicaId};
use cloudmirror_core::ports::CloudError;

pub use balance::StorageBalancer;
pub use context::{EngineSettings, ReconcileContext};
pub use dedup::{DeduplicationEngine, DuplicateChooser, OldestWins};
pub use fragment::FragmentManager;
pub use markers::ScanMarkers;
pub use operations::Outcome;
pub use ops::{MutationGate, PlannedAction};
pub use reconcile::ReconciliationEngine;
pub use report::{
    AccountScanSummary, BalanceReport, BatchReport, DedupReport, ItemFailure, ReconcileReport,
    ScanReport,
};
pub use scanner::MetadataScanner;

/// Errors raised by the reconciliation engines
#[derive(Debug, Error)]
pub enum SyncError {
    /// A cloud call failed after retries
    #[error("cloud error on {account}: {source}")]
    Cloud {
        account: AccountKey,
        #[source]
        source: CloudError,
    },

    /// The metadata store failed
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),

    /// Stored fragments cannot reproduce the replica
    #[error("corrupt fragment set for replica {replica}: {reason}")]
    CorruptFragmentSet { replica: ReplicaId, reason: String },

    /// Backups cannot absorb the main account's data
    #[error("backups of {provider} have {available} bytes free, {required} needed")]
    InsufficientBackupSpace {
        provider: ProviderId,
        required: u64,
        available: u64,
    },

    /// No backup account has room for a file
    #[error("no backup account of {provider} can take {path} ({size} bytes)")]
    NoEligibleBackup {
        provider: ProviderId,
        path: String,
        size: u64,
    },

    #[error("unknown account {0}")]
    UnknownAccount(AccountKey),

    /// A long-running command hit its overall deadline
    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
}

impl SyncError {
    pub fn cloud(account: &AccountKey, source: CloudError) -> Self {
        Self::Cloud {
            account: account.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cloud_error_names_account() {
        let key = AccountKey::parse("google", "a@x.com").unwrap();
        let err = SyncError::cloud(&key, CloudError::NotFound("abc".into()));
        assert_eq!(err.to_string(), "cloud error on google/a@x.com: Not found: abc");
    }
}
