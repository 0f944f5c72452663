//! Batch reports
//!
//! Per-item and per-account failures are collected here instead of
//! aborting a batch. [`BatchReport::has_failures`] drives the exit status.

use serde::Serialize;

use cloudmirror_core::domain::AccountKey;

use crate::ops::PlannedAction;

/// One item of a batch that could not be processed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub item: String,
    pub error: String,
}

impl ItemFailure {
    pub fn new(item: impl ToString, error: impl ToString) -> Self {
        Self {
            item: item.to_string(),
            error: error.to_string(),
        }
    }
}

pub trait BatchReport {
    fn failures(&self) -> &[ItemFailure];

    fn has_failures(&self) -> bool {
        !self.failures().is_empty()
    }
}

/// What one account's scan found
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountScanSummary {
    pub account: AccountKey,
    pub folders: usize,
    pub objects: usize,
    pub new_replicas: usize,
    pub updated_replicas: usize,
    pub new_files: usize,
    pub soft_deleted: usize,
    pub deleted: usize,
    pub fragmented: usize,
    /// Objects whose content had to be downloaded to hash it
    pub hashed: usize,
    pub failures: Vec<ItemFailure>,
}

impl AccountScanSummary {
    pub fn new(account: AccountKey) -> Self {
        Self {
            account,
            folders: 0,
            objects: 0,
            new_replicas: 0,
            updated_replicas: 0,
            new_files: 0,
            soft_deleted: 0,
            deleted: 0,
            fragmented: 0,
            hashed: 0,
            failures: Vec::new(),
        }
    }
}

/// Scans of several accounts; `failures` holds accounts that could not be
/// scanned at all
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub accounts: Vec<AccountScanSummary>,
    pub failures: Vec<ItemFailure>,
}

impl ScanReport {
    pub fn merge(&mut self, other: ScanReport) {
        self.accounts.extend(other.accounts);
        self.failures.extend(other.failures);
    }
}

impl BatchReport for ScanReport {
    fn failures(&self) -> &[ItemFailure] {
        &self.failures
    }

    fn has_failures(&self) -> bool {
        !self.failures.is_empty() || self.accounts.iter().any(|a| !a.failures.is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub files_checked: usize,
    pub uploaded: usize,
    pub restored: usize,
    /// Uploads that went to a suffixed name because of a collision
    pub renamed: usize,
    pub actions: Vec<PlannedAction>,
    pub verified_accounts: Vec<AccountKey>,
    pub failures: Vec<ItemFailure>,
}

impl BatchReport for ReconcileReport {
    fn failures(&self) -> &[ItemFailure] {
        &self.failures
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DedupReport {
    pub groups: usize,
    /// Groups left alone because content hashes were missing or disagreed
    pub ambiguous_groups: usize,
    pub files_removed: usize,
    pub replicas_deleted: usize,
    pub replicas_trashed: usize,
    pub actions: Vec<PlannedAction>,
    pub failures: Vec<ItemFailure>,
}

impl BatchReport for DedupReport {
    fn failures(&self) -> &[ItemFailure] {
        &self.failures
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BalanceReport {
    pub moved: usize,
    pub transferred: usize,
    /// Transfers waiting for the receiving account to accept
    pub pending_consent: usize,
    pub copied: usize,
    /// Main-account replicas dropped because a backup already held the file
    pub redundant_removed: usize,
    pub bytes_moved: u64,
    /// Accounts still above the low watermark when the run ended
    pub unresolved: Vec<AccountKey>,
    pub actions: Vec<PlannedAction>,
    pub failures: Vec<ItemFailure>,
}

impl BatchReport for BalanceReport {
    fn failures(&self) -> &[ItemFailure] {
        &self.failures
    }

    fn has_failures(&self) -> bool {
        !self.failures.is_empty() || !self.unresolved.is_empty()
    }
}
