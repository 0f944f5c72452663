//! Per-account scan markers
//!
//! A scan holds the write side of its account's lock for its whole
//! duration. Analysis passes (dedup, balance) take the read side, so they
//! either wait a scan out or, with [`ScanMarkers::try_read`], skip the
//! account.
//!
//! Linking observed objects to Files looks at what other accounts already
//! committed, so that step runs under one lock shared by all accounts.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use cloudmirror_core::domain::AccountKey;

#[derive(Debug, Clone, Default)]
pub struct ScanMarkers {
    locks: Arc<DashMap<AccountKey, Arc<RwLock<()>>>>,
    commit: Arc<Mutex<()>>,
}

impl ScanMarkers {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, account: &AccountKey) -> Arc<RwLock<()>> {
        // clone out so no map shard stays locked across an await
        Arc::clone(self.locks.entry(account.clone()).or_default().value())
    }

    /// Mark a scan of `account` as in progress until the guard drops
    pub async fn begin_scan(&self, account: &AccountKey) -> OwnedRwLockWriteGuard<()> {
        self.lock_for(account).write_owned().await
    }

    /// Wait until no scan of `account` is running
    pub async fn read(&self, account: &AccountKey) -> OwnedRwLockReadGuard<()> {
        self.lock_for(account).read_owned().await
    }

    /// `None` while a scan of `account` is running
    pub fn try_read(&self, account: &AccountKey) -> Option<OwnedRwLockReadGuard<()>> {
        self.lock_for(account).try_read_owned().ok()
    }

    pub fn is_scanning(&self, account: &AccountKey) -> bool {
        self.try_read(account).is_none()
    }

    /// Held while a scan links objects to Files and commits its batch
    pub async fn commit_lock(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.commit).lock_owned().await
    }
}
