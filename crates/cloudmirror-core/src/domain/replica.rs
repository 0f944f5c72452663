//! Replica and ReplicaFragment entities
//!
//! A Replica is one physical copy of a File held by one account. A
//! fragmented Replica is stored as several ordered objects, each recorded
//! as a ReplicaFragment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::{
    AccountId, AccountKey, CalculatedId, ContentHash, FileId, FragmentId, LogicalPath, ProviderId,
    ReplicaId,
};
use super::status::EntryStatus;

/// One physical copy of a file in one account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    pub id: ReplicaId,
    pub file_id: Option<FileId>,
    pub calculated_id: CalculatedId,
    /// Where the copy lives in its account; may differ from the File path
    /// when a name collision forced a rename
    pub path: LogicalPath,
    pub name: String,
    pub size: u64,
    pub provider: ProviderId,
    pub account_id: AccountId,
    /// Provider object id; for fragmented replicas, the first fragment's id
    pub native_id: String,
    pub native_hash: Option<ContentHash>,
    pub mod_time: DateTime<Utc>,
    pub status: EntryStatus,
    pub fragmented: bool,
}

impl Replica {
    /// Create an active, unlinked replica observed in `account`
    #[must_use]
    pub fn new(
        account: &AccountKey,
        path: LogicalPath,
        size: u64,
        native_id: impl Into<String>,
        mod_time: DateTime<Utc>,
    ) -> Self {
        let name = path.file_name().to_string();
        Self {
            id: ReplicaId::new(),
            file_id: None,
            calculated_id: CalculatedId::from_parts(&name, size),
            path,
            name,
            size,
            provider: account.provider.clone(),
            account_id: account.account.clone(),
            native_id: native_id.into(),
            native_hash: None,
            mod_time,
            status: EntryStatus::Active,
            fragmented: false,
        }
    }

    #[must_use]
    pub fn account_key(&self) -> AccountKey {
        AccountKey::new(self.provider.clone(), self.account_id.clone())
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    #[must_use]
    pub fn with_file(mut self, file_id: FileId) -> Self {
        self.file_id = Some(file_id);
        self
    }

    #[must_use]
    pub fn with_hash(mut self, hash: Option<ContentHash>) -> Self {
        self.native_hash = hash;
        self
    }
}

/// One chunk of a fragmented replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaFragment {
    pub id: FragmentId,
    pub replica_id: ReplicaId,
    /// 1-based position within the set
    pub fragment_number: u32,
    pub fragments_total: u32,
    pub size: u64,
    pub native_fragment_id: String,
}

impl ReplicaFragment {
    #[must_use]
    pub fn new(
        replica_id: ReplicaId,
        fragment_number: u32,
        fragments_total: u32,
        size: u64,
        native_fragment_id: impl Into<String>,
    ) -> Self {
        Self {
            id: FragmentId::new(),
            replica_id,
            fragment_number,
            fragments_total,
            size,
            native_fragment_id: native_fragment_id.into(),
        }
    }
}
