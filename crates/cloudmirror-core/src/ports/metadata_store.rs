//! Metadata store port (driven/secondary port)
//!
//! Persistent index of Files, Replicas, ReplicaFragments and Folders.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because storage errors are adapter-specific
//!   and don't need domain-level classification.
//! - [`ScanBatch`] lets a scanner commit everything it learned about one
//!   account atomically, so readers never see a half-applied scan.
//! - All write operations take references to domain entities, allowing
//!   the caller to retain ownership.

use async_trait::async_trait;
use serde::Serialize;

use crate::domain::{
    AccountKey, CalculatedId, EntryStatus, File, FileId, Folder, LogicalPath, ProviderId, Replica,
    ReplicaFragment, ReplicaId,
};

// ============================================================================
// Query and batch types
// ============================================================================

/// Filter criteria for listing files
///
/// All fields are optional and combined with AND logic.
#[derive(Debug, Clone, Default)]
pub struct FileFilter {
    pub status: Option<EntryStatus>,
    /// Only files under this folder (case-insensitive)
    pub path_prefix: Option<LogicalPath>,
}

impl FileFilter {
    /// Creates a new empty filter (matches all files)
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: EntryStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_path_prefix(mut self, prefix: LogicalPath) -> Self {
        self.path_prefix = Some(prefix);
        self
    }
}

/// A File sharing its calculatedID with others inside one provider,
/// together with its active replicas in that provider
#[derive(Debug, Clone)]
pub struct DuplicateCandidate {
    pub file: File,
    pub replicas: Vec<Replica>,
}

/// Files of one provider that share a calculatedID
#[derive(Debug, Clone)]
pub struct DuplicateGroup {
    pub provider: ProviderId,
    pub calculated_id: CalculatedId,
    pub members: Vec<DuplicateCandidate>,
}

/// Everything one scan learned about one account
#[derive(Debug, Clone)]
pub struct ScanBatch {
    pub account: AccountKey,
    /// Complete folder tree; folders of the account not listed are dropped
    pub folders: Vec<Folder>,
    pub files: Vec<File>,
    pub replicas: Vec<Replica>,
    /// Full fragment list per fragmented replica
    pub fragments: Vec<(ReplicaId, Vec<ReplicaFragment>)>,
    /// Replicas no longer observed in the active tree
    pub status_changes: Vec<(ReplicaId, EntryStatus)>,
    /// Files whose status must be recomputed from their replicas
    pub touched_files: Vec<FileId>,
}

impl ScanBatch {
    pub fn new(account: AccountKey) -> Self {
        Self {
            account,
            folders: Vec::new(),
            files: Vec::new(),
            replicas: Vec::new(),
            fragments: Vec::new(),
            status_changes: Vec::new(),
            touched_files: Vec::new(),
        }
    }
}

/// Per-account totals for status reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountStorageSummary {
    pub account: AccountKey,
    pub active_replicas: u64,
    pub active_bytes: u64,
    pub soft_deleted_replicas: u64,
    pub deleted_replicas: u64,
    pub fragmented_replicas: u64,
}

// ============================================================================
// IMetadataStore trait
// ============================================================================

/// Port trait for the replica metadata index
#[async_trait]
pub trait IMetadataStore: Send + Sync {
    // --- Files ---

    async fn upsert_file(&self, file: &File) -> anyhow::Result<()>;

    async fn get_file(&self, id: &FileId) -> anyhow::Result<Option<File>>;

    /// Files at `path`, matched case-insensitively
    async fn find_files_by_path(&self, path: &LogicalPath) -> anyhow::Result<Vec<File>>;

    async fn find_files_by_calculated_id(&self, id: &CalculatedId) -> anyhow::Result<Vec<File>>;

    async fn list_files(&self, filter: &FileFilter) -> anyhow::Result<Vec<File>>;

    /// Remove a File together with its replicas and fragments
    async fn delete_file(&self, id: &FileId) -> anyhow::Result<()>;

    /// Recompute a File's status from its replicas and persist it
    async fn refresh_file_status(&self, id: &FileId) -> anyhow::Result<EntryStatus>;

    // --- Replicas ---

    async fn upsert_replica(&self, replica: &Replica) -> anyhow::Result<()>;

    async fn get_replica(&self, id: &ReplicaId) -> anyhow::Result<Option<Replica>>;

    async fn get_replica_by_native_id(
        &self,
        account: &AccountKey,
        native_id: &str,
    ) -> anyhow::Result<Option<Replica>>;

    async fn get_replicas_for_file(&self, file_id: &FileId) -> anyhow::Result<Vec<Replica>>;

    async fn get_replicas_by_account(&self, account: &AccountKey) -> anyhow::Result<Vec<Replica>>;

    /// Set a replica's status without touching anything else
    async fn mark_replica_status(
        &self,
        id: &ReplicaId,
        status: EntryStatus,
    ) -> anyhow::Result<()>;

    async fn delete_replica(&self, id: &ReplicaId) -> anyhow::Result<()>;

    // --- Fragments ---

    /// Replace the fragment list of a replica
    async fn replace_fragments(
        &self,
        replica_id: &ReplicaId,
        fragments: &[ReplicaFragment],
    ) -> anyhow::Result<()>;

    /// Fragments ordered by fragment number
    async fn get_fragments(&self, replica_id: &ReplicaId) -> anyhow::Result<Vec<ReplicaFragment>>;

    // --- Folders ---

    async fn upsert_folder(&self, folder: &Folder) -> anyhow::Result<()>;

    async fn get_folders_by_account(&self, account: &AccountKey) -> anyhow::Result<Vec<Folder>>;

    // --- Analysis ---

    /// Groups of active Files within `provider` sharing a calculatedID
    async fn find_duplicate_groups(
        &self,
        provider: &ProviderId,
    ) -> anyhow::Result<Vec<DuplicateGroup>>;

    /// Active replicas held by `account` whose calculatedID has no active
    /// replica in any other account of the same provider, largest first
    async fn get_largest_files_exclusive(
        &self,
        account: &AccountKey,
    ) -> anyhow::Result<Vec<(File, Replica)>>;

    /// Apply a scan result in a single transaction
    async fn apply_scan(&self, batch: &ScanBatch) -> anyhow::Result<()>;

    async fn storage_summary(&self) -> anyhow::Result<Vec<AccountStorageSummary>>;
}
