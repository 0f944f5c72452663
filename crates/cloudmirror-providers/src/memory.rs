//! In-memory cloud backend
//!
//! A [`MemoryCloud`] models one provider: every account of that provider
//! lives in the same cloud, so native ids are unique across accounts and
//! ownership transfers keep them. Each account is reached through its own
//! [`MemoryClient`].
//!
//! Besides serving demos, the cloud records every mutating call and can
//! inject failures, which is what the engine tests rely on.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::debug;

use cloudmirror_core::domain::{AccountId, AccountKey, ContentHash, HashAlgorithm, ProviderId};
use cloudmirror_core::ports::{
    ByteStream, CloudError, ICloudClient, Quota, RemoteFile, RemoteFolder, ShareRole,
    TransferOutcome, UserIdentity,
};

use crate::TransferMode;

/// Client operations that can be made to fail on demand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    PreFlight,
    ListFolders,
    ListFiles,
    Upload,
    Download,
    Delete,
    Move,
    CreateFolder,
    Share,
    Quota,
    Transfer,
}

/// A remote-mutating call as observed by the cloud
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Upload { account: AccountId, folder_id: String, name: String, size: u64 },
    Delete { account: AccountId, native_id: String },
    Move { account: AccountId, native_id: String, folder_id: String },
    CreateFolder { account: AccountId, parent_id: String, name: String },
    Share { account: AccountId, folder_id: String, with: AccountId },
    TransferOwnership { account: AccountId, native_id: String, to: AccountId },
}

#[derive(Debug, Clone)]
struct FolderNode {
    name: String,
    parent: Option<String>,
}

#[derive(Debug, Clone)]
struct Blob {
    name: String,
    parent: String,
    data: Vec<u8>,
    mod_time: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct AccountTree {
    quota: u64,
    root: String,
    folders: BTreeMap<String, FolderNode>,
    files: BTreeMap<String, Blob>,
}

impl AccountTree {
    fn used(&self) -> u64 {
        self.files.values().map(|b| b.data.len() as u64).sum()
    }

    fn sync_roots(&self, name: &str) -> Vec<String> {
        self.folders
            .iter()
            .filter(|(_, f)| {
                f.parent.as_deref() == Some(self.root.as_str()) && f.name.eq_ignore_ascii_case(name)
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Path of a folder relative to the account root, segments joined by `/`
    fn folder_path(&self, id: &str) -> Vec<String> {
        let mut segments = Vec::new();
        let mut current = Some(id.to_string());
        while let Some(cid) = current {
            if cid == self.root {
                break;
            }
            match self.folders.get(&cid) {
                Some(node) => {
                    segments.push(node.name.clone());
                    current = node.parent.clone();
                }
                None => break,
            }
        }
        segments.reverse();
        segments
    }

    fn child_folder(&self, parent: &str, name: &str) -> Option<String> {
        self.folders
            .iter()
            .find(|(_, f)| f.parent.as_deref() == Some(parent) && f.name == name)
            .map(|(id, _)| id.clone())
    }
}

#[derive(Debug)]
struct InjectedFailure {
    account: AccountId,
    operation: Operation,
    /// Matching calls still allowed through before this one fires
    skip: u32,
    error: CloudError,
}

#[derive(Debug, Default)]
struct CloudState {
    accounts: BTreeMap<AccountId, AccountTree>,
    next_id: u64,
    log: Vec<Mutation>,
    failures: VecDeque<InjectedFailure>,
    deny_delete: HashSet<String>,
    pending: Vec<(String, AccountId)>,
}

impl CloudState {
    fn new_id(&mut self) -> String {
        self.next_id += 1;
        format!("mem-{}", self.next_id)
    }
}

/// One provider's worth of in-memory accounts
pub struct MemoryCloud {
    provider: ProviderId,
    sync_folder_name: String,
    native_hash: bool,
    transfer: TransferMode,
    state: Mutex<CloudState>,
}

impl MemoryCloud {
    pub fn new(provider: ProviderId, sync_folder_name: impl Into<String>) -> Self {
        Self {
            provider,
            sync_folder_name: sync_folder_name.into(),
            native_hash: false,
            transfer: TransferMode::Unsupported,
            state: Mutex::new(CloudState::default()),
        }
    }

    /// Report a SHA-256 native hash for every file
    pub fn with_native_sha256(mut self) -> Self {
        self.native_hash = true;
        self
    }

    pub fn with_transfer(mut self, transfer: TransferMode) -> Self {
        self.transfer = transfer;
        self
    }

    pub fn provider(&self) -> &ProviderId {
        &self.provider
    }

    fn state(&self) -> MutexGuard<'_, CloudState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create an account with an empty sync root and return its client
    pub fn add_account(self: &Arc<Self>, account: AccountId, quota: u64) -> Arc<MemoryClient> {
        let mut state = self.state();
        let root = state.new_id();
        let sync_root = state.new_id();
        let mut tree = AccountTree {
            quota,
            root: root.clone(),
            ..Default::default()
        };
        tree.folders.insert(
            root.clone(),
            FolderNode {
                name: String::new(),
                parent: None,
            },
        );
        tree.folders.insert(
            sync_root,
            FolderNode {
                name: self.sync_folder_name.clone(),
                parent: Some(root),
            },
        );
        state.accounts.insert(account.clone(), tree);
        drop(state);

        Arc::new(MemoryClient {
            key: AccountKey::new(self.provider.clone(), account),
            cloud: Arc::clone(self),
        })
    }

    /// Add another top-level folder next to the sync root
    pub fn add_root_folder(&self, account: &AccountId, name: &str) -> String {
        let mut state = self.state();
        let id = state.new_id();
        if let Some(tree) = state.accounts.get_mut(account) {
            let root = tree.root.clone();
            tree.folders.insert(
                id.clone(),
                FolderNode {
                    name: name.to_string(),
                    parent: Some(root),
                },
            );
        }
        id
    }

    /// Place a file at `path` (relative to the sync root), creating folders
    pub fn seed_file(
        &self,
        account: &AccountId,
        path: &str,
        data: &[u8],
        mod_time: DateTime<Utc>,
    ) -> String {
        let mut state = self.state();
        let id = state.new_id();
        let sync_folder_name = self.sync_folder_name.clone();
        let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let name = segments.pop().unwrap_or_default().to_string();

        let mut folder_ids = Vec::new();
        for _ in &segments {
            folder_ids.push(state.new_id());
        }
        let Some(tree) = state.accounts.get_mut(account) else {
            return id;
        };
        let mut parent = tree
            .sync_roots(&sync_folder_name)
            .into_iter()
            .next()
            .unwrap_or_else(|| tree.root.clone());
        for (segment, fresh_id) in segments.iter().zip(folder_ids) {
            parent = match tree.child_folder(&parent, segment) {
                Some(existing) => existing,
                None => {
                    tree.folders.insert(
                        fresh_id.clone(),
                        FolderNode {
                            name: segment.to_string(),
                            parent: Some(parent.clone()),
                        },
                    );
                    fresh_id
                }
            };
        }
        tree.files.insert(
            id.clone(),
            Blob {
                name,
                parent,
                data: data.to_vec(),
                mod_time,
            },
        );
        id
    }

    /// Paths (relative to the sync root) of every file in the account
    pub fn file_paths(&self, account: &AccountId) -> Vec<String> {
        let state = self.state();
        let Some(tree) = state.accounts.get(account) else {
            return Vec::new();
        };
        let mut paths: Vec<String> = tree
            .files
            .values()
            .map(|blob| {
                let mut segments = tree.folder_path(&blob.parent);
                if !segments.is_empty() {
                    segments.remove(0);
                }
                segments.push(blob.name.clone());
                segments.join("/")
            })
            .collect();
        paths.sort();
        paths
    }

    /// Content of the file at `path` (relative to the sync root)
    pub fn read_file(&self, account: &AccountId, path: &str) -> Option<Vec<u8>> {
        let state = self.state();
        let tree = state.accounts.get(account)?;
        tree.files
            .values()
            .find(|blob| {
                let mut segments = tree.folder_path(&blob.parent);
                if !segments.is_empty() {
                    segments.remove(0);
                }
                segments.push(blob.name.clone());
                segments.join("/") == path
            })
            .map(|blob| blob.data.clone())
    }

    pub fn mutations(&self) -> Vec<Mutation> {
        self.state().log.clone()
    }

    pub fn clear_mutations(&self) {
        self.state().log.clear();
    }

    /// Make the next `operation` by `account` fail with `error`
    pub fn fail_next(&self, account: &AccountId, operation: Operation, error: CloudError) {
        self.fail_after(account, operation, 0, error);
    }

    /// Let `skip` more `operation`s by `account` succeed, then fail one
    pub fn fail_after(&self, account: &AccountId, operation: Operation, skip: u32, error: CloudError) {
        self.state().failures.push_back(InjectedFailure {
            account: account.clone(),
            operation,
            skip,
            error,
        });
    }

    /// Deleting this object fails with a permission error
    pub fn deny_delete(&self, native_id: &str) {
        self.state().deny_delete.insert(native_id.to_string());
    }

    /// Transfers waiting for the recipient's consent
    pub fn pending_transfers(&self) -> Vec<(String, AccountId)> {
        self.state().pending.clone()
    }
}

/// View of one account inside a [`MemoryCloud`]
pub struct MemoryClient {
    key: AccountKey,
    cloud: Arc<MemoryCloud>,
}

impl MemoryClient {
    pub fn cloud(&self) -> &Arc<MemoryCloud> {
        &self.cloud
    }

    fn check_failure(&self, state: &mut CloudState, operation: Operation) -> Result<(), CloudError> {
        let position = state
            .failures
            .iter()
            .position(|f| f.account == self.key.account && f.operation == operation);
        let Some(idx) = position else {
            return Ok(());
        };
        if let Some(pending) = state.failures.get_mut(idx).filter(|f| f.skip > 0) {
            pending.skip -= 1;
            return Ok(());
        }
        match state.failures.remove(idx) {
            Some(failure) => Err(failure.error),
            None => Ok(()),
        }
    }

    fn remote_file(&self, id: &str, blob: &Blob) -> RemoteFile {
        let native_hash = self.cloud.native_hash.then(|| {
            ContentHash::new(HashAlgorithm::Sha256, hex::encode(Sha256::digest(&blob.data)))
        });
        RemoteFile {
            native_id: id.to_string(),
            name: blob.name.clone(),
            size: blob.data.len() as u64,
            mod_time: blob.mod_time,
            native_hash: native_hash.and_then(Result::ok),
            parent_id: Some(blob.parent.clone()),
        }
    }

    /// Lock the cloud, apply any injected failure, and run `f` on this account
    fn with_tree<T>(
        &self,
        operation: Operation,
        f: impl FnOnce(&mut CloudState, &AccountId) -> Result<T, CloudError>,
    ) -> Result<T, CloudError> {
        let mut state = self.cloud.state();
        self.check_failure(&mut state, operation)?;
        if !state.accounts.contains_key(&self.key.account) {
            return Err(CloudError::NotFound(format!("account {}", self.key)));
        }
        f(&mut state, &self.key.account)
    }
}

fn tree<'a>(state: &'a CloudState, account: &AccountId) -> Result<&'a AccountTree, CloudError> {
    state
        .accounts
        .get(account)
        .ok_or_else(|| CloudError::NotFound(format!("account {account}")))
}

fn tree_mut<'a>(
    state: &'a mut CloudState,
    account: &AccountId,
) -> Result<&'a mut AccountTree, CloudError> {
    state
        .accounts
        .get_mut(account)
        .ok_or_else(|| CloudError::NotFound(format!("account {account}")))
}

#[async_trait]
impl ICloudClient for MemoryClient {
    fn account(&self) -> &AccountKey {
        &self.key
    }

    async fn pre_flight_check(&self) -> Result<String, CloudError> {
        let name = self.cloud.sync_folder_name.clone();
        self.with_tree(Operation::PreFlight, |state, account| {
            let roots = tree(state, account)?.sync_roots(&name);
            match roots.len() {
                0 => Err(CloudError::SyncRootMissing(name)),
                1 => Ok(roots[0].clone()),
                count => Err(CloudError::AmbiguousSyncRoot { name, count }),
            }
        })
    }

    async fn get_sync_folder_id(&self) -> Result<String, CloudError> {
        let name = self.cloud.sync_folder_name.clone();
        self.with_tree(Operation::PreFlight, |state, account| {
            tree(state, account)?
                .sync_roots(&name)
                .into_iter()
                .next()
                .ok_or(CloudError::SyncRootMissing(name))
        })
    }

    async fn list_folders(&self, parent_id: &str) -> Result<Vec<RemoteFolder>, CloudError> {
        self.with_tree(Operation::ListFolders, |state, account| {
            let tree = tree(state, account)?;
            if !tree.folders.contains_key(parent_id) {
                return Err(CloudError::NotFound(parent_id.to_string()));
            }
            let mut folders: Vec<RemoteFolder> = tree
                .folders
                .iter()
                .filter(|(_, f)| f.parent.as_deref() == Some(parent_id))
                .map(|(id, f)| RemoteFolder {
                    native_id: id.clone(),
                    name: f.name.clone(),
                    parent_id: f.parent.clone(),
                })
                .collect();
            folders.sort_by(|a, b| a.name.cmp(&b.name).then(a.native_id.cmp(&b.native_id)));
            Ok(folders)
        })
    }

    async fn list_files(&self, folder_id: &str) -> Result<Vec<RemoteFile>, CloudError> {
        self.with_tree(Operation::ListFiles, |state, account| {
            let tree = tree(state, account)?;
            if !tree.folders.contains_key(folder_id) {
                return Err(CloudError::NotFound(folder_id.to_string()));
            }
            let mut files: Vec<RemoteFile> = tree
                .files
                .iter()
                .filter(|(_, b)| b.parent == folder_id)
                .map(|(id, b)| self.remote_file(id, b))
                .collect();
            files.sort_by(|a, b| a.name.cmp(&b.name).then(a.native_id.cmp(&b.native_id)));
            Ok(files)
        })
    }

    async fn upload_file(
        &self,
        folder_id: &str,
        name: &str,
        mut content: ByteStream,
        size: u64,
    ) -> Result<RemoteFile, CloudError> {
        // the body is sent before an injected failure fires, like a
        // connection dropped while waiting for the response
        let mut data = Vec::new();
        content.read_to_end(&mut data).await?;
        self.with_tree(Operation::Upload, |_, _| Ok(()))?;

        if data.len() as u64 != size {
            return Err(CloudError::Io(format!(
                "upload of {name}: expected {size} bytes, got {}",
                data.len()
            )));
        }

        let mut state = self.cloud.state();
        let id = state.new_id();
        state.log.push(Mutation::Upload {
            account: self.key.account.clone(),
            folder_id: folder_id.to_string(),
            name: name.to_string(),
            size,
        });
        let tree = tree_mut(&mut state, &self.key.account)?;
        if !tree.folders.contains_key(folder_id) {
            return Err(CloudError::NotFound(folder_id.to_string()));
        }
        if tree.used() + size > tree.quota {
            return Err(CloudError::Other(format!(
                "quota exceeded in {}",
                self.key
            )));
        }
        let blob = Blob {
            name: name.to_string(),
            parent: folder_id.to_string(),
            data,
            mod_time: Utc::now(),
        };
        let remote = self.remote_file(&id, &blob);
        tree.files.insert(id, blob);
        debug!(account = %self.key, name, size, "Stored object");
        Ok(remote)
    }

    async fn download_file(&self, native_id: &str) -> Result<ByteStream, CloudError> {
        let data = self.with_tree(Operation::Download, |state, account| {
            tree(state, account)?
                .files
                .get(native_id)
                .map(|b| b.data.clone())
                .ok_or_else(|| CloudError::NotFound(native_id.to_string()))
        })?;
        Ok(Box::new(Cursor::new(data)))
    }

    async fn delete_file(&self, native_id: &str) -> Result<(), CloudError> {
        self.with_tree(Operation::Delete, |state, account| {
            if state.deny_delete.contains(native_id) {
                return Err(CloudError::PermissionDenied(format!(
                    "{account} may not delete {native_id}"
                )));
            }
            state.log.push(Mutation::Delete {
                account: account.clone(),
                native_id: native_id.to_string(),
            });
            tree_mut(state, account)?
                .files
                .remove(native_id)
                .map(|_| ())
                .ok_or_else(|| CloudError::NotFound(native_id.to_string()))
        })
    }

    async fn move_file(&self, native_id: &str, folder_id: &str) -> Result<RemoteFile, CloudError> {
        self.with_tree(Operation::Move, |state, account| {
            state.log.push(Mutation::Move {
                account: account.clone(),
                native_id: native_id.to_string(),
                folder_id: folder_id.to_string(),
            });
            let tree = tree_mut(state, account)?;
            if !tree.folders.contains_key(folder_id) {
                return Err(CloudError::NotFound(folder_id.to_string()));
            }
            let blob = tree
                .files
                .get_mut(native_id)
                .ok_or_else(|| CloudError::NotFound(native_id.to_string()))?;
            blob.parent = folder_id.to_string();
            let blob = blob.clone();
            Ok(self.remote_file(native_id, &blob))
        })
    }

    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<RemoteFolder, CloudError> {
        self.with_tree(Operation::CreateFolder, |state, account| {
            state.log.push(Mutation::CreateFolder {
                account: account.clone(),
                parent_id: parent_id.to_string(),
                name: name.to_string(),
            });
            let id = state.new_id();
            let tree = tree_mut(state, account)?;
            if !tree.folders.contains_key(parent_id) {
                return Err(CloudError::NotFound(parent_id.to_string()));
            }
            tree.folders.insert(
                id.clone(),
                FolderNode {
                    name: name.to_string(),
                    parent: Some(parent_id.to_string()),
                },
            );
            Ok(RemoteFolder {
                native_id: id,
                name: name.to_string(),
                parent_id: Some(parent_id.to_string()),
            })
        })
    }

    async fn share_folder(
        &self,
        folder_id: &str,
        with: &AccountId,
        _role: ShareRole,
    ) -> Result<(), CloudError> {
        self.with_tree(Operation::Share, |state, account| {
            state.log.push(Mutation::Share {
                account: account.clone(),
                folder_id: folder_id.to_string(),
                with: with.clone(),
            });
            Ok(())
        })
    }

    async fn get_quota(&self) -> Result<Quota, CloudError> {
        self.with_tree(Operation::Quota, |state, account| {
            let tree = tree(state, account)?;
            Ok(Quota {
                total: tree.quota,
                used: tree.used(),
            })
        })
    }

    async fn transfer_ownership(
        &self,
        native_id: &str,
        to: &AccountId,
    ) -> Result<TransferOutcome, CloudError> {
        let mode = self.cloud.transfer;
        let sync_folder_name = self.cloud.sync_folder_name.clone();
        self.with_tree(Operation::Transfer, |state, account| {
            if mode == TransferMode::Unsupported {
                return Err(CloudError::Unsupported("ownership transfer".into()));
            }
            if !state.accounts.contains_key(to) {
                return Err(CloudError::NotFound(format!("account {to}")));
            }
            state.log.push(Mutation::TransferOwnership {
                account: account.clone(),
                native_id: native_id.to_string(),
                to: to.clone(),
            });
            if mode == TransferMode::RequiresConsent {
                if !tree(state, account)?.files.contains_key(native_id) {
                    return Err(CloudError::NotFound(native_id.to_string()));
                }
                state.pending.push((native_id.to_string(), to.clone()));
                return Ok(TransferOutcome::PendingConsent);
            }

            let source = tree_mut(state, account)?;
            let mut segments = source.folder_path(
                &source
                    .files
                    .get(native_id)
                    .ok_or_else(|| CloudError::NotFound(native_id.to_string()))?
                    .parent
                    .clone(),
            );
            let blob = source
                .files
                .remove(native_id)
                .ok_or_else(|| CloudError::NotFound(native_id.to_string()))?;
            if !segments.is_empty() {
                segments.remove(0);
            }

            let fresh: Vec<String> = segments.iter().map(|_| state.new_id()).collect();
            let target = tree_mut(state, to)?;
            let mut parent = target
                .sync_roots(&sync_folder_name)
                .into_iter()
                .next()
                .unwrap_or_else(|| target.root.clone());
            for (segment, fresh_id) in segments.iter().zip(fresh) {
                parent = match target.child_folder(&parent, segment) {
                    Some(existing) => existing,
                    None => {
                        target.folders.insert(
                            fresh_id.clone(),
                            FolderNode {
                                name: segment.clone(),
                                parent: Some(parent.clone()),
                            },
                        );
                        fresh_id
                    }
                };
            }
            target.files.insert(native_id.to_string(), Blob { parent, ..blob });
            Ok(TransferOutcome::Transferred)
        })
    }

    async fn get_user_identity(&self) -> Result<UserIdentity, CloudError> {
        Ok(UserIdentity {
            account_id: self.key.account.clone(),
            display_name: None,
        })
    }
}
