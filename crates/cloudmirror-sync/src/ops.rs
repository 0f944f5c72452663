//! Remote mutations shared by the engines
//!
//! Every remote-mutating call goes through [`MutationGate::permit`]. The
//! engines compute the same [`PlannedAction`]s in dry-run and real mode;
//! the gate alone decides whether the action is carried out.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::Serialize;
use tracing::{debug, info, warn};

use cloudmirror_core::domain::{AccountKey, LogicalPath, Replica};
use cloudmirror_core::ports::{CloudError, ICloudClient};

use crate::context::ReconcileContext;
use crate::SyncError;

/// A remote mutation an engine decided on
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlannedAction {
    CreateFolder {
        account: AccountKey,
        path: LogicalPath,
    },
    Upload {
        account: AccountKey,
        path: LogicalPath,
        size: u64,
        source: AccountKey,
        restore: bool,
    },
    Delete {
        account: AccountKey,
        path: LogicalPath,
    },
    TransferOwnership {
        from: AccountKey,
        to: AccountKey,
        path: LogicalPath,
    },
    Relocate {
        from: AccountKey,
        to: AccountKey,
        path: LogicalPath,
        size: u64,
    },
}

impl fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateFolder { account, path } => write!(f, "create folder {path} on {account}"),
            Self::Upload {
                account,
                path,
                size,
                source,
                restore,
            } => {
                let verb = if *restore { "restore" } else { "upload" };
                write!(f, "{verb} {path} ({size} bytes) from {source} to {account}")
            }
            Self::Delete { account, path } => write!(f, "delete {path} on {account}"),
            Self::TransferOwnership { from, to, path } => {
                write!(f, "transfer ownership of {path} from {from} to {to}")
            }
            Self::Relocate {
                from,
                to,
                path,
                size,
            } => write!(f, "copy {path} ({size} bytes) from {from} to {to} and remove the original"),
        }
    }
}

/// Decides whether remote mutations are carried out
#[derive(Debug, Clone, Copy, Default)]
pub struct MutationGate {
    dry_run: bool,
}

impl MutationGate {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Log `action` and report whether it may run
    pub fn permit(&self, action: &PlannedAction) -> bool {
        if self.dry_run {
            info!(dry_run = true, action = %action, "Would perform");
            false
        } else {
            debug!(action = %action, "Performing");
            true
        }
    }
}

/// How a replica left its account
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Deleted,
    /// Delete was refused; the object now sits in the trash folder
    Trashed,
    /// The object was already gone
    AlreadyGone,
    /// Dry run: nothing was touched
    Planned,
}

/// Remove `replica` from its account, falling back to the trash folder
/// when the account may not delete it
pub async fn remove_replica(
    ctx: &ReconcileContext,
    client: &dyn ICloudClient,
    replica: &Replica,
    actions: &mut Vec<PlannedAction>,
) -> Result<Removal, SyncError> {
    let account = client.account().clone();
    let action = PlannedAction::Delete {
        account: account.clone(),
        path: replica.path.clone(),
    };
    let permitted = ctx.gate.permit(&action);
    actions.push(action);
    if !permitted {
        return Ok(Removal::Planned);
    }

    let object_ids: Vec<String> = if replica.fragmented {
        ctx.store
            .get_fragments(&replica.id)
            .await?
            .into_iter()
            .map(|f| f.native_fragment_id)
            .collect()
    } else {
        vec![replica.native_id.clone()]
    };

    let mut trash_id: Option<String> = None;
    let mut outcome = Removal::AlreadyGone;
    for object_id in &object_ids {
        match client.delete_file(object_id).await {
            Ok(()) => {
                if outcome == Removal::AlreadyGone {
                    outcome = Removal::Deleted;
                }
            }
            Err(CloudError::NotFound(_)) => {
                debug!(account = %account, native_id = %object_id, "Already gone");
            }
            Err(CloudError::PermissionDenied(reason)) => {
                warn!(
                    account = %account,
                    path = %replica.path,
                    reason = %reason,
                    "Delete refused, moving to trash"
                );
                let folder = match &trash_id {
                    Some(id) => id.clone(),
                    None => {
                        let id = trash_folder_id(ctx, client)
                            .await
                            .map_err(|e| SyncError::cloud(&account, e))?;
                        trash_id = Some(id.clone());
                        id
                    }
                };
                client
                    .move_file(object_id, &folder)
                    .await
                    .map_err(|e| SyncError::cloud(&account, e))?;
                outcome = Removal::Trashed;
            }
            Err(err) => return Err(SyncError::cloud(&account, err)),
        }
    }
    Ok(outcome)
}

/// Id of the account's trash folder, created under the sync root if needed
async fn trash_folder_id(
    ctx: &ReconcileContext,
    client: &dyn ICloudClient,
) -> Result<String, CloudError> {
    let name = &ctx.settings.soft_deleted_folder_name;
    let root = client.get_sync_folder_id().await?;
    let existing = client
        .list_folders(&root)
        .await?
        .into_iter()
        .find(|f| f.name.eq_ignore_ascii_case(name));
    match existing {
        Some(folder) => Ok(folder.native_id),
        None => Ok(client.create_folder(&root, name).await?.native_id),
    }
}

/// Folder ids by path, per account, creating folders on demand
#[derive(Debug, Default)]
pub struct FolderCache {
    ids: HashMap<(AccountKey, String), String>,
    loaded: HashSet<AccountKey>,
}

impl FolderCache {
    pub fn new() -> Self {
        Self::default()
    }

    async fn load(
        &mut self,
        ctx: &ReconcileContext,
        client: &dyn ICloudClient,
    ) -> Result<(), SyncError> {
        let account = client.account();
        if self.loaded.contains(account) {
            return Ok(());
        }
        for folder in ctx.store.get_folders_by_account(account).await? {
            self.ids
                .insert((account.clone(), folder.path.comparison_key()), folder.id);
        }
        let root_key = (account.clone(), String::new());
        if !self.ids.contains_key(&root_key) {
            let root = client
                .get_sync_folder_id()
                .await
                .map_err(|e| SyncError::cloud(account, e))?;
            self.ids.insert(root_key, root);
        }
        self.loaded.insert(account.clone());
        Ok(())
    }

    /// Id of the folder at `path` in the client's account
    ///
    /// Missing folders are created through the gate; in dry-run mode they
    /// get a placeholder id so planning carries on unchanged.
    pub async fn ensure(
        &mut self,
        ctx: &ReconcileContext,
        client: &dyn ICloudClient,
        path: &LogicalPath,
        actions: &mut Vec<PlannedAction>,
    ) -> Result<String, SyncError> {
        self.load(ctx, client).await?;
        let account = client.account().clone();

        let mut current = LogicalPath::root();
        let mut id = self
            .ids
            .get(&(account.clone(), String::new()))
            .cloned()
            .unwrap_or_default();
        for segment in path.segments() {
            current = current.join(segment)?;
            let key = (account.clone(), current.comparison_key());
            if let Some(existing) = self.ids.get(&key) {
                id = existing.clone();
                continue;
            }
            let action = PlannedAction::CreateFolder {
                account: account.clone(),
                path: current.clone(),
            };
            id = if ctx.gate.permit(&action) {
                client
                    .create_folder(&id, segment)
                    .await
                    .map_err(|e| SyncError::cloud(&account, e))?
                    .native_id
            } else {
                format!("planned:{current}")
            };
            actions.push(action);
            self.ids.insert(key, id.clone());
        }
        Ok(id)
    }
}
