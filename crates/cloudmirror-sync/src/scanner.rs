//! Metadata scanner
//!
//! Rebuilds one account's slice of the replica index from a full remote
//! listing of its sync root.
//!
//! ## Scan Flow
//!
//! 1. **Pre-flight**: resolve the sync root; zero or several roots fail
//!    the account without touching the index
//! 2. **Walk**: list folders and files; the trash folder is listed
//!    separately and never yields replicas
//! 3. **Link**: every object becomes a Replica keyed by native id, linked
//!    to a File by its previous link, or by path plus name and size
//! 4. **Missing**: known replicas not seen again become soft-deleted when
//!    found in the trash, deleted otherwise
//! 5. **Commit**: everything lands in one [`ScanBatch`] transaction
//!
//! Scanning twice without remote changes leaves the index unchanged.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

use cloudmirror_core::domain::{
    AccountKey, CalculatedId, ContentHash, EntryStatus, File, FileId, Folder, LogicalPath,
    Replica, ReplicaFragment, ReplicaId,
};
use cloudmirror_core::ports::{CloudError, ICloudClient, RemoteFile, ScanBatch};

use crate::context::ReconcileContext;
use crate::fragment::{open_chain, parse_fragment_name};
use crate::hashing::hash_stream;
use crate::report::{AccountScanSummary, ItemFailure, ScanReport};
use crate::SyncError;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ObservedFragment {
    number: u32,
    total: u32,
    size: u64,
    native_id: String,
}

/// A remote object, or a group of fragment objects, as seen by the walk
#[derive(Debug, Clone)]
struct ObservedObject {
    path: LogicalPath,
    size: u64,
    mod_time: DateTime<Utc>,
    native_id: String,
    native_hash: Option<ContentHash>,
    fragments: Vec<ObservedFragment>,
}

impl ObservedObject {
    fn is_fragmented(&self) -> bool {
        !self.fragments.is_empty()
    }

    fn fragments_complete(&self) -> bool {
        let total = self.fragments.first().map_or(0, |f| f.total) as usize;
        self.fragments.len() == total
            && self
                .fragments
                .iter()
                .enumerate()
                .all(|(idx, f)| f.number as usize == idx + 1 && f.total as usize == total)
    }
}

struct Listing {
    folders: Vec<Folder>,
    objects: Vec<ObservedObject>,
    trash: Vec<RemoteFile>,
}

/// Scans accounts into the metadata store
#[derive(Clone)]
pub struct MetadataScanner {
    ctx: ReconcileContext,
}

impl MetadataScanner {
    pub fn new(ctx: ReconcileContext) -> Self {
        Self { ctx }
    }

    /// Scan every registered account, at most `max_parallel_accounts` at a time
    ///
    /// An account that cannot be scanned is reported and does not stop the
    /// others.
    pub async fn scan_all(&self) -> ScanReport {
        let keys: Vec<AccountKey> = self.ctx.registry.accounts().map(|e| e.key.clone()).collect();
        self.scan_accounts(&keys).await
    }

    pub async fn scan_accounts(&self, keys: &[AccountKey]) -> ScanReport {
        let semaphore = Semaphore::new(self.ctx.settings.max_parallel_accounts);
        let semaphore = &semaphore;
        let scans = keys.iter().map(|key| async move {
            let _permit = semaphore.acquire().await;
            (key, self.scan_account(key).await)
        });

        let mut report = ScanReport::default();
        for (key, result) in join_all(scans).await {
            match result {
                Ok(summary) => report.accounts.push(summary),
                Err(err) => {
                    error!(account = %key, error = %err, "Scan failed");
                    report.failures.push(ItemFailure::new(key, err));
                }
            }
        }
        info!(
            scanned = report.accounts.len(),
            failed = report.failures.len(),
            "Metadata refresh complete"
        );
        report
    }

    /// Scan one account and commit the result atomically
    #[instrument(skip_all, fields(account = %account))]
    pub async fn scan_account(&self, account: &AccountKey) -> Result<AccountScanSummary, SyncError> {
        let client = self.ctx.client(account)?;
        let _marker = self.ctx.markers.begin_scan(account).await;
        let cloud = |e: CloudError| SyncError::cloud(account, e);

        let root_id = client.pre_flight_check().await.map_err(cloud)?;
        let listing = self.walk(client.as_ref(), &root_id).await.map_err(cloud)?;

        let mut summary = AccountScanSummary::new(account.clone());
        summary.folders = listing.folders.len();
        summary.objects = listing.objects.len();

        let known = self.ctx.store.get_replicas_by_account(account).await?;
        let by_native: HashMap<&str, &Replica> =
            known.iter().map(|r| (r.native_id.as_str(), r)).collect();

        let mut hashes = Vec::with_capacity(listing.objects.len());
        for object in &listing.objects {
            let existing = by_native.get(object.native_id.as_str()).copied();
            let hash = match self.resolve_hash(&client, object, existing).await {
                Ok((hash, downloaded)) => {
                    if downloaded {
                        summary.hashed += 1;
                    }
                    hash
                }
                Err(err) => {
                    warn!(path = %object.path, error = %err, "Could not hash object");
                    summary.failures.push(ItemFailure::new(&object.path, &err));
                    existing.and_then(|r| r.native_hash.clone())
                }
            };
            hashes.push(hash);
        }

        let _commit = self.ctx.markers.commit_lock().await;
        let mut batch = ScanBatch::new(account.clone());
        let mut created: HashMap<String, Vec<File>> = HashMap::new();
        let mut seen: HashSet<ReplicaId> = HashSet::new();
        let mut touched: Vec<FileId> = Vec::new();

        for (object, hash) in listing.objects.iter().zip(hashes) {
            let existing = by_native.get(object.native_id.as_str()).copied();
            let (file_id, calculated_id) = self
                .link(object, hash.as_ref(), existing, &mut created, &mut batch, &mut summary)
                .await?;

            let replica = Replica {
                id: existing.map(|r| r.id.clone()).unwrap_or_default(),
                file_id: Some(file_id.clone()),
                calculated_id,
                path: object.path.clone(),
                name: object.path.file_name().to_string(),
                size: object.size,
                provider: account.provider.clone(),
                account_id: account.account.clone(),
                native_id: object.native_id.clone(),
                native_hash: hash,
                mod_time: object.mod_time,
                status: EntryStatus::Active,
                fragmented: object.is_fragmented(),
            };
            seen.insert(replica.id.clone());
            if object.is_fragmented() {
                summary.fragmented += 1;
            }

            let stored_fragments = match existing {
                Some(old) => self.ctx.store.get_fragments(&old.id).await?,
                None => Vec::new(),
            };
            if !same_fragments(&stored_fragments, &object.fragments) {
                let rows = object
                    .fragments
                    .iter()
                    .map(|f| {
                        ReplicaFragment::new(replica.id.clone(), f.number, f.total, f.size, &f.native_id)
                    })
                    .collect();
                batch.fragments.push((replica.id.clone(), rows));
            }

            match existing {
                None => {
                    summary.new_replicas += 1;
                    batch.replicas.push(replica);
                }
                Some(old) => {
                    if let Some(previous) = old.file_id.as_ref().filter(|id| **id != file_id) {
                        touched.push(previous.clone());
                    }
                    if *old != replica {
                        summary.updated_replicas += 1;
                        batch.replicas.push(replica);
                    }
                }
            }
            touched.push(file_id);
        }

        for replica in &known {
            if seen.contains(&replica.id) || replica.status == EntryStatus::Deleted {
                continue;
            }
            let status = if listing.trash.iter().any(|t| trash_holds(t, replica)) {
                EntryStatus::SoftDeleted
            } else {
                EntryStatus::Deleted
            };
            if status == replica.status {
                continue;
            }
            debug!(path = %replica.path, %status, "Replica no longer in sync root");
            match status {
                EntryStatus::SoftDeleted => summary.soft_deleted += 1,
                _ => summary.deleted += 1,
            }
            batch.status_changes.push((replica.id.clone(), status));
            if let Some(file_id) = &replica.file_id {
                touched.push(file_id.clone());
            }
        }

        let mut unique = HashSet::new();
        touched.retain(|id| unique.insert(id.clone()));
        batch.touched_files = touched;
        batch.folders = listing.folders;
        self.ctx.store.apply_scan(&batch).await?;

        info!(
            objects = summary.objects,
            new_replicas = summary.new_replicas,
            updated = summary.updated_replicas,
            soft_deleted = summary.soft_deleted,
            deleted = summary.deleted,
            "Account scanned"
        );
        Ok(summary)
    }

    /// List the sync root; the trash subtree is collected apart
    async fn walk(&self, client: &dyn ICloudClient, root_id: &str) -> Result<Listing, CloudError> {
        let account = client.account();
        let trash_name = &self.ctx.settings.soft_deleted_folder_name;
        let mut folders = vec![Folder::new(account, root_id, LogicalPath::root(), None)];
        let mut located: Vec<(LogicalPath, RemoteFile)> = Vec::new();
        let mut trash = Vec::new();
        let mut pending = vec![(root_id.to_string(), LogicalPath::root(), false)];

        while let Some((folder_id, folder_path, in_trash)) = pending.pop() {
            for child in client.list_folders(&folder_id).await? {
                let Ok(child_path) = folder_path.join(&child.name) else {
                    warn!(account = %account, name = %child.name, "Skipping folder with unusable name");
                    continue;
                };
                let is_trash = folder_path.is_root() && child.name.eq_ignore_ascii_case(trash_name);
                folders.push(Folder::new(
                    account,
                    child.native_id.clone(),
                    child_path.clone(),
                    Some(folder_id.clone()),
                ));
                pending.push((child.native_id, child_path, in_trash || is_trash));
            }
            let files = client.list_files(&folder_id).await?;
            if in_trash {
                trash.extend(files);
            } else {
                located.extend(files.into_iter().map(|f| (folder_path.clone(), f)));
            }
        }

        Ok(Listing {
            folders,
            objects: group_objects(account, located),
            trash,
        })
    }

    /// Content hash of an object, and whether it had to be downloaded
    async fn resolve_hash(
        &self,
        client: &Arc<dyn ICloudClient>,
        object: &ObservedObject,
        existing: Option<&Replica>,
    ) -> Result<(Option<ContentHash>, bool), SyncError> {
        if let Some(native) = &object.native_hash {
            return Ok((Some(native.clone()), false));
        }
        if let Some(old) = existing {
            let unchanged = old.size == object.size
                && old.mod_time == object.mod_time
                && old.fragmented == object.is_fragmented();
            if unchanged && old.native_hash.is_some() {
                return Ok((old.native_hash.clone(), false));
            }
        }

        let account = client.account();
        let stream = if object.is_fragmented() {
            if !object.fragments_complete() {
                return Ok((None, false));
            }
            let ids: Vec<&str> = object.fragments.iter().map(|f| f.native_id.as_str()).collect();
            open_chain(client, &ids)
                .await
                .map_err(|(_, e)| SyncError::cloud(account, e))?
        } else {
            client
                .download_file(&object.native_id)
                .await
                .map_err(|e| SyncError::cloud(account, e))?
        };
        let (hash, len) = hash_stream(stream).await?;
        if len != object.size {
            warn!(path = %object.path, listed = object.size, read = len, "Size changed while hashing");
        }
        Ok((Some(hash), true))
    }

    /// Owning File of an observed object and the calculated id its replica
    /// carries
    async fn link(
        &self,
        object: &ObservedObject,
        hash: Option<&ContentHash>,
        existing: Option<&Replica>,
        created: &mut HashMap<String, Vec<File>>,
        batch: &mut ScanBatch,
        summary: &mut AccountScanSummary,
    ) -> Result<(FileId, CalculatedId), SyncError> {
        // an established link survives renames made by collision handling
        if let Some(old) = existing {
            if let Some(file_id) = &old.file_id {
                let same_content = match (&old.native_hash, hash) {
                    (Some(a), Some(b)) => a.same_content(b) != Some(false),
                    _ => true,
                };
                if old.size == object.size
                    && same_content
                    && self.ctx.store.get_file(file_id).await?.is_some()
                {
                    return Ok((file_id.clone(), old.calculated_id.clone()));
                }
            }
        }

        let calculated_id = CalculatedId::from_parts(object.path.file_name(), object.size);
        let key = object.path.comparison_key();
        if let Some(file) = created
            .get(&key)
            .and_then(|files| files.iter().find(|f| f.calculated_id == calculated_id))
        {
            return Ok((file.id.clone(), calculated_id));
        }
        for file in self.ctx.store.find_files_by_path(&object.path).await? {
            if file.calculated_id == calculated_id && !self.conflicts(&file, hash).await? {
                return Ok((file.id, calculated_id));
            }
        }

        let file = File::new(object.path.clone(), object.size, object.mod_time);
        debug!(path = %file.path, "New file");
        summary.new_files += 1;
        batch.files.push(file.clone());
        let id = file.id.clone();
        created.entry(key).or_default().push(file);
        Ok((id, calculated_id))
    }

    /// Whether an active replica of `file` has provably different content
    async fn conflicts(&self, file: &File, hash: Option<&ContentHash>) -> Result<bool, SyncError> {
        let Some(hash) = hash else {
            return Ok(false);
        };
        let replicas = self.ctx.store.get_replicas_for_file(&file.id).await?;
        Ok(replicas
            .iter()
            .filter(|r| r.is_active())
            .filter_map(|r| r.native_hash.as_ref())
            .any(|other| other.same_content(hash) == Some(false)))
    }
}

/// Turn listed files into objects, folding fragment files into one object
fn group_objects(account: &AccountKey, located: Vec<(LogicalPath, RemoteFile)>) -> Vec<ObservedObject> {
    let mut objects = Vec::new();
    let mut groups: BTreeMap<String, (LogicalPath, Vec<(ObservedFragment, DateTime<Utc>)>)> =
        BTreeMap::new();

    for (folder, file) in located {
        let fragment = parse_fragment_name(&file.name).map(|(base, n, t)| (base.to_string(), n, t));
        let name = fragment.as_ref().map_or(file.name.as_str(), |(base, _, _)| base.as_str());
        let Ok(path) = folder.join(name) else {
            warn!(account = %account, name = %file.name, "Skipping object with unusable name");
            continue;
        };
        match fragment {
            Some((_, number, total)) => {
                groups
                    .entry(path.comparison_key())
                    .or_insert_with(|| (path, Vec::new()))
                    .1
                    .push((
                        ObservedFragment {
                            number,
                            total,
                            size: file.size,
                            native_id: file.native_id,
                        },
                        file.mod_time,
                    ));
            }
            None => objects.push(ObservedObject {
                path,
                size: file.size,
                mod_time: file.mod_time,
                native_id: file.native_id,
                native_hash: file.native_hash,
                fragments: Vec::new(),
            }),
        }
    }

    for (_, (path, mut parts)) in groups {
        parts.sort_by(|a, b| a.0.number.cmp(&b.0.number).then(a.0.native_id.cmp(&b.0.native_id)));
        let mod_time = parts.iter().map(|(_, t)| *t).max().unwrap_or_else(Utc::now);
        let fragments: Vec<ObservedFragment> = parts.into_iter().map(|(f, _)| f).collect();
        objects.push(ObservedObject {
            path,
            size: fragments.iter().map(|f| f.size).sum(),
            mod_time,
            native_id: fragments
                .first()
                .map(|f| f.native_id.clone())
                .unwrap_or_default(),
            native_hash: None,
            fragments,
        });
    }

    objects.sort_by(|a, b| a.path.cmp(&b.path).then(a.native_id.cmp(&b.native_id)));
    objects
}

fn same_fragments(stored: &[ReplicaFragment], observed: &[ObservedFragment]) -> bool {
    stored.len() == observed.len()
        && stored.iter().zip(observed).all(|(s, o)| {
            s.fragment_number == o.number
                && s.fragments_total == o.total
                && s.size == o.size
                && s.native_fragment_id == o.native_id
        })
}

/// Whether a trash object is (part of) `replica`
fn trash_holds(item: &RemoteFile, replica: &Replica) -> bool {
    if item.native_id == replica.native_id {
        return true;
    }
    match parse_fragment_name(&item.name) {
        Some((base, _, _)) => replica.fragmented && base.eq_ignore_ascii_case(&replica.name),
        None => {
            item.size == replica.size
                && (item.name.eq_ignore_ascii_case(&replica.name)
                    || CalculatedId::from_parts(&item.name, item.size) == replica.calculated_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(name: &str, size: u64, id: &str) -> RemoteFile {
        RemoteFile {
            native_id: id.into(),
            name: name.into(),
            size,
            mod_time: Utc::now(),
            native_hash: None,
            parent_id: None,
        }
    }

    #[test]
    fn test_group_objects_folds_fragments() {
        let account = AccountKey::parse("telegram", "+100").unwrap();
        let docs = LogicalPath::new("docs").unwrap();
        let located = vec![
            (docs.clone(), remote("big.bin.frag002-of-002", 3, "f2")),
            (docs.clone(), remote("big.bin.frag001-of-002", 4, "f1")),
            (docs.clone(), remote("small.txt", 5, "s")),
        ];

        let objects = group_objects(&account, located);
        assert_eq!(objects.len(), 2);
        let big = &objects[0];
        assert_eq!(big.path.as_str(), "docs/big.bin");
        assert_eq!(big.size, 7);
        assert_eq!(big.native_id, "f1");
        assert!(big.fragments_complete());
        assert!(!objects[1].is_fragmented());
    }

    #[test]
    fn test_incomplete_fragment_group() {
        let account = AccountKey::parse("telegram", "+100").unwrap();
        let located = vec![(LogicalPath::root(), remote("a.frag002-of-003", 3, "f2"))];
        let objects = group_objects(&account, located);
        assert!(objects[0].is_fragmented());
        assert!(!objects[0].fragments_complete());
    }

    #[test]
    fn test_trash_matching() {
        let key = AccountKey::parse("google", "a@x.com").unwrap();
        let replica = Replica::new(&key, LogicalPath::new("docs/a.txt").unwrap(), 5, "n1", Utc::now());

        assert!(trash_holds(&remote("other", 9, "n1"), &replica));
        assert!(trash_holds(&remote("A.TXT", 5, "moved"), &replica));
        assert!(!trash_holds(&remote("a.txt", 6, "moved"), &replica));
        assert!(!trash_holds(&remote("b.txt", 5, "moved"), &replica));
    }
}
