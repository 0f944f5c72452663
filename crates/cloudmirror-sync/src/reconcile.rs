//! Cross-provider reconciliation
//!
//! Every active File should have a replica on every provider. For each
//! provider holding no active replica of a File, the engine copies the
//! content into that provider's main account.
//!
//! ## Reconcile Flow
//!
//! 1. **Plan**: walk active Files in path order; a provider counts as
//!    covered when any of its accounts holds an active replica
//! 2. **Name**: a different File already at the destination path pushes
//!    the upload to the first free ` (n)` name
//! 3. **Copy**: stream from a whole replica when one exists, otherwise
//!    reassemble a fragment set; split again for the destination's size
//!    ceiling
//! 4. **Verify**: re-scan every account that received uploads and check
//!    that each new object is listed

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, info, instrument, warn};

use cloudmirror_core::domain::{AccountKey, EntryStatus, File, FileId, LogicalPath, Replica};
use cloudmirror_core::ports::FileFilter;

use crate::context::ReconcileContext;
use crate::fragment::FragmentManager;
use crate::namer::CollisionNamer;
use crate::ops::{FolderCache, PlannedAction};
use crate::report::{ItemFailure, ReconcileReport};
use crate::scanner::MetadataScanner;
use crate::SyncError;

/// Active replica paths of one account, mapped to their owning File
type PathIndex = HashMap<String, FileId>;

/// Mutable state of one reconcile pass
#[derive(Default)]
struct Pass {
    indexes: HashMap<AccountKey, PathIndex>,
    folders: FolderCache,
    mutated: BTreeSet<AccountKey>,
    expected: Vec<(AccountKey, String)>,
    report: ReconcileReport,
}

impl Pass {
    /// Count a copy that landed (or would land) and claim its path
    fn record_copy(
        &mut self,
        target: &AccountKey,
        dest_path: &LogicalPath,
        file: &FileId,
        restore: bool,
        renamed: bool,
    ) {
        self.indexes
            .entry(target.clone())
            .or_default()
            .insert(dest_path.comparison_key(), file.clone());
        if restore {
            self.report.restored += 1;
        } else {
            self.report.uploaded += 1;
        }
        if renamed {
            self.report.renamed += 1;
        }
    }
}

pub struct ReconciliationEngine {
    ctx: ReconcileContext,
    fragments: FragmentManager,
    scanner: MetadataScanner,
}

impl ReconciliationEngine {
    pub fn new(ctx: ReconcileContext) -> Self {
        Self {
            fragments: FragmentManager::new(ctx.store.clone()).with_retry(ctx.settings.retry.clone()),
            scanner: MetadataScanner::new(ctx.clone()),
            ctx,
        }
    }

    /// Bring every active File onto every provider's main account
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<ReconcileReport, SyncError> {
        let mut files = self
            .ctx
            .store
            .list_files(&FileFilter::new().with_status(EntryStatus::Active))
            .await?;
        files.sort_by(|a, b| {
            a.path
                .comparison_key()
                .cmp(&b.path.comparison_key())
                .then(a.id.cmp(&b.id))
        });

        let registry = &self.ctx.registry;
        let targets: Vec<AccountKey> = registry
            .providers()
            .iter()
            .filter_map(|p| registry.main_account(p).map(|e| e.key.clone()))
            .collect();
        info!(files = files.len(), targets = targets.len(), "Reconciling");

        let mut pass = Pass::default();
        for file in &files {
            pass.report.files_checked += 1;
            if let Err(err) = self.reconcile_file(file, &targets, &mut pass).await {
                warn!(path = %file.path, error = %err, "Could not reconcile file");
                pass.report.failures.push(ItemFailure::new(&file.path, err));
            }
        }

        if !pass.mutated.is_empty() {
            self.verify(&mut pass).await?;
        }

        let report = pass.report;
        info!(
            uploaded = report.uploaded,
            restored = report.restored,
            renamed = report.renamed,
            failures = report.failures.len(),
            dry_run = self.ctx.is_dry_run(),
            "Reconcile complete"
        );
        Ok(report)
    }

    async fn reconcile_file(
        &self,
        file: &File,
        targets: &[AccountKey],
        pass: &mut Pass,
    ) -> Result<(), SyncError> {
        let replicas = self.ctx.store.get_replicas_for_file(&file.id).await?;
        let mut sources: Vec<&Replica> = replicas.iter().filter(|r| r.is_active()).collect();
        if sources.is_empty() {
            return Ok(());
        }
        // whole copies first; fragment sets only when nothing else is left
        sources.sort_by_key(|r| (r.fragmented, r.account_key()));

        let restore = sources.iter().all(|r| r.fragmented)
            && replicas.iter().any(|r| !r.fragmented && !r.is_active());

        for target in targets {
            if sources.iter().any(|r| r.provider == target.provider) {
                continue;
            }
            if let Err(err) = self.copy_to(file, &sources, target, restore, pass).await {
                warn!(path = %file.path, target = %target, error = %err, "Copy failed");
                pass.report
                    .failures
                    .push(ItemFailure::new(format!("{} -> {target}", file.path), err));
            }
        }
        Ok(())
    }

    async fn copy_to(
        &self,
        file: &File,
        sources: &[&Replica],
        target: &AccountKey,
        restore: bool,
        pass: &mut Pass,
    ) -> Result<(), SyncError> {
        let client = self.ctx.client(target)?;
        if !pass.indexes.contains_key(target) {
            let index = self.load_index(target).await?;
            pass.indexes.insert(target.clone(), index);
        }
        let index = pass.indexes.entry(target.clone()).or_default();

        let folder_path = file.path.parent();
        let mut dest_path = file.path.clone();
        let renamed = index
            .get(&dest_path.comparison_key())
            .is_some_and(|owner| *owner != file.id);
        if renamed {
            let name = CollisionNamer::generate_unique(file.path.file_name(), |candidate| {
                folder_path
                    .join(candidate)
                    .map_or(true, |p| index.contains_key(&p.comparison_key()))
            });
            dest_path = folder_path.join(&name)?;
            debug!(path = %file.path, renamed = %dest_path, "Destination path taken");
        }

        let folder_id = pass
            .folders
            .ensure(&self.ctx, client.as_ref(), &folder_path, &mut pass.report.actions)
            .await?;

        let action = PlannedAction::Upload {
            account: target.clone(),
            path: dest_path.clone(),
            size: file.size,
            source: sources[0].account_key(),
            restore,
        };
        let permitted = self.ctx.gate.permit(&action);
        pass.report.actions.push(action);
        if !permitted {
            pass.record_copy(target, &dest_path, &file.id, restore, renamed);
            return Ok(());
        }

        let max_object_size = self
            .ctx
            .registry
            .capabilities(&target.provider)
            .max_object_size;
        let mut last_error = None;
        for source in sources {
            let source_client = self.ctx.client(&source.account_key())?;
            let stream = match self.fragments.reconstruct(&source_client, source).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(path = %file.path, source = %source.account_key(), error = %err, "Source unusable");
                    last_error = Some(err);
                    continue;
                }
            };
            let fragments = &self.fragments;
            let reopen_client = &source_client;
            let uploaded = self
                .fragments
                .upload(
                    client.as_ref(),
                    &folder_id,
                    dest_path.file_name(),
                    stream,
                    file.size,
                    max_object_size,
                    move || fragments.reconstruct(reopen_client, source),
                )
                .await?;

            if let Some(expected) = &source.native_hash {
                if expected.same_content(&uploaded.hash) == Some(false) {
                    warn!(path = %file.path, "Uploaded content differs from the recorded source hash");
                }
            }

            let mut replica = Replica::new(
                target,
                dest_path.clone(),
                uploaded.size,
                &uploaded.native_id,
                uploaded.mod_time,
            )
            .with_file(file.id.clone())
            .with_hash(Some(uploaded.hash.clone()));
            replica.calculated_id = file.calculated_id.clone();
            replica.fragmented = uploaded.is_fragmented();

            self.ctx.store.upsert_replica(&replica).await?;
            if replica.fragmented {
                self.ctx
                    .store
                    .replace_fragments(&replica.id, &uploaded.fragment_rows(&replica.id))
                    .await?;
            }
            self.ctx.store.refresh_file_status(&file.id).await?;

            info!(
                path = %dest_path,
                target = %target,
                source = %source.account_key(),
                restore,
                fragments = uploaded.fragments.len(),
                "Replica created"
            );
            pass.record_copy(target, &dest_path, &file.id, restore, renamed);
            pass.mutated.insert(target.clone());
            pass.expected.push((target.clone(), replica.native_id));
            return Ok(());
        }

        match last_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn load_index(&self, account: &AccountKey) -> Result<PathIndex, SyncError> {
        Ok(self
            .ctx
            .store
            .get_replicas_by_account(account)
            .await?
            .into_iter()
            .filter(|r| r.is_active())
            .filter_map(|r| r.file_id.map(|id| (r.path.comparison_key(), id)))
            .collect())
    }

    /// Re-list mutated accounts and check every upload shows up
    async fn verify(&self, pass: &mut Pass) -> Result<(), SyncError> {
        let accounts: Vec<AccountKey> = pass.mutated.iter().cloned().collect();
        let scan = self.scanner.scan_accounts(&accounts).await;
        pass.report.failures.extend(scan.failures);
        pass.report.verified_accounts = scan.accounts.into_iter().map(|a| a.account).collect();

        for (account, native_id) in &pass.expected {
            let listed = self
                .ctx
                .store
                .get_replica_by_native_id(account, native_id)
                .await?
                .is_some_and(|r| r.is_active());
            if !listed {
                pass.report.failures.push(ItemFailure::new(
                    format!("{account}:{native_id}"),
                    "uploaded object missing after re-list",
                ));
            }
        }
        Ok(())
    }
}

