//! Quota-driven balancing and main-account evacuation
//!
//! ## Balancing
//!
//! An account above the high watermark sheds its largest exclusive files
//! (calculatedID held by no other account of the provider) onto the backup
//! with the most free space, until it drops to the low watermark. Quotas
//! are projected locally after each move so later picks see earlier ones.
//!
//! ## Evacuation
//!
//! `free_main` empties a provider's main account. Replicas a backup
//! already holds are simply removed; the rest are relocated, but only when
//! the backups can absorb all of it.
//!
//! Relocation tries an ownership transfer first and falls back to copy
//! plus delete. A transfer awaiting the recipient's consent frees nothing
//! yet, so it never counts toward the target usage. Both runs are bounded by the configured deadline; what was
//! committed before it expired stays committed.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{debug, info, instrument, warn};

use cloudmirror_core::domain::{AccountKey, EntryStatus, ProviderId, Replica, ReplicaId};
use cloudmirror_core::ports::{CloudError, Quota, TransferOutcome};

use crate::context::ReconcileContext;
use crate::fragment::FragmentManager;
use crate::namer::CollisionNamer;
use crate::ops::{remove_replica, FolderCache, PlannedAction, Removal};
use crate::report::{BalanceReport, ItemFailure};
use crate::SyncError;

/// How a relocation went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Relocation {
    Transferred,
    PendingConsent,
    Copied,
}

/// Quotas as they will be once planned moves complete
#[derive(Debug, Default)]
struct Projection {
    quotas: BTreeMap<AccountKey, Quota>,
    moved: HashSet<ReplicaId>,
}

impl Projection {
    fn ratio(&self, account: &AccountKey) -> f64 {
        self.quotas.get(account).map_or(0.0, Quota::usage_ratio)
    }

    fn free(&self, account: &AccountKey) -> u64 {
        self.quotas.get(account).map_or(0, Quota::free)
    }

    /// Backup among `candidates` with the most free space that fits `size`
    fn pick_target(&self, candidates: &[AccountKey], size: u64) -> Option<AccountKey> {
        candidates
            .iter()
            .map(|key| (key, self.free(key)))
            .filter(|(_, free)| *free >= size)
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(key, _)| key.clone())
    }

    fn apply(&mut self, replica: &Replica, from: &AccountKey, to: &AccountKey) {
        if let Some(q) = self.quotas.get_mut(from) {
            q.used = q.used.saturating_sub(replica.size);
        }
        if let Some(q) = self.quotas.get_mut(to) {
            q.used = q.used.saturating_add(replica.size);
        }
        self.moved.insert(replica.id.clone());
    }

    /// Keep `replica` out of later picks without shifting any usage
    fn hold(&mut self, replica: &Replica) {
        self.moved.insert(replica.id.clone());
    }
}

/// Mutable state of one balance or evacuation run
#[derive(Default)]
struct Run {
    folders: FolderCache,
    paths: HashMap<AccountKey, HashSet<String>>,
    report: BalanceReport,
}

pub struct StorageBalancer {
    ctx: ReconcileContext,
    fragments: FragmentManager,
}

impl StorageBalancer {
    pub fn new(ctx: ReconcileContext) -> Self {
        Self {
            fragments: FragmentManager::new(ctx.store.clone()).with_retry(ctx.settings.retry.clone()),
            ctx,
        }
    }

    /// Relieve every account above the high watermark
    #[instrument(skip(self))]
    pub async fn balance(&self) -> Result<BalanceReport, SyncError> {
        let deadline = self.ctx.settings.deadline;
        let mut run = Run::default();
        tokio::time::timeout(deadline, self.balance_all(&mut run))
            .await
            .map_err(|_| SyncError::DeadlineExceeded(deadline))??;
        Ok(self.finish(run.report, "Balance complete"))
    }

    /// Move everything off the main account of `provider`, or of every
    /// provider when `None`
    #[instrument(skip(self))]
    pub async fn free_main(&self, provider: Option<&ProviderId>) -> Result<BalanceReport, SyncError> {
        let providers = match provider {
            Some(p) => vec![p.clone()],
            None => self.ctx.registry.providers(),
        };
        let deadline = self.ctx.settings.deadline;
        let mut run = Run::default();
        tokio::time::timeout(deadline, self.evacuate(&providers, &mut run))
            .await
            .map_err(|_| SyncError::DeadlineExceeded(deadline))??;
        Ok(self.finish(run.report, "Evacuation complete"))
    }

    fn finish(&self, report: BalanceReport, message: &str) -> BalanceReport {
        info!(
            moved = report.moved,
            transferred = report.transferred,
            pending_consent = report.pending_consent,
            copied = report.copied,
            redundant_removed = report.redundant_removed,
            bytes_moved = report.bytes_moved,
            unresolved = report.unresolved.len(),
            failures = report.failures.len(),
            dry_run = self.ctx.is_dry_run(),
            "{message}"
        );
        report
    }

    async fn balance_all(&self, run: &mut Run) -> Result<(), SyncError> {
        let (high, low) = (self.ctx.settings.high_watermark, self.ctx.settings.low_watermark);
        for provider in self.ctx.registry.providers() {
            let accounts: Vec<AccountKey> = self
                .ctx
                .registry
                .accounts_of(&provider)
                .into_iter()
                .map(|e| e.key.clone())
                .collect();
            let backups: Vec<AccountKey> = self
                .ctx
                .registry
                .backups(&provider)
                .into_iter()
                .map(|e| e.key.clone())
                .collect();
            let mut projection = self.load_quotas(&accounts, &mut run.report).await;

            for account in &accounts {
                if !projection.quotas.contains_key(account) || projection.ratio(account) <= high {
                    continue;
                }
                info!(
                    account = %account,
                    usage = projection.ratio(account),
                    "Account above high watermark"
                );
                let _marker = self.ctx.markers.read(account).await;
                let targets: Vec<AccountKey> =
                    backups.iter().filter(|k| *k != account).cloned().collect();

                let candidates = self.ctx.store.get_largest_files_exclusive(account).await?;
                for (file, replica) in candidates {
                    if projection.ratio(account) <= low {
                        break;
                    }
                    if projection.moved.contains(&replica.id) {
                        continue;
                    }
                    let Some(target) = projection.pick_target(&targets, replica.size) else {
                        debug!(path = %file.path, size = replica.size, "No backup can take file");
                        continue;
                    };
                    match self.relocate(&replica, account, &target, run).await {
                        Ok(Relocation::PendingConsent) => projection.hold(&replica),
                        Ok(how) => {
                            debug!(path = %replica.path, ?how, "Relocated");
                            projection.apply(&replica, account, &target);
                            run.report.moved += 1;
                            run.report.bytes_moved += replica.size;
                        }
                        Err(err) => {
                            warn!(path = %replica.path, error = %err, "Relocation failed");
                            run.report.failures.push(ItemFailure::new(
                                format!("{account}:{}", replica.path),
                                err,
                            ));
                        }
                    }
                }

                if projection.ratio(account) > low {
                    warn!(account = %account, usage = projection.ratio(account), "Still above low watermark");
                    run.report.unresolved.push(account.clone());
                }
            }
        }
        Ok(())
    }

    async fn evacuate(&self, providers: &[ProviderId], run: &mut Run) -> Result<(), SyncError> {
        struct Plan {
            main: AccountKey,
            backups: Vec<AccountKey>,
            projection: Projection,
            redundant: Vec<Replica>,
            exclusive: Vec<Replica>,
        }

        // check every provider before touching anything
        let mut plans = Vec::new();
        for provider in providers {
            let Some(main) = self.ctx.registry.main_account(provider).map(|e| e.key.clone()) else {
                run.report
                    .failures
                    .push(ItemFailure::new(provider, "no main account configured"));
                continue;
            };
            let backups: Vec<AccountKey> = self
                .ctx
                .registry
                .backups(provider)
                .into_iter()
                .map(|e| e.key.clone())
                .collect();

            let _marker = self.ctx.markers.read(&main).await;
            let (redundant, mut exclusive) = self.classify_main(&main).await?;
            if redundant.is_empty() && exclusive.is_empty() {
                debug!(account = %main, "Main account holds nothing");
                continue;
            }
            exclusive.sort_by(|a, b| {
                b.size
                    .cmp(&a.size)
                    .then_with(|| a.path.comparison_key().cmp(&b.path.comparison_key()))
            });

            let projection = self.load_quotas(&backups, &mut run.report).await;
            let required: u64 = exclusive.iter().map(|r| r.size).sum();
            let available: u64 = backups.iter().map(|k| projection.free(k)).sum();
            if required > available {
                return Err(SyncError::InsufficientBackupSpace {
                    provider: provider.clone(),
                    required,
                    available,
                });
            }
            info!(
                provider = %provider,
                redundant = redundant.len(),
                exclusive = exclusive.len(),
                required,
                available,
                "Evacuation planned"
            );
            plans.push(Plan {
                main,
                backups,
                projection,
                redundant,
                exclusive,
            });
        }

        for mut plan in plans {
            let _marker = self.ctx.markers.read(&plan.main).await;
            let client = self.ctx.client(&plan.main)?;
            for replica in &plan.redundant {
                let result =
                    match remove_replica(&self.ctx, client.as_ref(), replica, &mut run.report.actions)
                        .await
                    {
                        Ok(removal) => self.record_removal(replica, removal).await,
                        Err(err) => Err(err),
                    };
                match result {
                    Ok(()) => run.report.redundant_removed += 1,
                    Err(err) => run.report.failures.push(ItemFailure::new(
                        format!("{}:{}", plan.main, replica.path),
                        err,
                    )),
                }
            }

            let mut awaiting_consent = 0usize;
            for replica in &plan.exclusive {
                let Some(target) = plan.projection.pick_target(&plan.backups, replica.size) else {
                    run.report.failures.push(ItemFailure::new(
                        format!("{}:{}", plan.main, replica.path),
                        SyncError::NoEligibleBackup {
                            provider: plan.main.provider.clone(),
                            path: replica.path.to_string(),
                            size: replica.size,
                        },
                    ));
                    continue;
                };
                match self.relocate(replica, &plan.main, &target, run).await {
                    Ok(Relocation::PendingConsent) => {
                        plan.projection.hold(replica);
                        awaiting_consent += 1;
                    }
                    Ok(how) => {
                        debug!(path = %replica.path, ?how, "Relocated");
                        plan.projection.apply(replica, &plan.main, &target);
                        run.report.moved += 1;
                        run.report.bytes_moved += replica.size;
                    }
                    Err(err) => {
                        warn!(path = %replica.path, error = %err, "Relocation failed");
                        run.report.failures.push(ItemFailure::new(
                            format!("{}:{}", plan.main, replica.path),
                            err,
                        ));
                    }
                }
            }
            if awaiting_consent > 0 {
                warn!(account = %plan.main, awaiting_consent, "Main account still holds files awaiting transfer consent");
                run.report.unresolved.push(plan.main.clone());
            }
        }
        Ok(())
    }

    /// Split the main account's active replicas into those another account
    /// of the provider already holds and those only main holds
    async fn classify_main(
        &self,
        main: &AccountKey,
    ) -> Result<(Vec<Replica>, Vec<Replica>), SyncError> {
        let mut redundant = Vec::new();
        let mut exclusive = Vec::new();
        for replica in self.ctx.store.get_replicas_by_account(main).await? {
            if !replica.is_active() {
                continue;
            }
            let held_elsewhere = match &replica.file_id {
                Some(file_id) => self
                    .ctx
                    .store
                    .get_replicas_for_file(file_id)
                    .await?
                    .iter()
                    .any(|r| {
                        r.is_active() && r.provider == main.provider && r.account_id != main.account
                    }),
                None => false,
            };
            if held_elsewhere {
                redundant.push(replica);
            } else {
                exclusive.push(replica);
            }
        }
        Ok((redundant, exclusive))
    }

    async fn load_quotas(&self, accounts: &[AccountKey], report: &mut BalanceReport) -> Projection {
        let mut projection = Projection::default();
        for account in accounts {
            let quota = match self.ctx.client(account) {
                Ok(client) => client
                    .get_quota()
                    .await
                    .map_err(|e| SyncError::cloud(account, e)),
                Err(err) => Err(err),
            };
            match quota {
                Ok(quota) => {
                    debug!(account = %account, used = quota.used, total = quota.total, "Quota");
                    projection.quotas.insert(account.clone(), quota);
                }
                Err(err) => {
                    warn!(account = %account, error = %err, "Quota unavailable");
                    report.failures.push(ItemFailure::new(account, err));
                }
            }
        }
        projection
    }

    /// Move `replica` from `from` to `to`, by transfer when the provider
    /// allows it and by copy otherwise
    async fn relocate(
        &self,
        replica: &Replica,
        from: &AccountKey,
        to: &AccountKey,
        run: &mut Run,
    ) -> Result<Relocation, SyncError> {
        let capabilities = self.ctx.registry.capabilities(&from.provider);
        let source = self.ctx.client(from)?;

        if capabilities.supports_ownership_transfer && !replica.fragmented {
            let action = PlannedAction::TransferOwnership {
                from: from.clone(),
                to: to.clone(),
                path: replica.path.clone(),
            };
            let permitted = self.ctx.gate.permit(&action);
            run.report.actions.push(action);
            if !permitted {
                run.report.transferred += 1;
                return Ok(Relocation::Transferred);
            }
            match source.transfer_ownership(&replica.native_id, &to.account).await {
                Ok(TransferOutcome::Transferred) => {
                    let mut moved = replica.clone();
                    moved.account_id = to.account.clone();
                    self.ctx.store.upsert_replica(&moved).await?;
                    run.report.transferred += 1;
                    info!(path = %replica.path, from = %from, to = %to, "Ownership transferred");
                    return Ok(Relocation::Transferred);
                }
                Ok(TransferOutcome::PendingConsent) => {
                    run.report.pending_consent += 1;
                    info!(path = %replica.path, to = %to, "Transfer awaits consent");
                    return Ok(Relocation::PendingConsent);
                }
                Err(CloudError::Unsupported(reason)) => {
                    debug!(reason = %reason, "Transfer unsupported, copying instead");
                }
                Err(err) => return Err(SyncError::cloud(from, err)),
            }
        }

        let target = self.ctx.client(to)?;
        if !run.paths.contains_key(to) {
            let taken = self
                .ctx
                .store
                .get_replicas_by_account(to)
                .await?
                .into_iter()
                .filter(|r| r.is_active())
                .map(|r| r.path.comparison_key())
                .collect();
            run.paths.insert(to.clone(), taken);
        }
        let taken = run.paths.entry(to.clone()).or_default();
        let folder_path = replica.path.parent();
        let mut dest_path = replica.path.clone();
        if taken.contains(&dest_path.comparison_key()) {
            let name = CollisionNamer::generate_unique(replica.path.file_name(), |candidate| {
                folder_path
                    .join(candidate)
                    .map_or(true, |p| taken.contains(&p.comparison_key()))
            });
            dest_path = folder_path.join(&name)?;
        }

        let folder_id = run
            .folders
            .ensure(&self.ctx, target.as_ref(), &folder_path, &mut run.report.actions)
            .await?;
        let action = PlannedAction::Relocate {
            from: from.clone(),
            to: to.clone(),
            path: dest_path.clone(),
            size: replica.size,
        };
        let permitted = self.ctx.gate.permit(&action);
        run.report.actions.push(action);

        if permitted {
            let stream = self.fragments.reconstruct(&source, replica).await?;
            let fragments = &self.fragments;
            let reopen_client = &source;
            let uploaded = self
                .fragments
                .upload(
                    target.as_ref(),
                    &folder_id,
                    dest_path.file_name(),
                    stream,
                    replica.size,
                    capabilities.max_object_size,
                    move || fragments.reconstruct(reopen_client, replica),
                )
                .await?;

            let mut copy = Replica::new(
                to,
                dest_path.clone(),
                uploaded.size,
                &uploaded.native_id,
                uploaded.mod_time,
            )
            .with_hash(Some(uploaded.hash.clone()));
            copy.file_id = replica.file_id.clone();
            copy.calculated_id = replica.calculated_id.clone();
            copy.fragmented = uploaded.is_fragmented();
            self.ctx.store.upsert_replica(&copy).await?;
            if copy.fragmented {
                self.ctx
                    .store
                    .replace_fragments(&copy.id, &uploaded.fragment_rows(&copy.id))
                    .await?;
            }
        }
        run.paths
            .entry(to.clone())
            .or_default()
            .insert(dest_path.comparison_key());
        run.report.copied += 1;

        let removal =
            remove_replica(&self.ctx, source.as_ref(), replica, &mut run.report.actions).await?;
        self.record_removal(replica, removal).await?;
        info!(path = %replica.path, from = %from, to = %to, "Replica relocated");
        Ok(Relocation::Copied)
    }

    /// Reflect a removal of `replica` in the store
    async fn record_removal(&self, replica: &Replica, removal: Removal) -> Result<(), SyncError> {
        match removal {
            Removal::Planned => return Ok(()),
            Removal::Deleted | Removal::AlreadyGone => {
                self.ctx.store.delete_replica(&replica.id).await?;
            }
            Removal::Trashed => {
                self.ctx
                    .store
                    .mark_replica_status(&replica.id, EntryStatus::SoftDeleted)
                    .await?;
            }
        }
        if let Some(file_id) = &replica.file_id {
            self.ctx.store.refresh_file_status(file_id).await?;
        }
        Ok(())
    }
}
