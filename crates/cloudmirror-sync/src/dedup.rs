//! Duplicate removal within one provider
//!
//! Files of one provider sharing a calculatedID are only candidates. A
//! destructive decision needs every member's content hash to agree; members
//! without a hash, or with a different one, are left alone and the group is
//! reported as ambiguous.
//!
//! The [`DuplicateChooser`] picks the Files to remove. [`OldestWins`] keeps
//! the earliest-modified File; the CLI supplies an interactive chooser.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use cloudmirror_core::domain::{ContentHash, EntryStatus, FileId, ProviderId};
use cloudmirror_core::ports::{DuplicateCandidate, DuplicateGroup};

use crate::context::ReconcileContext;
use crate::ops::{remove_replica, Removal};
use crate::report::{DedupReport, ItemFailure};
use crate::SyncError;

/// Picks which Files of a duplicate group to remove
#[async_trait]
pub trait DuplicateChooser: Send + Sync {
    /// Ids of the members to remove; the rest are kept
    async fn choose(&self, group: &DuplicateGroup) -> anyhow::Result<Vec<FileId>>;
}

/// Keep the File with the earliest modification time
///
/// Ties fall back to path order, then id, so the choice is stable.
#[derive(Debug, Clone, Copy, Default)]
pub struct OldestWins;

impl OldestWins {
    pub fn keeper(group: &DuplicateGroup) -> Option<&DuplicateCandidate> {
        group.members.iter().min_by(|a, b| {
            a.file
                .mod_time
                .cmp(&b.file.mod_time)
                .then_with(|| a.file.path.comparison_key().cmp(&b.file.path.comparison_key()))
                .then_with(|| a.file.id.cmp(&b.file.id))
        })
    }
}

#[async_trait]
impl DuplicateChooser for OldestWins {
    async fn choose(&self, group: &DuplicateGroup) -> anyhow::Result<Vec<FileId>> {
        let Some(keeper) = Self::keeper(group) else {
            return Ok(Vec::new());
        };
        Ok(group
            .members
            .iter()
            .filter(|m| m.file.id != keeper.file.id)
            .map(|m| m.file.id.clone())
            .collect())
    }
}

/// Content hash shared by all hashed replicas of a member, if any
fn member_hash(member: &DuplicateCandidate) -> Option<&ContentHash> {
    let mut hashes = member.replicas.iter().filter_map(|r| r.native_hash.as_ref());
    let first = hashes.next()?;
    hashes
        .all(|h| first.same_content(h) == Some(true))
        .then_some(first)
}

/// Split a calculatedID group by content hash
///
/// Returns the hash-confirmed subgroups with at least two members and
/// whether anything was left out.
fn confirmed_subgroups(group: &DuplicateGroup) -> (Vec<DuplicateGroup>, bool) {
    let mut by_hash: BTreeMap<String, Vec<DuplicateCandidate>> = BTreeMap::new();
    let mut unhashed = 0usize;
    for member in &group.members {
        match member_hash(member) {
            Some(hash) => by_hash.entry(hash.to_string()).or_default().push(member.clone()),
            None => unhashed += 1,
        }
    }

    let ambiguous = unhashed > 0 || by_hash.len() > 1;
    let subgroups = by_hash
        .into_values()
        .filter(|members| members.len() > 1)
        .map(|members| DuplicateGroup {
            provider: group.provider.clone(),
            calculated_id: group.calculated_id.clone(),
            members,
        })
        .collect();
    (subgroups, ambiguous)
}

pub struct DeduplicationEngine {
    ctx: ReconcileContext,
}

impl DeduplicationEngine {
    pub fn new(ctx: ReconcileContext) -> Self {
        Self { ctx }
    }

    /// Remove duplicates in `provider`, or in every provider when `None`
    #[instrument(skip(self, chooser))]
    pub async fn run(
        &self,
        provider: Option<&ProviderId>,
        chooser: &dyn DuplicateChooser,
    ) -> Result<DedupReport, SyncError> {
        let providers = match provider {
            Some(p) => vec![p.clone()],
            None => self.ctx.registry.providers(),
        };

        let mut report = DedupReport::default();
        for provider in &providers {
            let accounts: Vec<_> = self
                .ctx
                .registry
                .accounts_of(provider)
                .into_iter()
                .map(|e| e.key.clone())
                .collect();
            if accounts.is_empty() {
                report
                    .failures
                    .push(ItemFailure::new(provider, "no configured accounts"));
                continue;
            }

            // no half-written scan may show up as duplicates
            let mut guards = Vec::with_capacity(accounts.len());
            for account in &accounts {
                guards.push(self.ctx.markers.read(account).await);
            }

            let groups = self.ctx.store.find_duplicate_groups(provider).await?;
            debug!(provider = %provider, groups = groups.len(), "Duplicate candidates");
            for group in groups {
                let (subgroups, ambiguous) = confirmed_subgroups(&group);
                if ambiguous {
                    warn!(
                        provider = %provider,
                        calculated_id = %group.calculated_id,
                        members = group.members.len(),
                        "Same name and size but content not confirmed identical"
                    );
                    report.ambiguous_groups += 1;
                }
                for subgroup in subgroups {
                    report.groups += 1;
                    self.resolve(&subgroup, chooser, &mut report).await;
                }
            }
            drop(guards);
        }

        info!(
            groups = report.groups,
            ambiguous = report.ambiguous_groups,
            files_removed = report.files_removed,
            failures = report.failures.len(),
            dry_run = self.ctx.is_dry_run(),
            "Deduplication complete"
        );
        Ok(report)
    }

    async fn resolve(
        &self,
        group: &DuplicateGroup,
        chooser: &dyn DuplicateChooser,
        report: &mut DedupReport,
    ) {
        let chosen = match chooser.choose(group).await {
            Ok(chosen) => chosen,
            Err(err) => {
                report
                    .failures
                    .push(ItemFailure::new(&group.calculated_id, format!("{err:#}")));
                return;
            }
        };
        let members: HashSet<FileId> = group.members.iter().map(|m| m.file.id.clone()).collect();
        let chosen: HashSet<FileId> = chosen.into_iter().filter(|id| members.contains(id)).collect();
        if chosen.is_empty() {
            return;
        }
        if chosen.len() == members.len() {
            warn!(calculated_id = %group.calculated_id, "Refusing to remove every copy");
            report.failures.push(ItemFailure::new(
                &group.calculated_id,
                "selection would remove every copy",
            ));
            return;
        }

        for member in group.members.iter().filter(|m| chosen.contains(&m.file.id)) {
            if let Err(err) = self.remove_member(member, report).await {
                warn!(path = %member.file.path, error = %err, "Could not remove duplicate");
                report.failures.push(ItemFailure::new(&member.file.path, err));
            }
        }
    }

    /// Remove every replica of `member` in the group's provider
    async fn remove_member(
        &self,
        member: &DuplicateCandidate,
        report: &mut DedupReport,
    ) -> Result<(), SyncError> {
        for replica in &member.replicas {
            let client = self.ctx.client(&replica.account_key())?;
            match remove_replica(&self.ctx, client.as_ref(), replica, &mut report.actions).await? {
                Removal::Planned => report.replicas_deleted += 1,
                Removal::Deleted | Removal::AlreadyGone => {
                    report.replicas_deleted += 1;
                    self.ctx
                        .store
                        .mark_replica_status(&replica.id, EntryStatus::Deleted)
                        .await?;
                }
                Removal::Trashed => {
                    report.replicas_trashed += 1;
                    self.ctx
                        .store
                        .mark_replica_status(&replica.id, EntryStatus::SoftDeleted)
                        .await?;
                }
            }
        }
        report.files_removed += 1;
        info!(path = %member.file.path, replicas = member.replicas.len(), "Duplicate removed");

        if self.ctx.is_dry_run() {
            return Ok(());
        }
        let remaining = self.ctx.store.get_replicas_for_file(&member.file.id).await?;
        if remaining.iter().any(|r| r.is_active()) {
            self.ctx.store.refresh_file_status(&member.file.id).await?;
        } else {
            self.ctx.store.delete_file(&member.file.id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use cloudmirror_core::domain::{AccountKey, File, HashAlgorithm, LogicalPath, Replica};

    use super::*;

    fn member(path: &str, age_days: i64, hash: Option<&str>) -> DuplicateCandidate {
        let when = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() - Duration::days(age_days);
        let account = AccountKey::parse("google", "a@x.com").unwrap();
        let file = File::new(LogicalPath::new(path).unwrap(), 10, when);
        let hash = hash.map(|h| ContentHash::new(HashAlgorithm::Md5, h).unwrap());
        let replica = Replica::new(&account, file.path.clone(), 10, path, when)
            .with_file(file.id.clone())
            .with_hash(hash);
        DuplicateCandidate {
            file,
            replicas: vec![replica],
        }
    }

    fn group(members: Vec<DuplicateCandidate>) -> DuplicateGroup {
        DuplicateGroup {
            provider: ProviderId::new("google").unwrap(),
            calculated_id: members[0].file.calculated_id.clone(),
            members,
        }
    }

    const H1: &str = "0cc175b9c0f1b6a831c399e269772661";
    const H2: &str = "92eb5ffee6ae2fec3ad71c777531578f";

    #[tokio::test]
    async fn test_oldest_wins_keeps_earliest() {
        let g = group(vec![
            member("a/x.txt", 1, Some(H1)),
            member("b/x.txt", 30, Some(H1)),
            member("c/x.txt", 5, Some(H1)),
        ]);
        let removed = OldestWins.choose(&g).await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(!removed.contains(&g.members[1].file.id));
    }

    #[test]
    fn test_unhashed_members_are_ambiguous() {
        let g = group(vec![member("a/x.txt", 1, Some(H1)), member("b/x.txt", 2, None)]);
        let (subgroups, ambiguous) = confirmed_subgroups(&g);
        assert!(subgroups.is_empty());
        assert!(ambiguous);
    }

    #[test]
    fn test_hash_split_keeps_confirmed_pairs() {
        let g = group(vec![
            member("a/x.txt", 1, Some(H1)),
            member("b/x.txt", 2, Some(H1)),
            member("c/x.txt", 3, Some(H2)),
        ]);
        let (subgroups, ambiguous) = confirmed_subgroups(&g);
        assert!(ambiguous);
        assert_eq!(subgroups.len(), 1);
        assert_eq!(subgroups[0].members.len(), 2);
    }
}
