//! Top-level commands
//!
//! Each command refreshes metadata for every account before deciding
//! anything, so decisions rest on near-current remote state. An account
//! that cannot be scanned is reported in [`Outcome::scan`]; the pass runs
//! on what the store already knows about it.

use serde::Serialize;
use tracing::instrument;

use cloudmirror_core::domain::ProviderId;

use crate::balance::StorageBalancer;
use crate::context::ReconcileContext;
use crate::dedup::{DeduplicationEngine, DuplicateChooser};
use crate::reconcile::ReconciliationEngine;
use crate::report::{BalanceReport, BatchReport, DedupReport, ReconcileReport, ScanReport};
use crate::scanner::MetadataScanner;
use crate::SyncError;

/// A metadata refresh and the pass that followed it
#[derive(Debug, Clone, Serialize)]
pub struct Outcome<R> {
    pub scan: ScanReport,
    pub report: R,
}

impl<R: BatchReport> Outcome<R> {
    pub fn has_failures(&self) -> bool {
        self.scan.has_failures() || self.report.has_failures()
    }
}

async fn refresh(ctx: &ReconcileContext) -> ScanReport {
    MetadataScanner::new(ctx.clone()).scan_all().await
}

/// Scan every configured account
#[instrument(skip_all)]
pub async fn get_metadata(ctx: &ReconcileContext) -> ScanReport {
    refresh(ctx).await
}

#[instrument(skip_all, fields(dry_run = ctx.is_dry_run()))]
pub async fn sync_providers(ctx: &ReconcileContext) -> Result<Outcome<ReconcileReport>, SyncError> {
    let scan = refresh(ctx).await;
    let report = ReconciliationEngine::new(ctx.clone()).reconcile().await?;
    Ok(Outcome { scan, report })
}

#[instrument(skip_all, fields(dry_run = ctx.is_dry_run()))]
pub async fn remove_duplicates(
    ctx: &ReconcileContext,
    provider: Option<&ProviderId>,
    chooser: &dyn DuplicateChooser,
) -> Result<Outcome<DedupReport>, SyncError> {
    let scan = refresh(ctx).await;
    let report = DeduplicationEngine::new(ctx.clone()).run(provider, chooser).await?;
    Ok(Outcome { scan, report })
}

#[instrument(skip_all, fields(dry_run = ctx.is_dry_run()))]
pub async fn balance_storage(ctx: &ReconcileContext) -> Result<Outcome<BalanceReport>, SyncError> {
    let scan = refresh(ctx).await;
    let report = StorageBalancer::new(ctx.clone()).balance().await?;
    Ok(Outcome { scan, report })
}

#[instrument(skip_all, fields(dry_run = ctx.is_dry_run()))]
pub async fn free_main(
    ctx: &ReconcileContext,
    provider: Option<&ProviderId>,
) -> Result<Outcome<BalanceReport>, SyncError> {
    let scan = refresh(ctx).await;
    let report = StorageBalancer::new(ctx.clone()).free_main(provider).await?;
    Ok(Outcome { scan, report })
}
