//! `cloudmirror balance-storage` and `cloudmirror free-main`

use std::process::ExitCode;

use anyhow::Result;
use clap::Args;
use cloudmirror_core::domain::ProviderId;
use cloudmirror_sync::{operations, BalanceReport, SyncError};

use super::{format_bytes, GlobalOptions, Session};

#[derive(Debug, Args)]
pub struct BalanceStorageCommand {}

impl BalanceStorageCommand {
    pub async fn execute(&self, options: &GlobalOptions) -> Result<ExitCode> {
        let session = Session::open(options).await?;
        let outcome = operations::balance_storage(&session.ctx).await?;
        session.finish(&outcome, |report| print_balance(&session, report))
    }
}

#[derive(Debug, Args)]
pub struct FreeMainCommand {
    /// Only evacuate the main account of this provider
    #[arg(long)]
    pub provider: Option<String>,
}

impl FreeMainCommand {
    pub async fn execute(&self, options: &GlobalOptions) -> Result<ExitCode> {
        let provider = self.provider.as_deref().map(ProviderId::new).transpose()?;
        let session = Session::open(options).await?;

        match operations::free_main(&session.ctx, provider.as_ref()).await {
            Ok(outcome) => session.finish(&outcome, |report| print_balance(&session, report)),
            Err(err @ SyncError::InsufficientBackupSpace { .. }) => {
                session.formatter.error(&err.to_string());
                session
                    .formatter
                    .info("Nothing was moved. Free space on the backups or add another backup account.");
                Ok(ExitCode::FAILURE)
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn print_balance(session: &Session, report: &BalanceReport) {
    session.print_actions(&report.actions);
    session.formatter.success(&format!(
        "Moved {} file(s), {}: {} transferred, {} copied, {} awaiting consent, {} redundant removed",
        report.moved,
        format_bytes(report.bytes_moved),
        report.transferred,
        report.copied,
        report.pending_consent,
        report.redundant_removed
    ));
    for account in &report.unresolved {
        session
            .formatter
            .warn(&format!("{account} is still above the low watermark"));
    }
}
