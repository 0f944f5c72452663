//! `cloudmirror sync-providers`: mirror every file onto every provider

use std::process::ExitCode;

use anyhow::Result;
use clap::Args;
use cloudmirror_sync::operations;

use super::{GlobalOptions, Session};

#[derive(Debug, Args)]
pub struct SyncProvidersCommand {}

impl SyncProvidersCommand {
    pub async fn execute(&self, options: &GlobalOptions) -> Result<ExitCode> {
        let session = Session::open(options).await?;
        session.formatter.info("Refreshing metadata and reconciling providers...");

        let outcome = operations::sync_providers(&session.ctx).await?;
        session.finish(&outcome, |report| {
            session.print_actions(&report.actions);
            session.formatter.success(&format!(
                "Checked {} file(s): {} uploaded, {} restored from fragments, {} renamed",
                report.files_checked, report.uploaded, report.restored, report.renamed
            ));
            if !report.verified_accounts.is_empty() {
                let verified: Vec<String> = report
                    .verified_accounts
                    .iter()
                    .map(ToString::to_string)
                    .collect();
                session
                    .formatter
                    .info(&format!("Verified: {}", verified.join(", ")));
            }
        })
    }
}
