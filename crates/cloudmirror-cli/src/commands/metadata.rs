//! `cloudmirror get-metadata`: refresh the store from every account

use std::process::ExitCode;

use anyhow::Result;
use clap::Args;
use cloudmirror_sync::{operations, BatchReport};

use super::{exit_status, print_scan, GlobalOptions, Session};

#[derive(Debug, Args)]
pub struct GetMetadataCommand {}

impl GetMetadataCommand {
    pub async fn execute(&self, options: &GlobalOptions) -> Result<ExitCode> {
        let session = Session::open(options).await?;
        let scan = operations::get_metadata(&session.ctx).await;

        if session.is_json() {
            session.formatter.print_json(&serde_json::to_value(&scan)?);
        } else {
            print_scan(&*session.formatter, &scan);
            let objects: usize = scan.accounts.iter().map(|a| a.objects).sum();
            session.formatter.success(&format!(
                "Scanned {} account(s), {} object(s)",
                scan.accounts.len(),
                objects
            ));
        }
        Ok(exit_status(scan.has_failures()))
    }
}
