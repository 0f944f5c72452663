//! `cloudmirror status`: quota and stored totals per account
//!
//! Reads live quota from every account and the replica totals the store
//! holds. No scan is run, so the totals reflect the last refresh.

use std::collections::BTreeMap;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Args;
use cloudmirror_core::domain::AccountKey;
use cloudmirror_core::ports::{AccountStorageSummary, Quota};
use futures_util::future::join_all;
use tracing::warn;

use super::{exit_status, format_bytes, GlobalOptions, Session};

#[derive(Debug, Args)]
pub struct StatusCommand {}

impl StatusCommand {
    pub async fn execute(&self, options: &GlobalOptions) -> Result<ExitCode> {
        let session = Session::open(options).await?;
        let ctx = &session.ctx;

        let summaries: BTreeMap<AccountKey, AccountStorageSummary> = ctx
            .store
            .storage_summary()
            .await
            .context("Failed to read storage summary")?
            .into_iter()
            .map(|s| (s.account.clone(), s))
            .collect();

        let mut entries: Vec<_> = ctx.registry.accounts().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        let quotas = join_all(entries.iter().map(|entry| entry.client.get_quota())).await;

        let mut failed = false;
        let mut rows = Vec::with_capacity(entries.len());
        for (entry, quota) in entries.iter().zip(quotas) {
            let quota = match quota {
                Ok(quota) => Some(quota),
                Err(err) => {
                    warn!(account = %entry.key, error = %err, "Quota unavailable");
                    session
                        .formatter
                        .error(&format!("{}: quota unavailable: {err}", entry.key));
                    failed = true;
                    None
                }
            };
            rows.push(Row {
                key: &entry.key,
                is_main: entry.is_main,
                quota,
                stored: summaries.get(&entry.key),
            });
        }

        if session.is_json() {
            let accounts: Vec<serde_json::Value> = rows.iter().map(Row::to_json).collect();
            session
                .formatter
                .print_json(&serde_json::json!({ "accounts": accounts }));
        } else {
            session
                .formatter
                .success(&format!("cloudmirror status - {} account(s)", rows.len()));
            session.formatter.info(&format!(
                "Sync root: {}  Database: {}",
                session.config.sync.sync_folder_name,
                session.config.sync.database.display()
            ));
            session.formatter.info("");
            session.formatter.info(&format!(
                "{:<32} {:<6} {:>21} {:>6} {:>8} {:>10} {:>6} {:>6}",
                "Account", "Role", "Used / Total", "Usage", "Active", "Bytes", "Trash", "Frag"
            ));
            for row in &rows {
                session.formatter.info(&row.to_line());
            }
        }
        Ok(exit_status(failed))
    }
}

struct Row<'a> {
    key: &'a AccountKey,
    is_main: bool,
    quota: Option<Quota>,
    stored: Option<&'a AccountStorageSummary>,
}

impl Row<'_> {
    fn role(&self) -> &'static str {
        if self.is_main {
            "main"
        } else {
            "backup"
        }
    }

    fn to_line(&self) -> String {
        let (usage, ratio) = match self.quota {
            Some(q) => (
                format!("{} / {}", format_bytes(q.used), format_bytes(q.total)),
                format!("{:.0}%", q.usage_ratio() * 100.0),
            ),
            None => ("?".to_string(), "?".to_string()),
        };
        let (active, bytes, trashed, fragmented) = match self.stored {
            Some(s) => (
                s.active_replicas,
                s.active_bytes,
                s.soft_deleted_replicas,
                s.fragmented_replicas,
            ),
            None => (0, 0, 0, 0),
        };
        format!(
            "{:<32} {:<6} {:>21} {:>6} {:>8} {:>10} {:>6} {:>6}",
            self.key.to_string(),
            self.role(),
            usage,
            ratio,
            active,
            format_bytes(bytes),
            trashed,
            fragmented
        )
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "account": self.key.to_string(),
            "role": self.role(),
            "quota": self.quota.map(|q| serde_json::json!({
                "total": q.total,
                "used": q.used,
                "free": q.free(),
                "usage_ratio": q.usage_ratio(),
            })),
            "stored": self.stored,
        })
    }
}
