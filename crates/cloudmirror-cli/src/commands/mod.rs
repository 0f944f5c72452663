//! Command implementations and the wiring they share

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::info;

use cloudmirror_cache::{DatabasePool, SqliteMetadataStore};
use cloudmirror_core::config::Config;
use cloudmirror_core::ports::IMetadataStore;
use cloudmirror_providers::build_backends;
use cloudmirror_sync::{
    BatchReport, EngineSettings, ItemFailure, Outcome, PlannedAction, ReconcileContext, ScanReport,
};

use crate::output::{get_formatter, OutputFormat, OutputFormatter};

pub mod balance;
pub mod dedup;
pub mod metadata;
pub mod status;
pub mod sync;

/// Flags accepted by every command
#[derive(Debug, Clone)]
pub struct GlobalOptions {
    pub config: Option<PathBuf>,
    pub format: OutputFormat,
    pub quiet: bool,
    pub dry_run: bool,
}

/// Configuration, store and clients for one invocation
pub struct Session {
    pub config: Config,
    pub ctx: ReconcileContext,
    pub format: OutputFormat,
    pub formatter: Box<dyn OutputFormatter>,
}

impl Session {
    /// Load and validate the configuration, open the store and register
    /// every account
    pub async fn open(options: &GlobalOptions) -> Result<Self> {
        let formatter = get_formatter(options.format, options.quiet);
        let config = load_config(options.config.as_deref())?;

        let problems = config.validate();
        if !problems.is_empty() {
            let listed: Vec<String> = problems.iter().map(ToString::to_string).collect();
            bail!("invalid configuration:\n  {}", listed.join("\n  "));
        }
        if config.accounts.is_empty() {
            bail!("no accounts configured");
        }

        let pool = DatabasePool::new(&config.sync.database)
            .await
            .context("Failed to open metadata database")?;
        let store: Arc<dyn IMetadataStore> =
            Arc::new(SqliteMetadataStore::new(pool.pool().clone()));
        let backends = build_backends(&config)
            .await
            .context("Failed to set up accounts")?;

        let ctx = ReconcileContext::new(
            store,
            Arc::new(backends.registry),
            EngineSettings::from_config(&config),
        )
        .with_dry_run(options.dry_run);

        if options.dry_run {
            formatter.info("Dry run: no remote storage will be changed");
        }

        Ok(Self {
            config,
            ctx,
            format: options.format,
            formatter,
        })
    }

    pub fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Print a command's outcome and turn it into the exit status
    ///
    /// `summary` renders the pass-specific part in human mode.
    pub fn finish<R>(&self, outcome: &Outcome<R>, summary: impl FnOnce(&R)) -> Result<ExitCode>
    where
        R: BatchReport + Serialize,
    {
        if self.is_json() {
            self.formatter.print_json(&serde_json::to_value(outcome)?);
        } else {
            print_scan(&*self.formatter, &outcome.scan);
            summary(&outcome.report);
            print_failures(&*self.formatter, outcome.report.failures());
        }
        Ok(exit_status(outcome.has_failures()))
    }

    pub fn print_actions(&self, actions: &[PlannedAction]) {
        let prefix = if self.ctx.is_dry_run() {
            "would "
        } else {
            ""
        };
        for action in actions {
            self.formatter.info(&format!("  {prefix}{action}"));
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => {
            let config = Config::load(path)
                .with_context(|| format!("Failed to load configuration {}", path.display()))?;
            info!(config_path = %path.display(), "Loaded configuration");
            Ok(config)
        }
        None => {
            let path = Config::default_path();
            info!(config_path = %path.display(), "Loaded configuration");
            Ok(Config::load_or_default(&path))
        }
    }
}

pub fn exit_status(failed: bool) -> ExitCode {
    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

pub fn print_scan(formatter: &dyn OutputFormatter, scan: &ScanReport) {
    for account in &scan.accounts {
        formatter.info(&format!(
            "{}: {} objects, {} new, {} updated, {} hashed",
            account.account,
            account.objects,
            account.new_replicas,
            account.updated_replicas,
            account.hashed
        ));
        print_failures(formatter, &account.failures);
    }
    print_failures(formatter, &scan.failures);
}

pub fn print_failures(formatter: &dyn OutputFormatter, failures: &[ItemFailure]) {
    for failure in failures {
        formatter.error(&format!("{}: {}", failure.item, failure.error));
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1} GiB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MiB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KiB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
