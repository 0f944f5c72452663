//! cloudmirror CLI
//!
//! Provides commands for:
//! - Refreshing metadata of every configured account
//! - Mirroring files across providers
//! - Removing duplicates within a provider
//! - Balancing storage and evacuating main accounts
//! - Showing per-account usage

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use cloudmirror_core::config::Config;
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

use commands::{
    balance::{BalanceStorageCommand, FreeMainCommand},
    dedup::RemoveDuplicatesCommand,
    metadata::GetMetadataCommand,
    status::StatusCommand,
    sync::SyncProvidersCommand,
    GlobalOptions,
};
use output::OutputFormat;

#[derive(Debug, Parser)]
#[command(
    name = "cloudmirror",
    version,
    about = "Mirror, deduplicate and balance files across cloud storage accounts"
)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Verbose output (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Use alternate config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Show what would be done without changing any remote storage
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Scan every configured account and refresh the metadata store
    GetMetadata(GetMetadataCommand),
    /// Copy every file to every provider that lacks it
    SyncProviders(SyncProvidersCommand),
    /// Remove duplicate files within a provider
    RemoveDuplicates(RemoveDuplicatesCommand),
    /// Move files off accounts that are nearly full
    BalanceStorage(BalanceStorageCommand),
    /// Move everything off the main accounts onto their backups
    FreeMain(FreeMainCommand),
    /// Show per-account quota and store summary
    Status(StatusCommand),
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let configured = configured_level(cli.config.as_deref());
    let directive = default_directive(cli.quiet, cli.verbose, configured.as_deref());
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if cli.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    let options = GlobalOptions {
        config: cli.config,
        format: if cli.json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        },
        quiet: cli.quiet,
        dry_run: cli.dry_run,
    };

    match cli.command {
        Commands::GetMetadata(cmd) => cmd.execute(&options).await,
        Commands::SyncProviders(cmd) => cmd.execute(&options).await,
        Commands::RemoveDuplicates(cmd) => cmd.execute(&options).await,
        Commands::BalanceStorage(cmd) => cmd.execute(&options).await,
        Commands::FreeMain(cmd) => cmd.execute(&options).await,
        Commands::Status(cmd) => cmd.execute(&options).await,
    }
}

/// `logging.level` from the configuration file, when one can be read
fn configured_level(path: Option<&Path>) -> Option<String> {
    let path = path.map_or_else(Config::default_path, Path::to_path_buf);
    Config::load(&path).ok().map(|config| config.logging.level)
}

/// Filter used when `RUST_LOG` is unset: flags first, then the configured
/// level
fn default_directive<'a>(quiet: bool, verbose: u8, configured: Option<&'a str>) -> &'a str {
    match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => configured.unwrap_or("info"),
        (false, 1) => "debug",
        _ => "trace",
    }
}
