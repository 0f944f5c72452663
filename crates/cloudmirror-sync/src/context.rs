//! Shared state handed to every engine

use std::sync::Arc;
use std::time::Duration;

use cloudmirror_core::config::Config;
use cloudmirror_core::domain::AccountKey;
use cloudmirror_core::ports::{ICloudClient, IMetadataStore, ProviderRegistry};
use cloudmirror_core::retry::RetryPolicy;

use crate::markers::ScanMarkers;
use crate::ops::MutationGate;
use crate::SyncError;

/// Engine tunables taken from the configuration
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub sync_folder_name: String,
    pub soft_deleted_folder_name: String,
    pub high_watermark: f64,
    pub low_watermark: f64,
    /// Overall limit for balance and evacuation runs
    pub deadline: Duration,
    pub max_parallel_accounts: usize,
    /// Backoff for uploads, which are replayed from a fresh read of the source
    pub retry: RetryPolicy,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            sync_folder_name: config.sync.sync_folder_name.clone(),
            soft_deleted_folder_name: config.sync.soft_deleted_folder_name.clone(),
            high_watermark: config.balance.high_watermark,
            low_watermark: config.balance.low_watermark,
            deadline: Duration::from_secs(config.balance.deadline_hours.saturating_mul(3600)),
            max_parallel_accounts: config.concurrency.max_parallel_accounts.max(1),
            retry: RetryPolicy::from_config(&config.retry),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Store, clients and run mode for one command
///
/// Cheap to clone; every engine keeps its own copy.
#[derive(Clone)]
pub struct ReconcileContext {
    pub store: Arc<dyn IMetadataStore>,
    pub registry: Arc<ProviderRegistry>,
    pub settings: EngineSettings,
    pub gate: MutationGate,
    pub markers: ScanMarkers,
}

impl ReconcileContext {
    pub fn new(
        store: Arc<dyn IMetadataStore>,
        registry: Arc<ProviderRegistry>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            registry,
            settings,
            gate: MutationGate::new(false),
            markers: ScanMarkers::new(),
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.gate = MutationGate::new(dry_run);
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.gate.is_dry_run()
    }

    pub fn client(&self, account: &AccountKey) -> Result<Arc<dyn ICloudClient>, SyncError> {
        self.registry
            .get(account)
            .map(|entry| Arc::clone(&entry.client))
            .ok_or_else(|| SyncError::UnknownAccount(account.clone()))
    }
}
