//! Fixtures shared by the engine tests
//!
//! A [`World`] wires in-memory clouds and an in-memory SQLite store into a
//! [`ReconcileContext`].

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, TimeZone, Utc};

use cloudmirror_cache::{DatabasePool, SqliteMetadataStore};
use cloudmirror_core::domain::{AccountId, AccountKey, File, LogicalPath, ProviderId, Replica};
use cloudmirror_core::ports::{
    FileFilter, ICloudClient, IMetadataStore, ProviderCapabilities, ProviderRegistry,
};
use cloudmirror_core::retry::RetryPolicy;
use cloudmirror_providers::MemoryCloud;
use cloudmirror_sync::{EngineSettings, ReconcileContext};

pub const SYNC_FOLDER: &str = "cloudmirror";
pub const TRASH_FOLDER: &str = ".cloudmirror-trash";

/// Retries that finish within a test's patience
pub fn quick_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay: StdDuration::from_millis(1),
        max_delay: StdDuration::from_millis(5),
    }
}

pub fn acct(account: &str) -> AccountId {
    AccountId::new(account).unwrap()
}

pub fn key(provider: &str, account: &str) -> AccountKey {
    AccountKey::parse(provider, account).unwrap()
}

pub fn path(p: &str) -> LogicalPath {
    LogicalPath::new(p).unwrap()
}

/// A fixed point in time, `minutes` before noon on 2024-01-01
pub fn at(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap() - Duration::minutes(minutes)
}

/// Deterministic content of `len` bytes
pub fn content(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

pub fn fragmenting(max_object_size: u64) -> ProviderCapabilities {
    ProviderCapabilities {
        max_object_size: Some(max_object_size),
        supports_ownership_transfer: false,
    }
}

pub fn transferable() -> ProviderCapabilities {
    ProviderCapabilities {
        max_object_size: None,
        supports_ownership_transfer: true,
    }
}

pub struct World {
    clouds: BTreeMap<String, Arc<MemoryCloud>>,
    registry: ProviderRegistry,
    settings: EngineSettings,
}

impl World {
    pub fn new() -> Self {
        let mut settings = EngineSettings::default();
        settings.sync_folder_name = SYNC_FOLDER.to_string();
        settings.soft_deleted_folder_name = TRASH_FOLDER.to_string();
        settings.retry = quick_retry(3);
        Self {
            clouds: BTreeMap::new(),
            registry: ProviderRegistry::new(),
            settings,
        }
    }

    /// Declare a provider; `configure` adjusts its cloud before use
    pub fn provider(
        mut self,
        name: &str,
        configure: impl FnOnce(MemoryCloud) -> MemoryCloud,
        capabilities: ProviderCapabilities,
    ) -> Self {
        let provider = ProviderId::new(name).unwrap();
        let cloud = configure(MemoryCloud::new(provider.clone(), SYNC_FOLDER));
        self.clouds.insert(name.to_string(), Arc::new(cloud));
        self.registry.set_capabilities(provider, capabilities);
        self
    }

    pub fn account(mut self, provider: &str, account: &str, is_main: bool, quota: u64) -> Self {
        let cloud = &self.clouds[provider];
        let client = cloud.add_account(acct(account), quota);
        self.registry.register(client, is_main);
        self
    }

    pub fn settings(mut self, adjust: impl FnOnce(&mut EngineSettings)) -> Self {
        adjust(&mut self.settings);
        self
    }

    pub async fn build(self) -> Harness {
        let pool = DatabasePool::in_memory()
            .await
            .expect("Failed to create in-memory database");
        let store: Arc<dyn IMetadataStore> = Arc::new(SqliteMetadataStore::new(pool.pool().clone()));
        let ctx = ReconcileContext::new(store.clone(), Arc::new(self.registry), self.settings);
        Harness {
            clouds: self.clouds,
            store,
            ctx,
        }
    }
}

pub struct Harness {
    pub clouds: BTreeMap<String, Arc<MemoryCloud>>,
    pub store: Arc<dyn IMetadataStore>,
    pub ctx: ReconcileContext,
}

impl Harness {
    pub fn cloud(&self, provider: &str) -> &Arc<MemoryCloud> {
        &self.clouds[provider]
    }

    pub fn client(&self, provider: &str, account: &str) -> Arc<dyn ICloudClient> {
        self.ctx.client(&key(provider, account)).unwrap()
    }

    pub fn dry_run(&self) -> ReconcileContext {
        self.ctx.clone().with_dry_run(true)
    }

    pub fn clear_mutations(&self) {
        for cloud in self.clouds.values() {
            cloud.clear_mutations();
        }
    }

    pub fn mutation_count(&self) -> usize {
        self.clouds.values().map(|c| c.mutations().len()).sum()
    }

    /// Every File with its replicas, in a stable order
    pub async fn snapshot(&self) -> Vec<(File, Vec<Replica>)> {
        let mut files = self.store.list_files(&FileFilter::new()).await.unwrap();
        files.sort_by(|a, b| a.path.cmp(&b.path).then(a.id.cmp(&b.id)));
        let mut out = Vec::new();
        for file in files {
            let mut replicas = self.store.get_replicas_for_file(&file.id).await.unwrap();
            replicas.sort_by(|a, b| a.native_id.cmp(&b.native_id));
            out.push((file, replicas));
        }
        out
    }

    /// The replica of `provider/account` at `p`, if the store knows one
    pub async fn replica_at(&self, provider: &str, account: &str, p: &str) -> Option<Replica> {
        let wanted = path(p).comparison_key();
        self.store
            .get_replicas_by_account(&key(provider, account))
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.path.comparison_key() == wanted)
    }
}
