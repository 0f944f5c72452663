//! Build the account registry from configuration

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use cloudmirror_core::config::{BackendConfig, Config};
use cloudmirror_core::domain::{HashAlgorithm, ProviderId};
use cloudmirror_core::ports::{ICloudClient, ProviderRegistry};

use crate::local::LocalDirClient;
use crate::memory::MemoryCloud;
use crate::retry::{RetryPolicy, RetryingClient};
use crate::TransferMode;

/// Registry plus handles on the in-memory clouds it created
pub struct Backends {
    pub registry: ProviderRegistry,
    pub memory: BTreeMap<ProviderId, Arc<MemoryCloud>>,
}

/// Create one retrying client per configured account
///
/// Local backends get their account directory and sync root provisioned.
/// Accounts of the same provider that use the memory backend share one
/// [`MemoryCloud`].
pub async fn build_backends(config: &Config) -> anyhow::Result<Backends> {
    let policy = RetryPolicy::from_config(&config.retry);
    let mut registry = ProviderRegistry::new();
    let mut memory: BTreeMap<ProviderId, Arc<MemoryCloud>> = BTreeMap::new();

    for account in &config.accounts {
        let key = account
            .key()
            .with_context(|| format!("invalid account '{}'", account.account_id))?;
        let provider_config = config.provider(&key.provider);
        let transfer = TransferMode::from_provider(&provider_config);

        let client: Arc<dyn ICloudClient> = match &account.backend {
            BackendConfig::Local { root, quota_bytes } => {
                let client = LocalDirClient::new(
                    key.clone(),
                    root.clone(),
                    config.sync.sync_folder_name.clone(),
                    *quota_bytes,
                )
                .with_transfer(transfer);
                client
                    .provision()
                    .await
                    .with_context(|| format!("failed to provision {key}"))?;
                Arc::new(client)
            }
            BackendConfig::Memory { quota_bytes } => {
                let cloud = match memory.get(&key.provider) {
                    Some(cloud) => Arc::clone(cloud),
                    None => {
                        let mut cloud = MemoryCloud::new(
                            key.provider.clone(),
                            config.sync.sync_folder_name.clone(),
                        )
                        .with_transfer(transfer);
                        if provider_config.hash_algorithm()? == Some(HashAlgorithm::Sha256) {
                            cloud = cloud.with_native_sha256();
                        }
                        let cloud = Arc::new(cloud);
                        memory.insert(key.provider.clone(), Arc::clone(&cloud));
                        cloud
                    }
                };
                cloud.add_account(key.account.clone(), *quota_bytes)
            }
        };

        info!(account = %key, main = account.is_main, "Registered account");
        registry.register(
            Arc::new(RetryingClient::new(client, policy.clone())),
            account.is_main,
        );
    }

    for provider in registry.providers() {
        registry.set_capabilities(provider.clone(), config.provider(&provider).capabilities());
    }

    Ok(Backends { registry, memory })
}
