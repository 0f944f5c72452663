//! Registry of configured accounts and their cloud clients
//!
//! Iteration order is deterministic (sorted by provider, then account) so
//! that planning decisions do not depend on hash ordering.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::cloud_client::ICloudClient;
use crate::domain::{AccountKey, ProviderId};

/// What a provider family can do
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    /// Largest single object the provider accepts; `None` means unlimited
    pub max_object_size: Option<u64>,
    pub supports_ownership_transfer: bool,
}

/// One configured account
#[derive(Clone)]
pub struct AccountEntry {
    pub key: AccountKey,
    pub is_main: bool,
    pub client: Arc<dyn ICloudClient>,
}

impl std::fmt::Debug for AccountEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountEntry")
            .field("key", &self.key)
            .field("is_main", &self.is_main)
            .finish_non_exhaustive()
    }
}

/// All accounts known to this run
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    accounts: BTreeMap<AccountKey, AccountEntry>,
    capabilities: BTreeMap<ProviderId, ProviderCapabilities>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an account; a later registration for the same key wins
    pub fn register(&mut self, client: Arc<dyn ICloudClient>, is_main: bool) {
        let key = client.account().clone();
        self.accounts.insert(
            key.clone(),
            AccountEntry {
                key,
                is_main,
                client,
            },
        );
    }

    pub fn set_capabilities(&mut self, provider: ProviderId, capabilities: ProviderCapabilities) {
        self.capabilities.insert(provider, capabilities);
    }

    /// Capabilities of a provider; unconfigured providers get the defaults
    pub fn capabilities(&self, provider: &ProviderId) -> ProviderCapabilities {
        self.capabilities.get(provider).cloned().unwrap_or_default()
    }

    pub fn get(&self, key: &AccountKey) -> Option<&AccountEntry> {
        self.accounts.get(key)
    }

    pub fn accounts(&self) -> impl Iterator<Item = &AccountEntry> {
        self.accounts.values()
    }

    /// Distinct providers in sorted order
    pub fn providers(&self) -> Vec<ProviderId> {
        let mut providers: Vec<ProviderId> =
            self.accounts.keys().map(|k| k.provider.clone()).collect();
        providers.dedup();
        providers
    }

    pub fn accounts_of(&self, provider: &ProviderId) -> Vec<&AccountEntry> {
        self.accounts
            .values()
            .filter(|e| &e.key.provider == provider)
            .collect()
    }

    pub fn main_account(&self, provider: &ProviderId) -> Option<&AccountEntry> {
        self.accounts
            .values()
            .find(|e| &e.key.provider == provider && e.is_main)
    }

    pub fn backups(&self, provider: &ProviderId) -> Vec<&AccountEntry> {
        self.accounts
            .values()
            .filter(|e| &e.key.provider == provider && !e.is_main)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}
