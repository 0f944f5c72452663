//! Configuration module for cloudmirror.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::{AccountKey, DomainError, HashAlgorithm, ProviderId};
use crate::ports::ProviderCapabilities;

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for cloudmirror.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub accounts: Vec<AccountConfig>,
    /// Per-provider settings keyed by provider name.
    pub providers: BTreeMap<String, ProviderConfig>,
    pub sync: SyncConfig,
    pub balance: BalanceConfig,
    pub retry: RetryConfig,
    pub concurrency: ConcurrencyConfig,
    pub logging: LoggingConfig,
}

/// One storage account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub provider: String,
    /// Email address or phone number identifying the account.
    pub account_id: String,
    #[serde(default)]
    pub is_main: bool,
    /// Opaque handle used by the credential subsystem; never read by the core.
    #[serde(default)]
    pub credentials_handle: Option<String>,
    pub backend: BackendConfig,
}

impl AccountConfig {
    /// Validated (provider, account) key.
    pub fn key(&self) -> Result<AccountKey, DomainError> {
        AccountKey::parse(&self.provider, &self.account_id)
    }
}

/// Storage backend behind an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Directory tree at `<root>/<provider>/<account_id>`.
    Local { root: PathBuf, quota_bytes: u64 },
    /// Volatile in-process storage.
    Memory { quota_bytes: u64 },
}

impl BackendConfig {
    pub fn quota_bytes(&self) -> u64 {
        match self {
            Self::Local { quota_bytes, .. } | Self::Memory { quota_bytes } => *quota_bytes,
        }
    }
}

/// Provider family settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Largest object the provider accepts, in bytes. Larger files are fragmented.
    pub max_object_size: Option<u64>,
    pub supports_ownership_transfer: bool,
    /// Ownership transfers wait for the receiving account to accept.
    pub requires_transfer_consent: bool,
    /// Digest the provider reports natively (`sha256`, `md5`, `sha1`, `quickxor`).
    pub hash_algorithm: Option<String>,
}

impl ProviderConfig {
    pub fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            max_object_size: self.max_object_size,
            supports_ownership_transfer: self.supports_ownership_transfer,
        }
    }

    pub fn hash_algorithm(&self) -> Result<Option<HashAlgorithm>, DomainError> {
        self.hash_algorithm.as_deref().map(str::parse).transpose()
    }
}

/// Sync root naming and metadata database location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Name of the top-level folder that holds managed files in every account.
    pub sync_folder_name: String,
    /// Trash folder inside the sync root; items there are soft-deleted.
    pub soft_deleted_folder_name: String,
    /// Path to the SQLite metadata database.
    pub database: PathBuf,
}

/// Storage balancing thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalanceConfig {
    /// Usage ratio above which an account is rebalanced.
    pub high_watermark: f64,
    /// Usage ratio balancing aims to get below.
    pub low_watermark: f64,
    /// Upper bound for a single balance or evacuation run.
    pub deadline_hours: u64,
}

/// Backoff for transient provider failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

/// Cross-account parallelism.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub max_parallel_accounts: usize,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/cloudmirror/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("cloudmirror")
            .join("config.yaml")
    }

    /// Settings for `provider`, or the defaults when the provider has no entry.
    pub fn provider(&self, provider: &ProviderId) -> ProviderConfig {
        self.providers
            .get(provider.as_str())
            .cloned()
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_folder_name: "cloudmirror".to_string(),
            soft_deleted_folder_name: ".cloudmirror-trash".to_string(),
            database: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("~/.local/share"))
                .join("cloudmirror")
                .join("metadata.db"),
        }
    }
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            high_watermark: 0.95,
            low_watermark: 0.90,
            deadline_hours: 6,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
        }
    }
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_parallel_accounts: 4,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"balance.low_watermark"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- accounts ---
        let mut seen: HashSet<AccountKey> = HashSet::new();
        let mut mains: HashMap<ProviderId, usize> = HashMap::new();
        for (idx, account) in self.accounts.iter().enumerate() {
            let field = format!("accounts[{idx}]");
            match account.key() {
                Ok(key) => {
                    if account.is_main {
                        *mains.entry(key.provider.clone()).or_default() += 1;
                    }
                    if !seen.insert(key.clone()) {
                        errors.push(ValidationError {
                            field: field.clone(),
                            message: format!("duplicate account {key}"),
                        });
                    }
                }
                Err(e) => errors.push(ValidationError {
                    field: field.clone(),
                    message: e.to_string(),
                }),
            }
            if account.backend.quota_bytes() == 0 {
                errors.push(ValidationError {
                    field: format!("{field}.backend.quota_bytes"),
                    message: "must be greater than 0".into(),
                });
            }
        }
        let mut over: Vec<_> = mains.into_iter().filter(|(_, n)| *n > 1).collect();
        over.sort();
        for (provider, count) in over {
            errors.push(ValidationError {
                field: "accounts".into(),
                message: format!("provider '{provider}' has {count} main accounts; at most one allowed"),
            });
        }

        // --- providers ---
        for (name, provider) in &self.providers {
            if let Err(e) = ProviderId::new(name) {
                errors.push(ValidationError {
                    field: format!("providers.{name}"),
                    message: e.to_string(),
                });
            }
            if provider.max_object_size == Some(0) {
                errors.push(ValidationError {
                    field: format!("providers.{name}.max_object_size"),
                    message: "must be greater than 0".into(),
                });
            }
            if let Err(e) = provider.hash_algorithm() {
                errors.push(ValidationError {
                    field: format!("providers.{name}.hash_algorithm"),
                    message: e.to_string(),
                });
            }
        }

        // --- sync ---
        if self.sync.sync_folder_name.trim().is_empty() {
            errors.push(ValidationError {
                field: "sync.sync_folder_name".into(),
                message: "must not be empty".into(),
            });
        }
        if self.sync.soft_deleted_folder_name.trim().is_empty() {
            errors.push(ValidationError {
                field: "sync.soft_deleted_folder_name".into(),
                message: "must not be empty".into(),
            });
        }

        // --- balance ---
        let b = &self.balance;
        if !(b.high_watermark > 0.0 && b.high_watermark <= 1.0) {
            errors.push(ValidationError {
                field: "balance.high_watermark".into(),
                message: "must be in range (0, 1]".into(),
            });
        }
        if !(b.low_watermark > 0.0 && b.low_watermark <= 1.0) {
            errors.push(ValidationError {
                field: "balance.low_watermark".into(),
                message: "must be in range (0, 1]".into(),
            });
        }
        if b.low_watermark >= b.high_watermark {
            errors.push(ValidationError {
                field: "balance.low_watermark".into(),
                message: format!(
                    "low_watermark ({}) must be below high_watermark ({})",
                    b.low_watermark, b.high_watermark
                ),
            });
        }
        if b.deadline_hours == 0 {
            errors.push(ValidationError {
                field: "balance.deadline_hours".into(),
                message: "must be greater than 0".into(),
            });
        }

        // --- retry ---
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            errors.push(ValidationError {
                field: "retry.base_delay_ms".into(),
                message: format!(
                    "base_delay_ms ({}) must not exceed max_delay_ms ({})",
                    self.retry.base_delay_ms, self.retry.max_delay_ms
                ),
            });
        }

        // --- concurrency ---
        if self.concurrency.max_parallel_accounts == 0 {
            errors.push(ValidationError {
                field: "concurrency.max_parallel_accounts".into(),
                message: "must be greater than 0".into(),
            });
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust,no_run
/// use cloudmirror_core::config::{BackendConfig, ConfigBuilder};
///
/// let config = ConfigBuilder::new()
///     .account("google", "me@gmail.com", true, BackendConfig::Memory { quota_bytes: 1 << 30 })
///     .sync_folder_name("mirror")
///     .logging_level("debug")
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- accounts / providers ---

    pub fn account(
        mut self,
        provider: impl Into<String>,
        account_id: impl Into<String>,
        is_main: bool,
        backend: BackendConfig,
    ) -> Self {
        self.config.accounts.push(AccountConfig {
            provider: provider.into(),
            account_id: account_id.into(),
            is_main,
            credentials_handle: None,
            backend,
        });
        self
    }

    pub fn provider(mut self, name: impl Into<String>, provider: ProviderConfig) -> Self {
        self.config.providers.insert(name.into(), provider);
        self
    }

    // --- sync ---

    pub fn sync_folder_name(mut self, name: impl Into<String>) -> Self {
        self.config.sync.sync_folder_name = name.into();
        self
    }

    pub fn soft_deleted_folder_name(mut self, name: impl Into<String>) -> Self {
        self.config.sync.soft_deleted_folder_name = name.into();
        self
    }

    pub fn database(mut self, path: PathBuf) -> Self {
        self.config.sync.database = path;
        self
    }

    // --- balance ---

    pub fn watermarks(mut self, high: f64, low: f64) -> Self {
        self.config.balance.high_watermark = high;
        self.config.balance.low_watermark = low;
        self
    }

    pub fn deadline_hours(mut self, hours: u64) -> Self {
        self.config.balance.deadline_hours = hours;
        self
    }

    // --- retry / concurrency ---

    pub fn retry(mut self, max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        self.config.retry = RetryConfig {
            max_retries,
            base_delay_ms,
            max_delay_ms,
        };
        self
    }

    pub fn max_parallel_accounts(mut self, n: usize) -> Self {
        self.config.concurrency.max_parallel_accounts = n;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
