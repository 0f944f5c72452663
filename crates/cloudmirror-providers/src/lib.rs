//! Cloud client backends for cloudmirror
//!
//! This crate implements the [`ICloudClient`](cloudmirror_core::ports::ICloudClient)
//! port:
//!
//! - [`RetryingClient`] wraps any client with exponential backoff
//! - [`LocalDirClient`] stores each account in a local directory tree
//! - [`MemoryCloud`] keeps a whole provider in memory, for demos and tests
//! - [`build_backends`] turns the configuration into a
//!   [`ProviderRegistry`](cloudmirror_core::ports::ProviderRegistry)

pub mod factory;
pub mod local;
pub mod memory;
pub mod retry;

use cloudmirror_core::config::ProviderConfig;

pub use factory::{build_backends, Backends};
pub use local::LocalDirClient;
pub use memory::{MemoryClient, MemoryCloud, Mutation, Operation};
pub use retry::{RetryPolicy, RetryingClient};

/// How a backend handles ownership transfer requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    /// Transfers fail with `Unsupported`
    #[default]
    Unsupported,
    /// The receiving account owns the object right away
    Immediate,
    /// The receiving account has to accept first
    RequiresConsent,
}

impl TransferMode {
    pub fn from_provider(config: &ProviderConfig) -> Self {
        match (
            config.supports_ownership_transfer,
            config.requires_transfer_consent,
        ) {
            (false, _) => Self::Unsupported,
            (true, false) => Self::Immediate,
            (true, true) => Self::RequiresConsent,
        }
    }
}
