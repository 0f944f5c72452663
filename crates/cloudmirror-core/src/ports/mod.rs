//! Port definitions (hexagonal architecture interfaces)
//!
//! Ports are the interfaces the reconciliation core depends on; their
//! implementations live in adapter crates.
//!
//! ## Ports Overview
//!
//! - [`ICloudClient`] - One account's cloud storage
//! - [`IMetadataStore`] - Persistent replica index
//! - [`ProviderRegistry`] - Configured accounts and provider capabilities

pub mod cloud_client;
pub mod metadata_store;
pub mod registry;

pub use cloud_client::{
    ByteStream, CloudError, ICloudClient, Quota, RemoteFile, RemoteFolder, ShareRole,
    TransferOutcome, UserIdentity,
};
pub use metadata_store::{
    AccountStorageSummary, DuplicateCandidate, DuplicateGroup, FileFilter, IMetadataStore,
    ScanBatch,
};
pub use registry::{AccountEntry, ProviderCapabilities, ProviderRegistry};
