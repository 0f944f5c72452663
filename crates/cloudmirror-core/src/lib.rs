//! cloudmirror core - domain model and ports
//!
//! This crate contains the hexagonal architecture core with:
//! - **Domain entities** - `File`, `Replica`, `ReplicaFragment`, `Folder`
//! - **Port definitions** - `ICloudClient`, `IMetadataStore`, `ProviderRegistry`
//! - **Configuration** - YAML config with validation
//! - **Retry policy** - backoff shared by clients and engines
//!
//! # Architecture
//!
//! The domain module contains pure data types with no I/O. Ports define
//! trait interfaces that adapter crates implement; the sync crate drives
//! the reconciliation logic through them.

pub mod config;
pub mod domain;
pub mod ports;
pub mod retry;
