//! Domain entities
//!
//! - Newtypes for identifiers, paths and content hashes
//! - `File`, `Replica`, `ReplicaFragment` and `Folder` entities
//! - The shared `EntryStatus` lifecycle
//! - Domain-specific error types

pub mod errors;
pub mod file;
pub mod folder;
pub mod newtypes;
pub mod replica;
pub mod status;

pub use errors::DomainError;
pub use file::File;
pub use folder::Folder;
pub use newtypes::*;
pub use replica::{Replica, ReplicaFragment};
pub use status::EntryStatus;
