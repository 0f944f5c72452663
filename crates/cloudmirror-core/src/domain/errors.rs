//! Domain error types
//!
//! Validation failures raised while constructing identifiers, paths,
//! hashes and statuses.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid logical path
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Invalid provider identifier
    #[error("Invalid provider: {0}")]
    InvalidProvider(String),

    /// Invalid account identifier
    #[error("Invalid account: {0}")]
    InvalidAccount(String),

    /// Invalid or unsupported content hash
    #[error("Invalid hash format: {0}")]
    InvalidHash(String),

    /// Unknown status string
    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// ID parsing error
    #[error("Invalid ID format: {0}")]
    InvalidId(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DomainError::InvalidPath("../etc".to_string());
        assert_eq!(err.to_string(), "Invalid path: ../etc");

        let err = DomainError::InvalidHash("crc32:abc".to_string());
        assert_eq!(err.to_string(), "Invalid hash format: crc32:abc");
    }

    #[test]
    fn test_error_equality() {
        assert_eq!(
            DomainError::InvalidStatus("gone".into()),
            DomainError::InvalidStatus("gone".into())
        );
        assert_ne!(
            DomainError::InvalidProvider("x".into()),
            DomainError::InvalidAccount("x".into())
        );
    }
}
