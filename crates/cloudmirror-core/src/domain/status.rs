//! Lifecycle status shared by Files and Replicas

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::errors::DomainError;

/// Presence of a file or replica in the cloud
///
/// Ordered by severity: `Active < SoftDeleted < Deleted`. A File takes the
/// least severe status among its Replicas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    #[default]
    Active,
    /// Sitting in the account's trash folder and still recoverable
    SoftDeleted,
    Deleted,
}

impl EntryStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::SoftDeleted => "soft_deleted",
            Self::Deleted => "deleted",
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Status of a File given the statuses of its Replicas
    ///
    /// A File with no Replicas at all is considered deleted.
    pub fn aggregate(statuses: impl IntoIterator<Item = EntryStatus>) -> EntryStatus {
        statuses.into_iter().min().unwrap_or(EntryStatus::Deleted)
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "soft_deleted" => Ok(Self::SoftDeleted),
            "deleted" => Ok(Self::Deleted),
            other => Err(DomainError::InvalidStatus(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_takes_least_severe() {
        use EntryStatus::*;
        assert_eq!(EntryStatus::aggregate([Deleted, SoftDeleted]), SoftDeleted);
        assert_eq!(EntryStatus::aggregate([Deleted, Active, SoftDeleted]), Active);
        assert_eq!(EntryStatus::aggregate([Deleted]), Deleted);
        assert_eq!(EntryStatus::aggregate([]), Deleted);
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in [EntryStatus::Active, EntryStatus::SoftDeleted, EntryStatus::Deleted] {
            assert_eq!(status.as_str().parse::<EntryStatus>().unwrap(), status);
        }
        assert!("gone".parse::<EntryStatus>().is_err());
    }
}
