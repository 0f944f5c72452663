//! File entity: the logical file that may be replicated across accounts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::{CalculatedId, FileId, LogicalPath};
use super::status::EntryStatus;

/// A logical file, independent of where its bytes are stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub id: FileId,
    pub path: LogicalPath,
    pub name: String,
    pub size: u64,
    pub calculated_id: CalculatedId,
    pub mod_time: DateTime<Utc>,
    pub status: EntryStatus,
}

impl File {
    /// Create a new active File; name and calculated id derive from the path
    #[must_use]
    pub fn new(path: LogicalPath, size: u64, mod_time: DateTime<Utc>) -> Self {
        let name = path.file_name().to_string();
        let calculated_id = CalculatedId::from_parts(&name, size);
        Self {
            id: FileId::new(),
            path,
            name,
            size,
            calculated_id,
            mod_time,
            status: EntryStatus::Active,
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_file_derives_identity() {
        let path = LogicalPath::new("docs/report.txt").unwrap();
        let file = File::new(path, 500, Utc::now());
        assert_eq!(file.name, "report.txt");
        assert_eq!(file.calculated_id.as_str(), "report.txt500");
        assert!(file.is_active());
    }
}
