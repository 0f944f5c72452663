//! Folder entity

use serde::{Deserialize, Serialize};

use super::newtypes::{AccountId, AccountKey, LogicalPath, ProviderId};

/// A directory inside an account's sync root
///
/// The sync root itself is recorded with the root path and no parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    /// Provider-native folder id
    pub id: String,
    pub name: String,
    pub path: LogicalPath,
    pub provider: ProviderId,
    pub owner_account_id: AccountId,
    pub parent_folder_id: Option<String>,
}

impl Folder {
    #[must_use]
    pub fn new(
        account: &AccountKey,
        id: impl Into<String>,
        path: LogicalPath,
        parent_folder_id: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: path.file_name().to_string(),
            path,
            provider: account.provider.clone(),
            owner_account_id: account.account.clone(),
            parent_folder_id,
        }
    }

    #[must_use]
    pub fn account_key(&self) -> AccountKey {
        AccountKey::new(self.provider.clone(), self.owner_account_id.clone())
    }
}
