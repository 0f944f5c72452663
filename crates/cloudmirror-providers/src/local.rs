//! Directory-backed cloud client
//!
//! Each account lives in its own directory, `<base>/<provider>/<account>`,
//! and the sync root is a direct child of it. Native ids are paths relative
//! to the account directory with `/` separators, so the account directory
//! itself is the empty id.
//!
//! ## Design Decisions
//!
//! - **Atomic uploads**: content is written to a hidden temp file next to
//!   the target and renamed into place once the byte count checks out.
//! - **No overwrite**: an upload onto an existing name fails; collisions
//!   are resolved by the caller.
//! - **Ownership transfer**: moves the object to the same relative path in
//!   the receiving account's directory, so its native id survives.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use cloudmirror_core::domain::{AccountId, AccountKey, LogicalPath};
use cloudmirror_core::ports::{
    ByteStream, CloudError, ICloudClient, Quota, RemoteFile, RemoteFolder, ShareRole,
    TransferOutcome, UserIdentity,
};

use crate::TransferMode;

/// Suffix of in-flight uploads; such files are never listed
const PARTIAL_SUFFIX: &str = ".cmpart";

/// Cloud client over a local directory tree
#[derive(Debug, Clone)]
pub struct LocalDirClient {
    key: AccountKey,
    base: PathBuf,
    sync_folder_name: String,
    quota: u64,
    transfer: TransferMode,
}

impl LocalDirClient {
    pub fn new(
        key: AccountKey,
        base: impl Into<PathBuf>,
        sync_folder_name: impl Into<String>,
        quota: u64,
    ) -> Self {
        Self {
            key,
            base: base.into(),
            sync_folder_name: sync_folder_name.into(),
            quota,
            transfer: TransferMode::Unsupported,
        }
    }

    pub fn with_transfer(mut self, transfer: TransferMode) -> Self {
        self.transfer = transfer;
        self
    }

    /// Directory of an account of this client's provider
    fn account_dir(&self, account: &AccountId) -> PathBuf {
        self.base
            .join(self.key.provider.as_str())
            .join(account.as_str())
    }

    /// This account's directory
    pub fn root(&self) -> PathBuf {
        self.account_dir(&self.key.account)
    }

    /// Create the account directory and sync root unless a sync root
    /// (in any letter case) is already there
    pub async fn provision(&self) -> Result<(), CloudError> {
        let root = self.root();
        tokio::fs::create_dir_all(&root).await?;
        if self.sync_roots().await?.is_empty() {
            tokio::fs::create_dir(root.join(&self.sync_folder_name)).await?;
            debug!(account = %self.key, "Provisioned sync root");
        }
        Ok(())
    }

    fn resolve(&self, native_id: &str) -> Result<PathBuf, CloudError> {
        let relative = LogicalPath::new(native_id)
            .map_err(|_| CloudError::NotFound(native_id.to_string()))?;
        let mut path = self.root();
        for segment in relative.segments() {
            path.push(segment);
        }
        Ok(path)
    }

    fn child_id(parent_id: &str, name: &str) -> String {
        if parent_id.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", parent_id.trim_end_matches('/'), name)
        }
    }

    fn parent_id(native_id: &str) -> String {
        match native_id.rfind('/') {
            Some(idx) => native_id[..idx].to_string(),
            None => String::new(),
        }
    }

    async fn sync_roots(&self) -> Result<Vec<String>, CloudError> {
        let mut roots = Vec::new();
        let mut entries = match tokio::fs::read_dir(self.root()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(roots),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await?.is_dir() && name.eq_ignore_ascii_case(&self.sync_folder_name)
            {
                roots.push(name);
            }
        }
        roots.sort();
        Ok(roots)
    }

    async fn remote_file(&self, native_id: &str) -> Result<RemoteFile, CloudError> {
        let path = self.resolve(native_id)?;
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(CloudError::NotFound(native_id.to_string()));
        }
        Ok(RemoteFile {
            native_id: native_id.to_string(),
            name: file_name(native_id),
            size: metadata.len(),
            mod_time: metadata.modified().map(to_utc).unwrap_or_else(|_| Utc::now()),
            native_hash: None,
            parent_id: Some(Self::parent_id(native_id)),
        })
    }

    async fn used_bytes(&self) -> Result<u64, CloudError> {
        let mut used = 0;
        let mut pending = vec![self.root()];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let metadata = entry.metadata().await?;
                if metadata.is_dir() {
                    pending.push(entry.path());
                } else {
                    used += metadata.len();
                }
            }
        }
        Ok(used)
    }
}

fn file_name(native_id: &str) -> String {
    native_id.rsplit('/').next().unwrap_or_default().to_string()
}

fn to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}

fn validate_name(name: &str) -> Result<(), CloudError> {
    if LogicalPath::root().join(name).is_err() || name.ends_with(PARTIAL_SUFFIX) {
        return Err(CloudError::Other(format!("invalid object name '{name}'")));
    }
    Ok(())
}

async fn exists(path: &Path) -> Result<bool, CloudError> {
    match tokio::fs::metadata(path).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ICloudClient for LocalDirClient {
    fn account(&self) -> &AccountKey {
        &self.key
    }

    #[instrument(skip(self))]
    async fn pre_flight_check(&self) -> Result<String, CloudError> {
        if !exists(&self.root()).await? {
            return Err(CloudError::NotFound(format!(
                "account directory {}",
                self.root().display()
            )));
        }
        let mut roots = self.sync_roots().await?;
        match roots.len() {
            0 => Err(CloudError::SyncRootMissing(self.sync_folder_name.clone())),
            1 => Ok(roots.remove(0)),
            count => Err(CloudError::AmbiguousSyncRoot {
                name: self.sync_folder_name.clone(),
                count,
            }),
        }
    }

    async fn get_sync_folder_id(&self) -> Result<String, CloudError> {
        self.sync_roots()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| CloudError::SyncRootMissing(self.sync_folder_name.clone()))
    }

    async fn list_folders(&self, parent_id: &str) -> Result<Vec<RemoteFolder>, CloudError> {
        let mut entries = tokio::fs::read_dir(self.resolve(parent_id)?).await?;
        let mut folders = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            folders.push(RemoteFolder {
                native_id: Self::child_id(parent_id, &name),
                name,
                parent_id: Some(parent_id.to_string()),
            });
        }
        folders.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(folders)
    }

    async fn list_files(&self, folder_id: &str) -> Result<Vec<RemoteFile>, CloudError> {
        let mut entries = tokio::fs::read_dir(self.resolve(folder_id)?).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(PARTIAL_SUFFIX) {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            files.push(RemoteFile {
                native_id: Self::child_id(folder_id, &name),
                name,
                size: metadata.len(),
                mod_time: metadata.modified().map(to_utc).unwrap_or_else(|_| Utc::now()),
                native_hash: None,
                parent_id: Some(folder_id.to_string()),
            });
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    #[instrument(skip(self, content))]
    async fn upload_file(
        &self,
        folder_id: &str,
        name: &str,
        mut content: ByteStream,
        size: u64,
    ) -> Result<RemoteFile, CloudError> {
        validate_name(name)?;
        let folder = self.resolve(folder_id)?;
        let target = folder.join(name);
        if exists(&target).await? {
            return Err(CloudError::Other(format!(
                "object '{name}' already exists in '{folder_id}'"
            )));
        }
        let used = self.used_bytes().await?;
        if used.saturating_add(size) > self.quota {
            return Err(CloudError::Other(format!("quota exceeded in {}", self.key)));
        }

        let tmp_path = folder.join(format!(".{name}{PARTIAL_SUFFIX}"));
        let mut tmp = tokio::fs::File::create(&tmp_path).await?;
        let written = tokio::io::copy(&mut content, &mut tmp).await;
        drop(tmp);
        let written = match written {
            Ok(n) => n,
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(e.into());
            }
        };
        if written != size {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(CloudError::Io(format!(
                "upload of {name}: expected {size} bytes, got {written}"
            )));
        }
        tokio::fs::rename(&tmp_path, &target).await?;
        debug!(account = %self.key, name, size, "Stored object");

        self.remote_file(&Self::child_id(folder_id, name)).await
    }

    async fn download_file(&self, native_id: &str) -> Result<ByteStream, CloudError> {
        let file = tokio::fs::File::open(self.resolve(native_id)?).await?;
        Ok(Box::new(file))
    }

    #[instrument(skip(self))]
    async fn delete_file(&self, native_id: &str) -> Result<(), CloudError> {
        tokio::fs::remove_file(self.resolve(native_id)?).await?;
        debug!(account = %self.key, "Deleted object");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn move_file(&self, native_id: &str, folder_id: &str) -> Result<RemoteFile, CloudError> {
        let source = self.resolve(native_id)?;
        let name = file_name(native_id);
        let new_id = Self::child_id(folder_id, &name);
        let target = self.resolve(&new_id)?;
        if exists(&target).await? {
            return Err(CloudError::Other(format!(
                "object '{name}' already exists in '{folder_id}'"
            )));
        }
        tokio::fs::rename(&source, &target).await?;
        self.remote_file(&new_id).await
    }

    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<RemoteFolder, CloudError> {
        validate_name(name)?;
        let parent = self.resolve(parent_id)?;
        if !exists(&parent).await? {
            return Err(CloudError::NotFound(parent_id.to_string()));
        }
        match tokio::fs::create_dir(parent.join(name)).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }
        Ok(RemoteFolder {
            native_id: Self::child_id(parent_id, name),
            name: name.to_string(),
            parent_id: Some(parent_id.to_string()),
        })
    }

    async fn share_folder(
        &self,
        _folder_id: &str,
        _with: &AccountId,
        _role: ShareRole,
    ) -> Result<(), CloudError> {
        Err(CloudError::Unsupported("sharing on local directories".into()))
    }

    async fn get_quota(&self) -> Result<Quota, CloudError> {
        Ok(Quota {
            total: self.quota,
            used: self.used_bytes().await?,
        })
    }

    #[instrument(skip(self))]
    async fn transfer_ownership(
        &self,
        native_id: &str,
        to: &AccountId,
    ) -> Result<TransferOutcome, CloudError> {
        if self.transfer == TransferMode::Unsupported {
            return Err(CloudError::Unsupported("ownership transfer".into()));
        }
        let source = self.resolve(native_id)?;
        if !exists(&source).await? {
            return Err(CloudError::NotFound(native_id.to_string()));
        }
        let target_root = self.account_dir(to);
        if !exists(&target_root).await? {
            return Err(CloudError::NotFound(format!("account {to}")));
        }
        if self.transfer == TransferMode::RequiresConsent {
            return Ok(TransferOutcome::PendingConsent);
        }

        let mut target = target_root;
        for segment in native_id.split('/').filter(|s| !s.is_empty()) {
            target.push(segment);
        }
        if exists(&target).await? {
            return Err(CloudError::Other(format!(
                "account {to} already has '{native_id}'"
            )));
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if tokio::fs::rename(&source, &target).await.is_err() {
            tokio::fs::copy(&source, &target).await?;
            tokio::fs::remove_file(&source).await?;
        }
        debug!(account = %self.key, %to, "Transferred object");
        Ok(TransferOutcome::Transferred)
    }

    async fn get_user_identity(&self) -> Result<UserIdentity, CloudError> {
        Ok(UserIdentity {
            account_id: self.key.account.clone(),
            display_name: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn client(base: &Path, account: &str) -> LocalDirClient {
        LocalDirClient::new(
            AccountKey::parse("local", account).unwrap(),
            base,
            "Mirror",
            1_000,
        )
    }

    #[tokio::test]
    async fn test_provision_and_pre_flight() {
        let dir = TempDir::new().unwrap();
        let client = client(dir.path(), "a");
        assert!(client.pre_flight_check().await.is_err());

        client.provision().await.unwrap();
        client.provision().await.unwrap();
        assert_eq!(client.pre_flight_check().await.unwrap(), "Mirror");
    }

    #[tokio::test]
    async fn test_sync_root_match_ignores_case() {
        let dir = TempDir::new().unwrap();
        let client = client(dir.path(), "a");
        client.provision().await.unwrap();
        std::fs::create_dir(client.root().join("MIRROR")).unwrap();

        let err = client.pre_flight_check().await.unwrap_err();
        assert!(matches!(err, CloudError::AmbiguousSyncRoot { count: 2, .. }));
    }

    #[tokio::test]
    async fn test_upload_list_download() {
        let dir = TempDir::new().unwrap();
        let client = client(dir.path(), "a");
        client.provision().await.unwrap();
        let root = client.get_sync_folder_id().await.unwrap();
        let docs = client.create_folder(&root, "docs").await.unwrap();

        let remote = client
            .upload_file(&docs.native_id, "a.txt", Box::new(Cursor::new(b"hello".to_vec())), 5)
            .await
            .unwrap();
        assert_eq!(remote.native_id, "Mirror/docs/a.txt");
        assert_eq!(remote.size, 5);

        let folders = client.list_folders(&root).await.unwrap();
        assert_eq!(folders.len(), 1);
        let files = client.list_files(&docs.native_id).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "a.txt");

        let mut data = Vec::new();
        client
            .download_file(&remote.native_id)
            .await
            .unwrap()
            .read_to_end(&mut data)
            .await
            .unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(client.get_quota().await.unwrap().used, 5);
    }

    #[tokio::test]
    async fn test_upload_rejects_short_stream_and_existing_name() {
        let dir = TempDir::new().unwrap();
        let client = client(dir.path(), "a");
        client.provision().await.unwrap();
        let root = client.get_sync_folder_id().await.unwrap();

        let err = client
            .upload_file(&root, "a.txt", Box::new(Cursor::new(b"abc".to_vec())), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Io(_)));
        assert!(client.list_files(&root).await.unwrap().is_empty());

        client
            .upload_file(&root, "a.txt", Box::new(Cursor::new(b"abc".to_vec())), 3)
            .await
            .unwrap();
        assert!(client
            .upload_file(&root, "a.txt", Box::new(Cursor::new(b"abc".to_vec())), 3)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_traversal_ids_rejected() {
        let dir = TempDir::new().unwrap();
        let client = client(dir.path(), "a");
        client.provision().await.unwrap();
        assert!(matches!(
            client.delete_file("../b/Mirror/x").await,
            Err(CloudError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_transfer_keeps_native_id() {
        let dir = TempDir::new().unwrap();
        let main = client(dir.path(), "main").with_transfer(TransferMode::Immediate);
        let backup = client(dir.path(), "backup");
        main.provision().await.unwrap();
        backup.provision().await.unwrap();
        let root = main.get_sync_folder_id().await.unwrap();
        let remote = main
            .upload_file(&root, "a.txt", Box::new(Cursor::new(b"abc".to_vec())), 3)
            .await
            .unwrap();

        let outcome = main
            .transfer_ownership(&remote.native_id, &AccountId::new("backup").unwrap())
            .await
            .unwrap();
        assert_eq!(outcome, TransferOutcome::Transferred);
        assert_eq!(main.get_quota().await.unwrap().used, 0);
        let moved = backup.list_files("Mirror").await.unwrap();
        assert_eq!(moved[0].native_id, remote.native_id);
    }
}
