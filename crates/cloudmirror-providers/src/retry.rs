//! Retry decorator for any cloud client
//!
//! Transient failures (see [`CloudError::is_transient`]) are retried with
//! exponential backoff plus uniform jitter. Everything else is returned to
//! the caller on the first attempt.
//!
//! Uploads pass through once: the content stream is consumed by the first
//! attempt, so the engines retry them by re-reading their source.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use cloudmirror_core::domain::{AccountId, AccountKey};
use cloudmirror_core::ports::{
    ByteStream, CloudError, ICloudClient, Quota, RemoteFile, RemoteFolder, ShareRole,
    TransferOutcome, UserIdentity,
};
pub use cloudmirror_core::retry::RetryPolicy;

/// Wraps a client and retries its transient failures
pub struct RetryingClient {
    inner: Arc<dyn ICloudClient>,
    policy: RetryPolicy,
}

impl RetryingClient {
    pub fn new(inner: Arc<dyn ICloudClient>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn with_retry<F, Fut, T>(&self, operation: &str, f: F) -> Result<T, CloudError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, CloudError>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(
                            account = %self.inner.account(),
                            operation,
                            attempt,
                            "Operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(err) => {
                    let Some(delay) = self.policy.next_delay(attempt, &err) else {
                        return Err(err);
                    };
                    warn!(
                        account = %self.inner.account(),
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait]
impl ICloudClient for RetryingClient {
    fn account(&self) -> &AccountKey {
        self.inner.account()
    }

    async fn pre_flight_check(&self) -> Result<String, CloudError> {
        self.with_retry("pre_flight_check", || self.inner.pre_flight_check())
            .await
    }

    async fn get_sync_folder_id(&self) -> Result<String, CloudError> {
        self.with_retry("get_sync_folder_id", || self.inner.get_sync_folder_id())
            .await
    }

    async fn list_folders(&self, parent_id: &str) -> Result<Vec<RemoteFolder>, CloudError> {
        self.with_retry("list_folders", || self.inner.list_folders(parent_id))
            .await
    }

    async fn list_files(&self, folder_id: &str) -> Result<Vec<RemoteFile>, CloudError> {
        self.with_retry("list_files", || self.inner.list_files(folder_id))
            .await
    }

    async fn upload_file(
        &self,
        folder_id: &str,
        name: &str,
        content: ByteStream,
        size: u64,
    ) -> Result<RemoteFile, CloudError> {
        self.inner.upload_file(folder_id, name, content, size).await
    }

    async fn download_file(&self, native_id: &str) -> Result<ByteStream, CloudError> {
        self.with_retry("download_file", || self.inner.download_file(native_id))
            .await
    }

    async fn delete_file(&self, native_id: &str) -> Result<(), CloudError> {
        self.with_retry("delete_file", || self.inner.delete_file(native_id))
            .await
    }

    async fn move_file(&self, native_id: &str, folder_id: &str) -> Result<RemoteFile, CloudError> {
        self.with_retry("move_file", || self.inner.move_file(native_id, folder_id))
            .await
    }

    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<RemoteFolder, CloudError> {
        self.with_retry("create_folder", || self.inner.create_folder(parent_id, name))
            .await
    }

    async fn share_folder(
        &self,
        folder_id: &str,
        with: &AccountId,
        role: ShareRole,
    ) -> Result<(), CloudError> {
        self.with_retry("share_folder", || {
            self.inner.share_folder(folder_id, with, role)
        })
        .await
    }

    async fn get_quota(&self) -> Result<Quota, CloudError> {
        self.with_retry("get_quota", || self.inner.get_quota()).await
    }

    async fn transfer_ownership(
        &self,
        native_id: &str,
        to: &AccountId,
    ) -> Result<TransferOutcome, CloudError> {
        self.with_retry("transfer_ownership", || {
            self.inner.transfer_ownership(native_id, to)
        })
        .await
    }

    async fn get_user_identity(&self) -> Result<UserIdentity, CloudError> {
        self.with_retry("get_user_identity", || self.inner.get_user_identity())
            .await
    }
}
