//! Retry decorator behavior against the in-memory backend

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cloudmirror_core::domain::{AccountId, ProviderId};
use cloudmirror_core::ports::{CloudError, ICloudClient};
use cloudmirror_providers::{MemoryCloud, Mutation, Operation, RetryPolicy, RetryingClient};

fn fast_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    }
}

fn setup(max_retries: u32) -> (Arc<MemoryCloud>, AccountId, RetryingClient) {
    let cloud = Arc::new(MemoryCloud::new(ProviderId::new("google").unwrap(), "sync"));
    let account = AccountId::new("a@x.com").unwrap();
    let inner = cloud.add_account(account.clone(), 1_000);
    let client = RetryingClient::new(inner, fast_policy(max_retries));
    (cloud, account, client)
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let (cloud, account, client) = setup(3);
    cloud.fail_next(&account, Operation::Quota, CloudError::Transient("reset".into()));
    cloud.fail_next(&account, Operation::Quota, CloudError::ServerError("503".into()));

    let quota = client.get_quota().await.unwrap();
    assert_eq!(quota.total, 1_000);
}

#[tokio::test]
async fn retries_stop_at_the_limit() {
    let (cloud, account, client) = setup(1);
    for _ in 0..3 {
        cloud.fail_next(
            &account,
            Operation::ListFiles,
            CloudError::RateLimited { retry_after: None },
        );
    }
    let root = client.get_sync_folder_id().await.unwrap();

    let err = client.list_files(&root).await.unwrap_err();
    assert!(matches!(err, CloudError::RateLimited { .. }));
    // the leftover failure is absorbed by a single retry
    assert!(client.list_files(&root).await.is_ok());
}

#[tokio::test]
async fn permanent_failures_are_not_retried() {
    let (cloud, account, client) = setup(5);
    let id = cloud.seed_file(&account, "a.txt", b"abc", Utc::now());
    cloud.deny_delete(&id);

    let err = client.delete_file(&id).await.unwrap_err();
    assert!(matches!(err, CloudError::PermissionDenied(_)));
    assert!(cloud
        .mutations()
        .iter()
        .all(|m| !matches!(m, Mutation::Delete { .. })));
}

#[tokio::test]
async fn upload_failures_are_handed_back_for_the_caller_to_replay() {
    let (cloud, account, client) = setup(5);
    let root = client.get_sync_folder_id().await.unwrap();
    cloud.fail_next(&account, Operation::Upload, CloudError::Transient("reset".into()));

    // the first attempt drains the stream, so only the caller can retry
    let err = client
        .upload_file(&root, "a.txt", Box::new(std::io::Cursor::new(b"abc".to_vec())), 3)
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert!(RetryPolicy::default().next_delay(0, &err).is_some());
    assert!(cloud.file_paths(&account).is_empty());

    client
        .upload_file(&root, "a.txt", Box::new(std::io::Cursor::new(b"abc".to_vec())), 3)
        .await
        .unwrap();
    assert_eq!(cloud.file_paths(&account), vec!["a.txt"]);
}
