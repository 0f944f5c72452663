//! Cross-provider reconciliation against in-memory clouds

mod common;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use cloudmirror_core::domain::EntryStatus;
use cloudmirror_core::ports::{CloudError, FileFilter, ProviderCapabilities};
use cloudmirror_providers::{Mutation, Operation};
use cloudmirror_sync::{operations, BatchReport, FragmentManager, PlannedAction};

use common::{acct, at, content, fragmenting, quick_retry, Harness, World};

async fn two_providers() -> Harness {
    World::new()
        .provider("google", |c| c.with_native_sha256(), ProviderCapabilities::default())
        .provider("microsoft", |c| c, ProviderCapabilities::default())
        .account("google", "me@x.com", true, 100_000)
        .account("microsoft", "me@x.com", true, 100_000)
        .build()
        .await
}

async fn with_telegram() -> Harness {
    World::new()
        .provider("google", |c| c, ProviderCapabilities::default())
        .provider("telegram", |c| c, fragmenting(100))
        .account("google", "me@x.com", true, 100_000)
        .account("telegram", "me@x.com", true, 100_000)
        .build()
        .await
}

async fn read_back(h: &Harness, provider: &str, p: &str) -> Vec<u8> {
    let replica = h.replica_at(provider, "me@x.com", p).await.unwrap();
    let client = h.client(provider, "me@x.com");
    let mut stream = FragmentManager::new(h.store.clone())
        .reconstruct(&client, &replica)
        .await
        .unwrap();
    let mut data = Vec::new();
    stream.read_to_end(&mut data).await.unwrap();
    data
}

#[tokio::test]
async fn missing_replica_is_uploaded_once() {
    let h = two_providers().await;
    let me = acct("me@x.com");
    let data = content(500, 7);
    h.cloud("google").seed_file(&me, "docs/report.txt", &data, at(60));

    let outcome = operations::sync_providers(&h.ctx).await.unwrap();
    assert!(!outcome.has_failures(), "{:?}", outcome.report.failures);
    assert_eq!(outcome.report.uploaded, 1);
    assert_eq!(outcome.report.verified_accounts.len(), 1);
    assert_eq!(h.cloud("microsoft").file_paths(&me), vec!["docs/report.txt"]);
    assert_eq!(h.cloud("microsoft").read_file(&me, "docs/report.txt"), Some(data));

    let files = h.store.list_files(&FileFilter::new()).await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].status, EntryStatus::Active);
    let replicas = h.store.get_replicas_for_file(&files[0].id).await.unwrap();
    assert_eq!(replicas.len(), 2);
    assert!(replicas.iter().all(|r| r.is_active()));
    assert!(replicas[0].native_hash.is_some());
    assert_eq!(replicas[0].native_hash, replicas[1].native_hash);

    h.clear_mutations();
    let again = operations::sync_providers(&h.ctx).await.unwrap();
    assert_eq!(again.report.uploaded, 0);
    assert!(again.report.actions.is_empty());
    assert_eq!(h.mutation_count(), 0);
}

#[tokio::test]
async fn colliding_paths_get_numbered_names() {
    let h = two_providers().await;
    let me = acct("me@x.com");
    let ours = content(500, 1);
    let theirs = content(300, 2);
    h.cloud("google").seed_file(&me, "docs/report.txt", &ours, at(60));
    h.cloud("microsoft").seed_file(&me, "docs/report.txt", &theirs, at(30));

    let outcome = operations::sync_providers(&h.ctx).await.unwrap();
    assert!(!outcome.has_failures(), "{:?}", outcome.report.failures);
    assert_eq!(outcome.report.renamed, 2);

    let expected = vec!["docs/report (1).txt", "docs/report.txt"];
    assert_eq!(h.cloud("google").file_paths(&me), expected);
    assert_eq!(h.cloud("microsoft").file_paths(&me), expected);
    assert_eq!(h.cloud("microsoft").read_file(&me, "docs/report (1).txt"), Some(ours.clone()));
    assert_eq!(h.cloud("google").read_file(&me, "docs/report (1).txt"), Some(theirs));
    assert_eq!(h.cloud("google").read_file(&me, "docs/report.txt"), Some(ours));

    // renamed copies stay linked to their File
    let again = operations::sync_providers(&h.ctx).await.unwrap();
    assert_eq!(again.report.uploaded, 0);
    assert_eq!(again.report.renamed, 0);
    assert_eq!(h.store.list_files(&FileFilter::new()).await.unwrap().len(), 2);
}

#[tokio::test]
async fn same_size_different_content_is_not_merged() {
    let h = two_providers().await;
    let me = acct("me@x.com");
    h.cloud("google").seed_file(&me, "a.txt", &content(64, 1), at(10));
    h.cloud("microsoft").seed_file(&me, "a.txt", &content(64, 2), at(10));

    let outcome = operations::sync_providers(&h.ctx).await.unwrap();
    assert!(!outcome.has_failures(), "{:?}", outcome.report.failures);
    assert_eq!(outcome.report.renamed, 2);
    assert_eq!(h.cloud("google").file_paths(&me), vec!["a (1).txt", "a.txt"]);
}

#[tokio::test]
async fn oversized_files_round_trip_through_fragments() {
    let h = with_telegram().await;
    let me = acct("me@x.com");
    let exact = content(100, 1);
    let three = content(250, 2);
    let many = content(1_000, 3);
    h.cloud("google").seed_file(&me, "a.bin", &exact, at(5));
    h.cloud("google").seed_file(&me, "b.bin", &three, at(5));
    h.cloud("google").seed_file(&me, "c.bin", &many, at(5));

    let outcome = operations::sync_providers(&h.ctx).await.unwrap();
    assert!(!outcome.has_failures(), "{:?}", outcome.report.failures);
    assert_eq!(outcome.report.uploaded, 3);

    let paths = h.cloud("telegram").file_paths(&me);
    assert_eq!(paths.len(), 1 + 3 + 10);
    assert!(paths.contains(&"a.bin".to_string()));
    assert!(paths.contains(&"b.bin.frag002-of-003".to_string()));
    assert!(paths.contains(&"c.bin.frag010-of-010".to_string()));

    let small = h.replica_at("telegram", "me@x.com", "a.bin").await.unwrap();
    assert!(!small.fragmented);
    let split = h.replica_at("telegram", "me@x.com", "c.bin").await.unwrap();
    assert!(split.fragmented);
    assert_eq!(split.size, 1_000);
    assert_eq!(h.store.get_fragments(&split.id).await.unwrap().len(), 10);

    assert_eq!(read_back(&h, "telegram", "a.bin").await, exact);
    assert_eq!(read_back(&h, "telegram", "b.bin").await, three);
    assert_eq!(read_back(&h, "telegram", "c.bin").await, many);

    let again = operations::sync_providers(&h.ctx).await.unwrap();
    assert_eq!(again.report.uploaded, 0);
}

#[tokio::test]
async fn deleted_file_is_restored_from_fragments() {
    let h = with_telegram().await;
    let me = acct("me@x.com");
    let data = content(250, 5);
    let original = h.cloud("google").seed_file(&me, "b.bin", &data, at(5));
    operations::sync_providers(&h.ctx).await.unwrap();

    h.client("google", "me@x.com").delete_file(&original).await.unwrap();

    let outcome = operations::sync_providers(&h.ctx).await.unwrap();
    assert!(!outcome.has_failures(), "{:?}", outcome.report.failures);
    assert_eq!(outcome.report.restored, 1);
    assert_eq!(outcome.report.uploaded, 0);
    assert!(matches!(
        outcome.report.actions.as_slice(),
        [PlannedAction::Upload { restore: true, .. }]
    ));
    assert_eq!(h.cloud("google").read_file(&me, "b.bin"), Some(data));

    let files = h.store.list_files(&FileFilter::new()).await.unwrap();
    assert_eq!(files.len(), 1, "the restored replica keeps the File identity");
}

#[tokio::test]
async fn corrupt_fragment_set_is_reported() {
    let h = with_telegram().await;
    let me = acct("me@x.com");
    let original = h.cloud("google").seed_file(&me, "b.bin", &content(250, 6), at(5));
    operations::sync_providers(&h.ctx).await.unwrap();

    let replica = h.replica_at("telegram", "me@x.com", "b.bin").await.unwrap();
    let fragments = h.store.get_fragments(&replica.id).await.unwrap();
    let telegram = h.client("telegram", "me@x.com");
    telegram.delete_file(&fragments[1].native_fragment_id).await.unwrap();
    h.client("google", "me@x.com").delete_file(&original).await.unwrap();

    let outcome = operations::sync_providers(&h.ctx).await.unwrap();
    assert!(outcome.report.has_failures());
    assert!(
        outcome.report.failures.iter().any(|f| f.error.contains("corrupt fragment set")),
        "{:?}",
        outcome.report.failures
    );
    assert!(h.cloud("google").file_paths(&me).is_empty());
}

#[tokio::test]
async fn dry_run_plans_the_same_actions_without_mutating() {
    let h = two_providers().await;
    let me = acct("me@x.com");
    h.cloud("google").seed_file(&me, "docs/report.txt", &content(500, 1), at(60));
    h.cloud("google").seed_file(&me, "docs/deep/notes.md", &content(40, 2), at(50));
    h.cloud("microsoft").seed_file(&me, "docs/report.txt", &content(300, 3), at(40));
    h.cloud("microsoft").seed_file(&me, "music/song.mp3", &content(900, 4), at(20));

    let planned = operations::sync_providers(&h.dry_run()).await.unwrap();
    assert_eq!(h.mutation_count(), 0);
    assert_eq!(h.cloud("microsoft").file_paths(&me).len(), 2);
    assert!(planned.report.verified_accounts.is_empty());

    let performed = operations::sync_providers(&h.ctx).await.unwrap();
    assert!(!performed.has_failures(), "{:?}", performed.report.failures);
    assert_eq!(planned.report.actions, performed.report.actions);
    assert_eq!(planned.report.uploaded, performed.report.uploaded);
    assert_eq!(planned.report.renamed, performed.report.renamed);
    assert!(h.mutation_count() > 0);
}

#[tokio::test]
async fn failed_upload_is_reported_and_others_continue() {
    let h = two_providers().await;
    let me = acct("me@x.com");
    h.cloud("google").seed_file(&me, "a.txt", &content(10, 1), at(5));
    h.cloud("google").seed_file(&me, "b.txt", &content(20, 2), at(5));
    h.cloud("microsoft")
        .fail_next(&me, Operation::Upload, CloudError::PermissionDenied("read-only".into()));

    let outcome = operations::sync_providers(&h.ctx).await.unwrap();
    assert_eq!(outcome.report.failures.len(), 1);
    assert_eq!(outcome.report.uploaded, 1);
    assert_eq!(outcome.report.renamed, 0);
    assert_eq!(h.cloud("microsoft").file_paths(&me).len(), 1);

    // the failed copy left no claim on its path
    let again = operations::sync_providers(&h.ctx).await.unwrap();
    assert!(!again.has_failures(), "{:?}", again.report.failures);
    assert_eq!(again.report.uploaded, 1);
    assert_eq!(again.report.renamed, 0);
    assert_eq!(h.cloud("microsoft").file_paths(&me), vec!["a.txt", "b.txt"]);
}

#[tokio::test]
async fn transient_upload_failure_is_replayed_from_the_source() {
    let h = two_providers().await;
    let me = acct("me@x.com");
    let data = content(500, 7);
    h.cloud("google").seed_file(&me, "report.txt", &data, at(60));
    h.cloud("microsoft")
        .fail_next(&me, Operation::Upload, CloudError::ServerError("503".into()));

    let outcome = operations::sync_providers(&h.ctx).await.unwrap();
    assert!(!outcome.has_failures(), "{:?}", outcome.report.failures);
    assert_eq!(outcome.report.uploaded, 1);
    assert_eq!(h.cloud("microsoft").read_file(&me, "report.txt"), Some(data));
}

#[tokio::test]
async fn split_upload_resumes_at_the_failed_fragment() {
    let h = with_telegram().await;
    let me = acct("me@x.com");
    let data = content(250, 4);
    h.cloud("google").seed_file(&me, "b.bin", &data, at(5));
    h.cloud("telegram")
        .fail_after(&me, Operation::Upload, 1, CloudError::Transient("reset".into()));

    let outcome = operations::sync_providers(&h.ctx).await.unwrap();
    assert!(!outcome.has_failures(), "{:?}", outcome.report.failures);
    assert_eq!(outcome.report.uploaded, 1);

    let stored: Vec<String> = h
        .cloud("telegram")
        .mutations()
        .into_iter()
        .filter_map(|m| match m {
            Mutation::Upload { name, .. } => Some(name),
            _ => None,
        })
        .collect();
    assert_eq!(
        stored,
        vec!["b.bin.frag001-of-003", "b.bin.frag002-of-003", "b.bin.frag003-of-003"]
    );
    assert_eq!(read_back(&h, "telegram", "b.bin").await, data);

    let replica = h.replica_at("telegram", "me@x.com", "b.bin").await.unwrap();
    let expected = format!("sha256:{}", hex::encode(Sha256::digest(&data)));
    assert_eq!(replica.native_hash.unwrap().to_string(), expected);
}

#[tokio::test]
async fn split_upload_gives_up_and_removes_its_fragments() {
    let h = World::new()
        .provider("google", |c| c, ProviderCapabilities::default())
        .provider("telegram", |c| c, fragmenting(100))
        .account("google", "me@x.com", true, 100_000)
        .account("telegram", "me@x.com", true, 100_000)
        .settings(|s| s.retry = quick_retry(1))
        .build()
        .await;
    let me = acct("me@x.com");
    h.cloud("google").seed_file(&me, "b.bin", &content(250, 4), at(5));
    let telegram = h.cloud("telegram");
    telegram.fail_after(&me, Operation::Upload, 1, CloudError::Transient("reset".into()));
    telegram.fail_next(&me, Operation::Upload, CloudError::Transient("reset".into()));

    let outcome = operations::sync_providers(&h.ctx).await.unwrap();
    assert_eq!(outcome.report.failures.len(), 1);
    assert_eq!(outcome.report.uploaded, 0);
    assert!(telegram.file_paths(&me).is_empty());
    assert!(h.replica_at("telegram", "me@x.com", "b.bin").await.is_none());
}
