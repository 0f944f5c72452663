//! Metadata scanner behavior against in-memory clouds

mod common;

use cloudmirror_core::domain::EntryStatus;
use cloudmirror_core::ports::ProviderCapabilities;
use cloudmirror_sync::hashing::hash_bytes;
use cloudmirror_sync::{operations, BatchReport};

use common::{acct, at, content, World, TRASH_FOLDER};

#[tokio::test]
async fn rescanning_an_unchanged_tree_changes_nothing() {
    let h = World::new()
        .provider("google", |c| c.with_native_sha256(), ProviderCapabilities::default())
        .provider("microsoft", |c| c, ProviderCapabilities::default())
        .account("google", "me@x.com", true, 100_000)
        .account("microsoft", "me@x.com", true, 100_000)
        .build()
        .await;
    let me = acct("me@x.com");
    h.cloud("google").seed_file(&me, "docs/report.txt", &content(500, 1), at(60));
    h.cloud("google").seed_file(&me, "photos/cat.jpg", &content(2_000, 2), at(30));
    h.cloud("microsoft").seed_file(&me, "notes/todo.md", &content(120, 3), at(10));

    let first = operations::get_metadata(&h.ctx).await;
    assert!(!first.has_failures(), "{first:?}");
    let before = h.snapshot().await;
    assert_eq!(before.len(), 3);

    let second = operations::get_metadata(&h.ctx).await;
    assert!(!second.has_failures());
    for summary in &second.accounts {
        assert_eq!(summary.new_replicas, 0, "{}", summary.account);
        assert_eq!(summary.updated_replicas, 0, "{}", summary.account);
        assert_eq!(summary.new_files, 0, "{}", summary.account);
        // stored hashes are reused when size and mtime are unchanged
        assert_eq!(summary.hashed, 0, "{}", summary.account);
    }
    assert_eq!(h.snapshot().await, before);
}

#[tokio::test]
async fn identical_files_on_two_providers_share_one_file() {
    let h = World::new()
        .provider("google", |c| c.with_native_sha256(), ProviderCapabilities::default())
        .provider("microsoft", |c| c, ProviderCapabilities::default())
        .account("google", "me@x.com", true, 100_000)
        .account("microsoft", "me@x.com", true, 100_000)
        .build()
        .await;
    let me = acct("me@x.com");
    let data = content(500, 9);
    h.cloud("google").seed_file(&me, "docs/report.txt", &data, at(60));
    h.cloud("microsoft").seed_file(&me, "docs/report.txt", &data, at(50));

    operations::get_metadata(&h.ctx).await;

    let snapshot = h.snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].1.len(), 2);
}

#[tokio::test]
async fn ambiguous_sync_root_fails_only_that_account() {
    let h = World::new()
        .provider("google", |c| c, ProviderCapabilities::default())
        .account("google", "a@x.com", true, 10_000)
        .account("google", "b@x.com", false, 10_000)
        .build()
        .await;
    h.cloud("google").add_root_folder(&acct("a@x.com"), "CloudMirror");
    h.cloud("google").seed_file(&acct("b@x.com"), "x.txt", b"hello", at(0));

    let report = operations::get_metadata(&h.ctx).await;

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].item, "google/a@x.com");
    assert_eq!(report.accounts.len(), 1);
    assert_eq!(report.accounts[0].objects, 1);
    assert!(h.replica_at("google", "a@x.com", "x.txt").await.is_none());
}

#[tokio::test]
async fn missing_replicas_become_soft_deleted_or_deleted() {
    let h = World::new()
        .provider("google", |c| c, ProviderCapabilities::default())
        .account("google", "me@x.com", true, 10_000)
        .build()
        .await;
    let me = acct("me@x.com");
    let cloud = h.cloud("google");
    cloud.seed_file(&me, "keep.txt", &content(10, 1), at(5));
    let gone = cloud.seed_file(&me, "gone.txt", &content(20, 2), at(5));
    let binned = cloud.seed_file(&me, "binned.txt", &content(30, 3), at(5));
    operations::get_metadata(&h.ctx).await;

    let client = h.client("google", "me@x.com");
    let root = client.get_sync_folder_id().await.unwrap();
    let trash = client.create_folder(&root, TRASH_FOLDER).await.unwrap();
    client.move_file(&binned, &trash.native_id).await.unwrap();
    client.delete_file(&gone).await.unwrap();

    let report = operations::get_metadata(&h.ctx).await;
    let summary = &report.accounts[0];
    assert_eq!(summary.soft_deleted, 1);
    assert_eq!(summary.deleted, 1);
    assert_eq!(summary.objects, 1, "trash contents are not replicas");

    for (p, expected) in [
        ("keep.txt", EntryStatus::Active),
        ("binned.txt", EntryStatus::SoftDeleted),
        ("gone.txt", EntryStatus::Deleted),
    ] {
        let replica = h.replica_at("google", "me@x.com", p).await.unwrap();
        assert_eq!(replica.status, expected, "{p}");
    }

    let again = operations::get_metadata(&h.ctx).await;
    assert_eq!(again.accounts[0].soft_deleted, 0);
    assert_eq!(again.accounts[0].deleted, 0);
}

#[tokio::test]
async fn fragment_objects_fold_into_one_replica() {
    let h = World::new()
        .provider("telegram", |c| c, ProviderCapabilities::default())
        .account("telegram", "+15550001", true, 10_000)
        .build()
        .await;
    let me = acct("+15550001");
    let data = content(180, 4);
    h.cloud("telegram")
        .seed_file(&me, "movie.mkv.frag001-of-002", &data[..100], at(5));
    h.cloud("telegram")
        .seed_file(&me, "movie.mkv.frag002-of-002", &data[100..], at(4));

    let report = operations::get_metadata(&h.ctx).await;
    assert_eq!(report.accounts[0].fragmented, 1);

    let replica = h.replica_at("telegram", "+15550001", "movie.mkv").await.unwrap();
    assert!(replica.fragmented);
    assert_eq!(replica.size, 180);
    assert_eq!(replica.native_hash, Some(hash_bytes(&data).unwrap()));
    let fragments = h.store.get_fragments(&replica.id).await.unwrap();
    assert_eq!(fragments.len(), 2);
    assert_eq!(fragments[0].native_fragment_id, replica.native_id);
}

#[tokio::test]
async fn incomplete_fragment_sets_are_recorded_without_hash() {
    let h = World::new()
        .provider("telegram", |c| c, ProviderCapabilities::default())
        .account("telegram", "+15550001", true, 10_000)
        .build()
        .await;
    let me = acct("+15550001");
    h.cloud("telegram")
        .seed_file(&me, "movie.mkv.frag001-of-003", &content(100, 1), at(5));
    h.cloud("telegram")
        .seed_file(&me, "movie.mkv.frag003-of-003", &content(40, 3), at(5));

    operations::get_metadata(&h.ctx).await;

    let replica = h.replica_at("telegram", "+15550001", "movie.mkv").await.unwrap();
    assert!(replica.fragmented);
    assert_eq!(replica.native_hash, None);
    assert_eq!(h.store.get_fragments(&replica.id).await.unwrap().len(), 2);
}
