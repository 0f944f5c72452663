//! Storage balancing and main-account evacuation against in-memory clouds

mod common;

use std::time::Duration;

use cloudmirror_core::ports::{CloudError, ProviderCapabilities};
use cloudmirror_core::retry::RetryPolicy;
use cloudmirror_providers::{Mutation, Operation, TransferMode};
use cloudmirror_sync::{operations, BatchReport, SyncError};

use common::{acct, at, content, key, transferable, Harness, World};

async fn crowded(transfer: TransferMode, capabilities: ProviderCapabilities) -> Harness {
    let h = World::new()
        .provider("google", |c| c.with_transfer(transfer), capabilities)
        .account("google", "main@x.com", true, 1_000)
        .account("google", "b1@x.com", false, 1_000)
        .account("google", "b2@x.com", false, 1_000)
        .build()
        .await;
    let main = acct("main@x.com");
    h.cloud("google").seed_file(&main, "big.bin", &content(400, 1), at(30));
    h.cloud("google").seed_file(&main, "docs/mid.bin", &content(300, 2), at(20));
    h.cloud("google").seed_file(&main, "small.bin", &content(260, 3), at(10));
    h
}

#[tokio::test]
async fn over_quota_account_sheds_its_largest_file() {
    let h = crowded(TransferMode::Unsupported, ProviderCapabilities::default()).await;

    let outcome = operations::balance_storage(&h.ctx).await.unwrap();
    assert!(!outcome.has_failures(), "{:?}", outcome.report);
    assert_eq!(outcome.report.moved, 1);
    assert_eq!(outcome.report.copied, 1);
    assert_eq!(outcome.report.bytes_moved, 400);
    assert!(outcome.report.unresolved.is_empty());

    let cloud = h.cloud("google");
    assert_eq!(cloud.file_paths(&acct("main@x.com")), vec!["docs/mid.bin", "small.bin"]);
    // equal free space: the lower account key wins
    assert_eq!(cloud.file_paths(&acct("b1@x.com")), vec!["big.bin"]);
    assert_eq!(cloud.read_file(&acct("b1@x.com"), "big.bin"), Some(content(400, 1)));

    assert!(h.replica_at("google", "main@x.com", "big.bin").await.is_none());
    let moved = h.replica_at("google", "b1@x.com", "big.bin").await.unwrap();
    assert!(moved.is_active());
    assert!(moved.file_id.is_some());

    let again = operations::balance_storage(&h.ctx).await.unwrap();
    assert_eq!(again.report.moved, 0);
}

#[tokio::test]
async fn account_without_room_elsewhere_is_unresolved() {
    let h = World::new()
        .provider("google", |c| c, ProviderCapabilities::default())
        .account("google", "main@x.com", true, 1_000)
        .account("google", "b1@x.com", false, 500)
        .build()
        .await;
    h.cloud("google")
        .seed_file(&acct("main@x.com"), "huge.bin", &content(990, 1), at(5));

    let outcome = operations::balance_storage(&h.ctx).await.unwrap();
    assert!(outcome.report.has_failures());
    assert_eq!(outcome.report.unresolved.len(), 1);
    assert_eq!(outcome.report.unresolved[0].account, acct("main@x.com"));
    assert_eq!(outcome.report.moved, 0);
    assert_eq!(h.cloud("google").file_paths(&acct("main@x.com")), vec!["huge.bin"]);
}

#[tokio::test]
async fn immediate_transfer_keeps_the_object() {
    let h = crowded(TransferMode::Immediate, transferable()).await;

    let outcome = operations::balance_storage(&h.ctx).await.unwrap();
    assert!(!outcome.has_failures(), "{:?}", outcome.report);
    assert_eq!(outcome.report.transferred, 1);
    assert_eq!(outcome.report.copied, 0);

    let cloud = h.cloud("google");
    assert_eq!(cloud.file_paths(&acct("b1@x.com")), vec!["big.bin"]);
    assert!(!cloud
        .mutations()
        .iter()
        .any(|m| matches!(m, Mutation::Upload { .. })));
    let moved = h.replica_at("google", "b1@x.com", "big.bin").await.unwrap();
    assert!(moved.is_active());
}

#[tokio::test]
async fn transfers_awaiting_consent_leave_the_account_unresolved() {
    let h = crowded(TransferMode::RequiresConsent, transferable()).await;

    let outcome = operations::balance_storage(&h.ctx).await.unwrap();
    // nothing has moved until the recipients accept
    assert!(outcome.report.failures.is_empty(), "{:?}", outcome.report.failures);
    assert_eq!(outcome.report.moved, 0);
    assert_eq!(outcome.report.pending_consent, 3);
    assert_eq!(outcome.report.unresolved, vec![key("google", "main@x.com")]);
    assert!(outcome.has_failures());

    let cloud = h.cloud("google");
    assert_eq!(cloud.pending_transfers().len(), 3);
    assert_eq!(cloud.file_paths(&acct("main@x.com")).len(), 3);
    let quota = h.client("google", "main@x.com").get_quota().await.unwrap();
    assert_eq!(quota.used, 960);
}

#[tokio::test]
async fn dry_run_balance_only_plans() {
    let h = crowded(TransferMode::Unsupported, ProviderCapabilities::default()).await;

    let planned = operations::balance_storage(&h.dry_run()).await.unwrap();
    assert_eq!(planned.report.moved, 1);
    assert_eq!(h.mutation_count(), 0);

    let performed = operations::balance_storage(&h.ctx).await.unwrap();
    assert_eq!(planned.report.actions, performed.report.actions);
}

#[tokio::test]
async fn free_main_refuses_when_backups_are_too_small() {
    let h = World::new()
        .provider("google", |c| c, ProviderCapabilities::default())
        .account("google", "main@x.com", true, 10_000)
        .account("google", "b1@x.com", false, 500)
        .build()
        .await;
    let main = acct("main@x.com");
    h.cloud("google").seed_file(&main, "a.bin", &content(300, 1), at(5));
    h.cloud("google").seed_file(&main, "b.bin", &content(300, 2), at(5));

    let err = operations::free_main(&h.ctx, None).await.unwrap_err();
    match err {
        SyncError::InsufficientBackupSpace {
            required,
            available,
            ..
        } => {
            assert_eq!(required, 600);
            assert_eq!(available, 500);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.mutation_count(), 0);
    assert_eq!(h.cloud("google").file_paths(&main).len(), 2);
}

#[tokio::test]
async fn free_main_empties_the_main_account() {
    let h = World::new()
        .provider("google", |c| c.with_native_sha256(), ProviderCapabilities::default())
        .account("google", "main@x.com", true, 10_000)
        .account("google", "b1@x.com", false, 1_000)
        .account("google", "b2@x.com", false, 1_000)
        .build()
        .await;
    let main = acct("main@x.com");
    let shared = content(200, 9);
    h.cloud("google").seed_file(&main, "a.bin", &content(300, 1), at(5));
    h.cloud("google").seed_file(&main, "shared.bin", &shared, at(5));
    h.cloud("google").seed_file(&acct("b1@x.com"), "shared.bin", &shared, at(5));

    let outcome = operations::free_main(&h.ctx, None).await.unwrap();
    assert!(!outcome.has_failures(), "{:?}", outcome.report);
    assert_eq!(outcome.report.redundant_removed, 1);
    assert_eq!(outcome.report.moved, 1);

    let cloud = h.cloud("google");
    assert!(cloud.file_paths(&main).is_empty());
    assert_eq!(cloud.file_paths(&acct("b2@x.com")), vec!["a.bin"]);
    assert_eq!(cloud.file_paths(&acct("b1@x.com")), vec!["shared.bin"]);
}

#[tokio::test]
async fn dry_run_free_main_only_plans() {
    let h = World::new()
        .provider("google", |c| c.with_native_sha256(), ProviderCapabilities::default())
        .account("google", "main@x.com", true, 10_000)
        .account("google", "b1@x.com", false, 1_000)
        .account("google", "b2@x.com", false, 1_000)
        .build()
        .await;
    let main = acct("main@x.com");
    let shared = content(200, 9);
    h.cloud("google").seed_file(&main, "a.bin", &content(300, 1), at(5));
    h.cloud("google").seed_file(&main, "docs/b.bin", &content(100, 2), at(5));
    h.cloud("google").seed_file(&main, "shared.bin", &shared, at(5));
    h.cloud("google").seed_file(&acct("b1@x.com"), "shared.bin", &shared, at(5));

    let planned = operations::free_main(&h.dry_run(), None).await.unwrap();
    assert!(!planned.has_failures(), "{:?}", planned.report);
    assert_eq!(h.mutation_count(), 0);
    assert_eq!(h.cloud("google").file_paths(&main).len(), 3);
    assert!(h.replica_at("google", "main@x.com", "a.bin").await.unwrap().is_active());

    let performed = operations::free_main(&h.ctx, None).await.unwrap();
    assert!(!performed.has_failures(), "{:?}", performed.report);
    assert_eq!(planned.report.actions, performed.report.actions);
    assert_eq!(planned.report.moved, performed.report.moved);
    assert_eq!(planned.report.redundant_removed, performed.report.redundant_removed);
    assert!(h.cloud("google").file_paths(&main).is_empty());
}

#[tokio::test]
async fn free_main_past_its_deadline_keeps_committed_moves() {
    let h = World::new()
        .provider("google", |c| c, ProviderCapabilities::default())
        .account("google", "main@x.com", true, 10_000)
        .account("google", "b1@x.com", false, 10_000)
        .settings(|s| {
            s.deadline = Duration::from_secs(1);
            s.retry = RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_secs(30),
                max_delay: Duration::from_secs(30),
            };
        })
        .build()
        .await;
    let main = acct("main@x.com");
    let backup = acct("b1@x.com");
    h.cloud("google").seed_file(&main, "a.bin", &content(300, 1), at(5));
    h.cloud("google").seed_file(&main, "b.bin", &content(200, 2), at(5));
    // the second copy stalls in backoff until the deadline passes
    h.cloud("google")
        .fail_after(&backup, Operation::Upload, 1, CloudError::ServerError("503".into()));

    let err = operations::free_main(&h.ctx, None).await.unwrap_err();
    assert!(matches!(err, SyncError::DeadlineExceeded(d) if d == Duration::from_secs(1)));

    let cloud = h.cloud("google");
    assert_eq!(cloud.file_paths(&main), vec!["b.bin"]);
    assert_eq!(cloud.file_paths(&backup), vec!["a.bin"]);
    assert!(h.replica_at("google", "main@x.com", "a.bin").await.is_none());
    let moved = h.replica_at("google", "b1@x.com", "a.bin").await.unwrap();
    assert!(moved.is_active());
    assert!(moved.file_id.is_some());
    assert!(h.replica_at("google", "main@x.com", "b.bin").await.unwrap().is_active());
}
