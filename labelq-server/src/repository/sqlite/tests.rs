//! Tests for the SQLite item repository.

use labelq_core::{CallerId, ItemId, ItemStatus, LabelAction, Outcome};
use rusqlite::params;

use super::super::{CompletionOutcome, ImportSummary, ItemRepository};
use super::{SqliteItemRepository, CURRENT_SCHEMA_VERSION};

fn texts(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

async fn repo_with(values: &[&str]) -> SqliteItemRepository {
    let repo = SqliteItemRepository::new_in_memory().unwrap();
    repo.insert_items(texts(values)).await.unwrap();
    repo
}

async fn claim(repo: &SqliteItemRepository, caller: CallerId) -> Option<labelq_core::Item> {
    let reservation = repo.reserve_pending(caller, &[]).await.unwrap()?;
    repo.mark_locked(reservation).await.unwrap()
}

fn set_created_at(repo: &SqliteItemRepository, id: ItemId, millis: i64) {
    let conn = repo.conn.lock().unwrap();
    conn.execute(
        "UPDATE items SET created_at = ?1 WHERE id = ?2",
        params![millis, id.0],
    )
    .unwrap();
}

#[tokio::test]
async fn test_schema_version_is_recorded() {
    let repo = SqliteItemRepository::new_in_memory().unwrap();
    let conn = repo.conn.lock().unwrap();
    let version: i64 = conn
        .query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| {
            row.get(0)
        })
        .unwrap();
    assert_eq!(version, CURRENT_SCHEMA_VERSION);
}

#[tokio::test]
async fn test_reopen_preserves_items() {
    let dir = std::env::temp_dir().join(format!("labelq-items-{}", uuid::Uuid::new_v4()));
    let path = dir.join("items.db");

    {
        let repo = SqliteItemRepository::new(&path).unwrap();
        repo.insert_items(texts(&["persisted"])).await.unwrap();
        claim(&repo, CallerId(1)).await.unwrap();
    }

    let reopened = SqliteItemRepository::new(&path).unwrap();
    let item = reopened.get(ItemId(1)).await.unwrap().unwrap();
    assert_eq!(item.text, "persisted");
    assert_eq!(item.status, ItemStatus::Locked);

    drop(reopened);
    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn test_newer_schema_is_rejected() {
    let dir = std::env::temp_dir().join(format!("labelq-items-{}", uuid::Uuid::new_v4()));
    let path = dir.join("items.db");
    {
        let repo = SqliteItemRepository::new(&path).unwrap();
        let conn = repo.conn.lock().unwrap();
        conn.execute(
            "UPDATE schema_version SET version = ?1 WHERE id = 1",
            params![CURRENT_SCHEMA_VERSION + 1],
        )
        .unwrap();
    }

    assert!(SqliteItemRepository::new(&path).is_err());
    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn test_insert_items_deduplicates() {
    let repo = SqliteItemRepository::new_in_memory().unwrap();
    let summary = repo
        .insert_items(texts(&["foo", "bar", "foo", ""]))
        .await
        .unwrap();
    assert_eq!(
        summary,
        ImportSummary {
            loaded: 2,
            duplicates: 1,
            rejected: 1
        }
    );

    let again = repo.insert_items(texts(&["bar", "baz"])).await.unwrap();
    assert_eq!(again.loaded, 1);
    assert_eq!(again.duplicates, 1);

    let item = repo.get(ItemId(1)).await.unwrap().unwrap();
    assert_eq!(item.text, "foo");
    assert_eq!(item.text_hash, labelq_core::text_hash("foo"));
    assert_eq!(item.status, ItemStatus::Pending);
}

#[tokio::test]
async fn test_get_returns_none_for_missing() {
    let repo = SqliteItemRepository::new_in_memory().unwrap();
    assert!(repo.get(ItemId(42)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_reserve_orders_by_recency_then_id() {
    let repo = repo_with(&["old", "new", "newer-same-ms"]).await;
    set_created_at(&repo, ItemId(1), 1_000);
    set_created_at(&repo, ItemId(2), 5_000);
    set_created_at(&repo, ItemId(3), 5_000);

    let first = claim(&repo, CallerId(1)).await.unwrap();
    let second = claim(&repo, CallerId(1)).await.unwrap();
    let third = claim(&repo, CallerId(1)).await.unwrap();

    assert_eq!(first.id, ItemId(3));
    assert_eq!(second.id, ItemId(2));
    assert_eq!(third.id, ItemId(1));
    assert!(claim(&repo, CallerId(1)).await.is_none());
}

#[tokio::test]
async fn test_reserve_skips_rows_held_by_other_claims() {
    let repo = repo_with(&["a", "b"]).await;
    let first = repo.reserve_pending(CallerId(1), &[]).await.unwrap().unwrap();
    let second = repo.reserve_pending(CallerId(2), &[]).await.unwrap().unwrap();
    assert_ne!(first.item_id(), second.item_id());
    assert!(repo.reserve_pending(CallerId(3), &[]).await.unwrap().is_none());
}

#[tokio::test]
async fn test_reserve_honours_exclusions() {
    let repo = repo_with(&["a", "b"]).await;
    let reservation = repo
        .reserve_pending(CallerId(1), &[ItemId(2)])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reservation.item_id(), ItemId(1));

    drop(reservation);
    let none = repo
        .reserve_pending(CallerId(1), &[ItemId(1), ItemId(2)])
        .await
        .unwrap();
    assert!(none.is_none());
}

#[tokio::test]
async fn test_reserve_does_not_change_status() {
    let repo = repo_with(&["a"]).await;
    let reservation = repo.reserve_pending(CallerId(1), &[]).await.unwrap().unwrap();
    assert_eq!(reservation.item().status, ItemStatus::Pending);
    assert_eq!(
        repo.get(ItemId(1)).await.unwrap().unwrap().status,
        ItemStatus::Pending
    );
}

#[tokio::test]
async fn test_mark_locked_refuses_rows_that_left_pending() {
    let repo = repo_with(&["a"]).await;
    let reservation = repo.reserve_pending(CallerId(1), &[]).await.unwrap().unwrap();
    {
        let conn = repo.conn.lock().unwrap();
        conn.execute("UPDATE items SET status = 'skipped' WHERE id = 1", [])
            .unwrap();
    }
    assert!(repo.mark_locked(reservation).await.unwrap().is_none());
    assert_eq!(
        repo.get(ItemId(1)).await.unwrap().unwrap().status,
        ItemStatus::Skipped
    );
}

#[tokio::test]
async fn test_complete_rated_writes_label_and_status() {
    let repo = repo_with(&["foo"]).await;
    let item = claim(&repo, CallerId(7)).await.unwrap();

    let result = repo
        .complete(item.id, CallerId(7), Outcome::rated(8).unwrap())
        .await
        .unwrap();
    let CompletionOutcome::Completed(label) = result else {
        panic!("expected completion, got {:?}", result);
    };
    assert_eq!(label.user_id, CallerId(7));
    assert_eq!(label.score.map(|s| s.value()), Some(8));
    assert_eq!(label.action, LabelAction::Rated);

    let stored = repo.get(item.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ItemStatus::Labeled);

    let labels = repo.labels_for_item(item.id).await.unwrap();
    assert_eq!(labels.len(), 1);
    assert_eq!(labels[0].item_id, item.id);
    assert_eq!(labels[0].score.map(|s| s.value()), Some(8));
}

#[tokio::test]
async fn test_complete_skipped_stores_null_score() {
    let repo = repo_with(&["foo"]).await;
    let item = claim(&repo, CallerId(7)).await.unwrap();
    repo.complete(item.id, CallerId(7), Outcome::Skipped)
        .await
        .unwrap();

    assert_eq!(
        repo.get(item.id).await.unwrap().unwrap().status,
        ItemStatus::Skipped
    );
    let labels = repo.labels_for_item(item.id).await.unwrap();
    assert_eq!(labels[0].score, None);
    assert_eq!(labels[0].action, LabelAction::Skipped);
}

#[tokio::test]
async fn test_second_completion_is_rejected_without_new_row() {
    let repo = repo_with(&["foo"]).await;
    let item = claim(&repo, CallerId(7)).await.unwrap();
    repo.complete(item.id, CallerId(7), Outcome::rated(8).unwrap())
        .await
        .unwrap();

    let again = repo
        .complete(item.id, CallerId(7), Outcome::Skipped)
        .await
        .unwrap();
    assert_eq!(again, CompletionOutcome::AlreadyCompleted);

    // A different caller cannot move a terminal item either.
    let other = repo
        .complete(item.id, CallerId(8), Outcome::Skipped)
        .await
        .unwrap();
    assert_eq!(other, CompletionOutcome::AlreadyCompleted);

    assert_eq!(repo.labels_for_item(item.id).await.unwrap().len(), 1);
    assert_eq!(
        repo.get(item.id).await.unwrap().unwrap().status,
        ItemStatus::Labeled
    );
}

#[tokio::test]
async fn test_complete_unknown_and_unclaimed_items() {
    let repo = repo_with(&["foo"]).await;
    assert_eq!(
        repo.complete(ItemId(99), CallerId(1), Outcome::Skipped)
            .await
            .unwrap(),
        CompletionOutcome::NotFound
    );
    assert_eq!(
        repo.complete(ItemId(1), CallerId(1), Outcome::Skipped)
            .await
            .unwrap(),
        CompletionOutcome::NotClaimed
    );
    assert!(repo.labels_for_item(ItemId(1)).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reset_to_pending_only_affects_locked() {
    let repo = repo_with(&["a", "b"]).await;
    let locked = claim(&repo, CallerId(1)).await.unwrap();
    let done = claim(&repo, CallerId(1)).await.unwrap();
    repo.complete(done.id, CallerId(1), Outcome::Skipped)
        .await
        .unwrap();

    assert_eq!(repo.locked_ids().await.unwrap(), vec![locked.id]);
    assert!(repo.reset_to_pending(locked.id).await.unwrap());
    assert!(!repo.reset_to_pending(done.id).await.unwrap());
    assert_eq!(
        repo.get(done.id).await.unwrap().unwrap().status,
        ItemStatus::Skipped
    );
    assert!(repo.locked_ids().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_global_and_caller_stats() {
    let repo = repo_with(&["a", "b", "c", "d"]).await;
    let a = claim(&repo, CallerId(1)).await.unwrap();
    let b = claim(&repo, CallerId(2)).await.unwrap();
    let c = claim(&repo, CallerId(1)).await.unwrap();
    repo.complete(a.id, CallerId(1), Outcome::rated(1).unwrap())
        .await
        .unwrap();
    repo.complete(b.id, CallerId(2), Outcome::rated(2).unwrap())
        .await
        .unwrap();
    repo.complete(c.id, CallerId(1), Outcome::Skipped)
        .await
        .unwrap();

    let stats = repo.global_stats().await.unwrap();
    assert_eq!(stats.total, 4);
    assert_eq!(stats.labeled, 2);
    assert_eq!(stats.remaining, 1);
    assert_eq!(stats.per_caller.len(), 2);
    assert_eq!(stats.per_caller[0].caller, CallerId(1));
    assert_eq!(stats.per_caller[0].rated, 1);
    assert_eq!(stats.per_caller[1].caller, CallerId(2));

    let mine = repo.caller_stats(CallerId(1)).await.unwrap();
    assert_eq!(mine.rated, 1);
    assert_eq!(mine.skipped, 1);
    assert_eq!(repo.caller_stats(CallerId(3)).await.unwrap().rated, 0);
}

#[tokio::test]
async fn test_corrupt_status_is_reported() {
    let repo = repo_with(&["a"]).await;
    {
        let conn = repo.conn.lock().unwrap();
        // Bypass the CHECK constraint the way a hand-edited database might.
        conn.execute_batch("PRAGMA ignore_check_constraints = ON;")
            .unwrap();
        conn.execute("UPDATE items SET status = 'claimed' WHERE id = 1", [])
            .unwrap();
    }
    let err = repo.get(ItemId(1)).await.unwrap_err();
    assert!(matches!(
        err,
        super::super::RepositoryError::Corruption { .. }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_never_share_an_item() {
    let repo = std::sync::Arc::new(SqliteItemRepository::new_in_memory().unwrap());
    let values: Vec<String> = (0..20).map(|i| format!("item {}", i)).collect();
    repo.insert_items(values).await.unwrap();

    let mut handles = Vec::new();
    for caller in 0..40 {
        let repo = repo.clone();
        handles.push(tokio::spawn(async move {
            let reservation = repo.reserve_pending(CallerId(caller), &[]).await.unwrap()?;
            repo.mark_locked(reservation).await.unwrap()
        }));
    }

    let mut claimed = Vec::new();
    for handle in handles {
        if let Some(item) = handle.await.unwrap() {
            claimed.push(item.id);
        }
    }
    claimed.sort();
    let before = claimed.len();
    claimed.dedup();
    assert_eq!(before, claimed.len(), "an item was claimed twice");
    assert_eq!(claimed.len(), 20);
}
