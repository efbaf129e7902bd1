//! SQLite outbox and inbox repository contract tests.
//!
//! Each test runs against a private in-memory database. A single pooled
//! connection keeps the in-memory database alive for the whole test.

use chrono::{Duration, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use courier::repository::{
    InboxRepository, InboxStatus, NewInboxEvent, NewOutboxEvent, OutboxRepository, OutboxStatus,
    SqliteInboxRepository, SqliteOutboxRepository,
};

async fn pool() -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite")
}

async fn outbox() -> SqliteOutboxRepository {
    let repo = SqliteOutboxRepository::new(pool().await);
    repo.init().await.unwrap();
    repo
}

async fn inbox() -> SqliteInboxRepository {
    let repo = SqliteInboxRepository::new(pool().await);
    repo.init().await.unwrap();
    repo
}

fn outgoing(id: &str) -> NewOutboxEvent {
    NewOutboxEvent::new(id, "test.courier.order.created", br#"{"id":1}"#.to_vec())
}

const CONSUMER: &str = "orders";

fn incoming(event_id: Option<&str>, seq: u64) -> NewInboxEvent {
    NewInboxEvent {
        consumer: CONSUMER.to_string(),
        event_id: event_id.map(str::to_string),
        stream: "COURIER".to_string(),
        stream_seq: seq,
        subject: "test.courier.order.created".to_string(),
        payload: b"{}".to_vec(),
    }
}

fn later() -> chrono::DateTime<Utc> {
    Utc::now() + Duration::minutes(1)
}

// ============================================================================
// Outbox
// ============================================================================

#[tokio::test]
async fn outbox_find_or_create_is_idempotent() {
    let repo = outbox().await;

    let (first, created) = repo
        .find_or_create(outgoing("e1").with_header("Courier-Trace-Id", "t1"))
        .await
        .unwrap();
    assert!(created);
    assert_eq!(first.status, OutboxStatus::Pending);
    assert_eq!(first.attempts, 0);
    assert_eq!(first.payload, br#"{"id":1}"#.to_vec());
    assert_eq!(
        first.headers.get("Courier-Trace-Id").map(String::as_str),
        Some("t1")
    );

    let (second, created) = repo.find_or_create(outgoing("e1")).await.unwrap();
    assert!(!created);
    assert_eq!(second.event_id, "e1");
    assert_eq!(repo.count_by_status().await.unwrap().total(), 1);
}

#[tokio::test]
async fn outbox_claim_is_exclusive_until_stale() {
    let repo = outbox().await;
    repo.find_or_create(outgoing("e1")).await.unwrap();

    let stale_before = Utc::now() - Duration::minutes(5);
    assert!(repo.mark_publishing("e1", stale_before).await.unwrap());
    assert!(!repo.mark_publishing("e1", stale_before).await.unwrap());

    // With a cutoff in the future the fresh claim counts as stale.
    assert!(repo.mark_publishing("e1", later()).await.unwrap());
    assert_eq!(repo.get("e1").await.unwrap().unwrap().attempts, 2);
}

#[tokio::test]
async fn outbox_claim_of_unknown_row_is_not_found() {
    let repo = outbox().await;
    assert!(repo.mark_publishing("missing", Utc::now()).await.is_err());
    assert!(repo.mark_as_sent("missing").await.is_err());
}

#[tokio::test]
async fn outbox_sent_row_is_never_reclaimed() {
    let repo = outbox().await;
    repo.find_or_create(outgoing("e1")).await.unwrap();
    repo.mark_publishing("e1", Utc::now()).await.unwrap();
    repo.mark_as_sent("e1").await.unwrap();

    let row = repo.get("e1").await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Sent);
    assert!(row.sent_at.is_some());
    assert!(!repo.mark_publishing("e1", later()).await.unwrap());
}

#[tokio::test]
async fn outbox_failed_rows_requeue_below_max_attempts() {
    let repo = outbox().await;
    repo.find_or_create(outgoing("e1")).await.unwrap();
    repo.mark_publishing("e1", Utc::now()).await.unwrap();
    repo.mark_as_failed("e1", "broker down").await.unwrap();

    let row = repo.get("e1").await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Failed);
    assert_eq!(row.error_message.as_deref(), Some("broker down"));
    assert!(repo.find_pending(10).await.unwrap().is_empty());

    assert_eq!(repo.requeue_failed(1).await.unwrap(), 0);
    assert_eq!(repo.requeue_failed(2).await.unwrap(), 1);
    let pending = repo.find_pending(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].event_id, "e1");
}

#[tokio::test]
async fn outbox_find_pending_is_oldest_first_and_limited() {
    let repo = outbox().await;
    for id in ["a", "b", "c"] {
        repo.find_or_create(outgoing(id)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }

    let ids: Vec<String> = repo
        .find_pending(2)
        .await
        .unwrap()
        .into_iter()
        .map(|row| row.event_id)
        .collect();
    assert_eq!(ids, vec!["a", "b"]);
}

#[tokio::test]
async fn outbox_reset_stale_and_cleanup() {
    let repo = outbox().await;
    repo.find_or_create(outgoing("stuck")).await.unwrap();
    repo.mark_publishing("stuck", Utc::now()).await.unwrap();
    repo.find_or_create(outgoing("done")).await.unwrap();
    repo.mark_publishing("done", Utc::now()).await.unwrap();
    repo.mark_as_sent("done").await.unwrap();

    assert_eq!(repo.reset_stale(Utc::now() - Duration::minutes(5)).await.unwrap(), 0);
    assert_eq!(repo.reset_stale(later()).await.unwrap(), 1);
    assert_eq!(
        repo.get("stuck").await.unwrap().unwrap().status,
        OutboxStatus::Pending
    );

    assert_eq!(repo.cleanup(Utc::now() - Duration::days(7)).await.unwrap(), 0);
    assert_eq!(repo.cleanup(later()).await.unwrap(), 1);
    assert!(repo.get("done").await.unwrap().is_none());

    let stats = repo.count_by_status().await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.sent, 0);
}

// ============================================================================
// Inbox
// ============================================================================

#[tokio::test]
async fn inbox_dedups_by_event_id() {
    let repo = inbox().await;

    let (row, created) = repo.find_or_create(incoming(Some("e1"), 1)).await.unwrap();
    assert!(created);
    assert_eq!(row.status, InboxStatus::Processing);
    assert_eq!(row.deliveries, 1);

    // Same event stored again at a later stream position.
    let (row, created) = repo.find_or_create(incoming(Some("e1"), 2)).await.unwrap();
    assert!(!created);
    assert_eq!(row.stream_seq, 1);
}

#[tokio::test]
async fn inbox_dedups_by_stream_position() {
    let repo = inbox().await;

    let (row, created) = repo.find_or_create(incoming(None, 9)).await.unwrap();
    assert!(created);
    assert_eq!(row.event_id, "COURIER:9");

    // A different id at an already-recorded position resolves to the existing row.
    let (row, created) = repo.find_or_create(incoming(Some("late-id"), 9)).await.unwrap();
    assert!(!created);
    assert_eq!(row.event_id, "COURIER:9");
}

#[tokio::test]
async fn inbox_claims_failed_and_stale_rows_only() {
    let repo = inbox().await;
    repo.find_or_create(incoming(Some("e1"), 1)).await.unwrap();

    let fresh = Utc::now() - Duration::minutes(5);
    assert!(repo.try_claim(CONSUMER, "e1", fresh).await.unwrap().is_none());

    repo.mark_as_failed(CONSUMER, "e1", "boom").await.unwrap();
    let claimed = repo.try_claim(CONSUMER, "e1", fresh).await.unwrap().unwrap();
    assert_eq!(claimed.status, InboxStatus::Processing);
    assert_eq!(claimed.deliveries, 2);

    repo.mark_as_processed(CONSUMER, "e1").await.unwrap();
    let row = repo.get(CONSUMER, "e1").await.unwrap().unwrap();
    assert_eq!(row.status, InboxStatus::Processed);
    assert!(row.processed_at.is_some());
    assert!(row.error_message.is_none());
    assert!(repo.try_claim(CONSUMER, "e1", later()).await.unwrap().is_none());
}

#[tokio::test]
async fn inbox_reset_stale_cleanup_and_stats() {
    let repo = inbox().await;
    repo.find_or_create(incoming(Some("stuck"), 1)).await.unwrap();
    repo.find_or_create(incoming(Some("done"), 2)).await.unwrap();
    repo.mark_as_processed(CONSUMER, "done").await.unwrap();

    assert_eq!(repo.reset_stale(later()).await.unwrap(), 1);
    let stuck = repo.get(CONSUMER, "stuck").await.unwrap().unwrap();
    assert_eq!(stuck.status, InboxStatus::Failed);

    let stats = repo.count_by_status().await.unwrap();
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.processing, 0);

    assert_eq!(repo.cleanup(Utc::now() - Duration::days(1)).await.unwrap(), 0);
    assert_eq!(repo.cleanup(later()).await.unwrap(), 2);
    assert_eq!(repo.count_by_status().await.unwrap().total(), 0);
}

#[tokio::test]
async fn inbox_rows_are_scoped_per_consumer() {
    let repo = inbox().await;
    repo.find_or_create(incoming(Some("e1"), 1)).await.unwrap();
    repo.mark_as_processed(CONSUMER, "e1").await.unwrap();

    let other = NewInboxEvent {
        consumer: "shipping".to_string(),
        ..incoming(Some("e1"), 1)
    };
    let (row, created) = repo.find_or_create(other).await.unwrap();
    assert!(created);
    assert_eq!(row.consumer, "shipping");
    assert_eq!(row.status, InboxStatus::Processing);

    repo.mark_as_failed("shipping", "e1", "label printer jammed")
        .await
        .unwrap();
    assert_eq!(
        repo.get(CONSUMER, "e1").await.unwrap().unwrap().status,
        InboxStatus::Processed
    );
    let stats = repo.count_by_status().await.unwrap();
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.failed, 1);
}

#[tokio::test]
async fn inbox_status_updates_run_on_spawned_tasks() {
    let repo = std::sync::Arc::new(inbox().await);
    repo.find_or_create(incoming(Some("e1"), 1)).await.unwrap();
    repo.find_or_create(incoming(Some("e2"), 2)).await.unwrap();

    let failed = tokio::spawn({
        let repo = repo.clone();
        async move { repo.mark_as_failed(CONSUMER, "e1", "boom").await }
    });
    let processed = tokio::spawn({
        let repo = repo.clone();
        async move { repo.mark_as_processed(CONSUMER, "e2").await }
    });
    failed.await.unwrap().unwrap();
    processed.await.unwrap().unwrap();

    let stats = repo.count_by_status().await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.processed, 1);
}
