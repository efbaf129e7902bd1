use std::sync::atomic::{AtomicUsize, Ordering};

use super::*;
use crate::broker::MemoryBroker;
use crate::repository::memory::{MemoryInboxRepository, MemoryOutboxRepository};
use crate::repository::{InboxRepository, NewInboxEvent};

fn event(id: &str) -> NewOutboxEvent {
    NewOutboxEvent::new(id, "test.orders.order.created", b"{}".to_vec())
}

fn publisher() -> (Arc<MemoryOutboxRepository>, OutboxPublisher) {
    let repo = Arc::new(MemoryOutboxRepository::new());
    let publisher = OutboxPublisher::new(repo.clone());
    (repo, publisher)
}

async fn ok(_: OutboxEvent) -> std::result::Result<(), HandlerError> {
    Ok(())
}

async fn fail(_: OutboxEvent) -> std::result::Result<(), HandlerError> {
    Err("broker down".into())
}

#[tokio::test]
async fn test_publish_sends_once() {
    let (repo, publisher) = publisher();
    let sends = AtomicUsize::new(0);
    let counting = |_: OutboxEvent| {
        sends.fetch_add(1, Ordering::SeqCst);
        async { Ok::<(), HandlerError>(()) }
    };

    assert_eq!(
        publisher.publish(event("e1"), counting).await.unwrap(),
        PublishOutcome::Sent
    );
    assert_eq!(
        publisher.publish(event("e1"), counting).await.unwrap(),
        PublishOutcome::AlreadySent
    );

    assert_eq!(sends.load(Ordering::SeqCst), 1);
    let row = repo.get("e1").await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Sent);
    assert_eq!(row.attempts, 1);
    assert!(row.sent_at.is_some());
}

#[tokio::test]
async fn test_send_failure_marks_failed() {
    let (repo, publisher) = publisher();

    let err = publisher.publish(event("e1"), fail).await.unwrap_err();
    match err {
        OutboxError::Send { event_id, source } => {
            assert_eq!(event_id, "e1");
            assert_eq!(source.to_string(), "broker down");
        }
        other => panic!("unexpected error: {other}"),
    }

    let row = repo.get("e1").await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Failed);
    assert_eq!(row.error_message.as_deref(), Some("broker down"));

    // A later publish of the same event claims the failed row again.
    assert_eq!(
        publisher.publish(event("e1"), ok).await.unwrap(),
        PublishOutcome::Sent
    );
    assert_eq!(repo.get("e1").await.unwrap().unwrap().attempts, 2);
}

#[tokio::test]
async fn test_fresh_publishing_row_is_in_flight() {
    let (repo, publisher) = publisher();
    repo.find_or_create(event("e1")).await.unwrap();
    assert!(repo
        .mark_publishing("e1", Utc::now() - ChronoDuration::minutes(5))
        .await
        .unwrap());

    assert_eq!(
        publisher.publish(event("e1"), ok).await.unwrap(),
        PublishOutcome::InFlight
    );
}

#[tokio::test]
async fn test_stale_publishing_row_is_reset_and_resent() {
    let (repo, publisher) = publisher();
    repo.find_or_create(event("e1")).await.unwrap();
    repo.mark_publishing("e1", Utc::now()).await.unwrap();
    repo.backdate("e1", Utc::now() - ChronoDuration::minutes(10));

    assert_eq!(publisher.reset_stale(5).await.unwrap(), 1);
    assert_eq!(
        repo.get("e1").await.unwrap().unwrap().status,
        OutboxStatus::Pending
    );

    let report = publisher.publish_pending(10, ok).await.unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(
        repo.get("e1").await.unwrap().unwrap().status,
        OutboxStatus::Sent
    );
}

#[tokio::test]
async fn test_publish_pending_reports_failures_and_continues() {
    let (_, publisher) = publisher();
    publisher.enqueue(event("bad")).await.unwrap();
    publisher.enqueue(event("good")).await.unwrap();

    let report = publisher
        .publish_pending(10, |row: OutboxEvent| async move {
            if row.event_id == "bad" {
                Err::<(), HandlerError>("rejected".into())
            } else {
                Ok(())
            }
        })
        .await
        .unwrap();

    assert_eq!(report.sent, 1);
    assert_eq!(report.failed, vec![("bad".to_string(), "rejected".to_string())]);

    let stats = publisher.stats().await.unwrap();
    assert_eq!(stats.sent, 1);
    assert_eq!(stats.failed, 1);
}

#[tokio::test]
async fn test_requeue_failed_respects_max_attempts() {
    let (repo, publisher) = publisher();
    let _ = publisher.publish(event("e1"), fail).await;
    let _ = publisher.publish(event("e1"), fail).await;
    assert_eq!(repo.get("e1").await.unwrap().unwrap().attempts, 2);

    assert_eq!(publisher.requeue_failed(2).await.unwrap(), 0);
    assert_eq!(publisher.requeue_failed(3).await.unwrap(), 1);
    assert_eq!(
        repo.get("e1").await.unwrap().unwrap().status,
        OutboxStatus::Pending
    );
}

#[tokio::test]
async fn test_cleanup_removes_old_sent_rows() {
    let (repo, publisher) = publisher();
    publisher.publish(event("old"), ok).await.unwrap();
    publisher.publish(event("new"), ok).await.unwrap();
    repo.backdate("old", Utc::now() - ChronoDuration::days(8));

    assert_eq!(publisher.cleanup(7).await.unwrap(), 1);
    assert!(repo.get("old").await.unwrap().is_none());
    assert!(repo.get("new").await.unwrap().is_some());
}

#[tokio::test]
async fn test_broker_send_fn_provisions_and_dedups() {
    let broker = MemoryBroker::new();
    let topology = Arc::new(TopologyManager::new(Arc::new(broker.clone()), "COURIER"));
    let send = broker_send_fn(Arc::new(broker.clone()), topology);

    let (row, _) = MemoryOutboxRepository::new()
        .find_or_create(event("e1").with_header("Courier-Trace-Id", "t1"))
        .await
        .unwrap();
    send(row.clone()).await.unwrap();
    send(row).await.unwrap();

    assert_eq!(broker.stream_len("COURIER"), 1);
}

#[tokio::test]
async fn test_sweeper_run_once_redrives_and_maintains_inbox() {
    let (repo, publisher) = publisher();
    let publisher = Arc::new(publisher);
    let _ = publisher.publish(event("e1"), fail).await;

    let inbox_repo = Arc::new(MemoryInboxRepository::new());
    inbox_repo
        .find_or_create(NewInboxEvent {
            consumer: "orders".to_string(),
            event_id: Some("in-1".to_string()),
            stream: "COURIER".to_string(),
            stream_seq: 1,
            subject: "test.orders.order.created".to_string(),
            payload: Vec::new(),
        })
        .await
        .unwrap();
    inbox_repo.backdate("orders", "in-1", Utc::now() - ChronoDuration::minutes(30));
    let inbox = Arc::new(InboxProcessor::new(inbox_repo.clone()));

    let sent = Arc::new(AtomicUsize::new(0));
    let counter = sent.clone();
    let send: SendFn = Arc::new(move |_: OutboxEvent| -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        counter.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    });

    let sweeper = OutboxSweeper::new(publisher, send, OutboxConfig::default())
        .with_inbox(inbox, InboxConfig::default());
    let report = sweeper.run_once().await;

    assert_eq!(report.requeued, 1);
    assert_eq!(report.batch.sent, 1);
    assert_eq!(report.inbox_reset, 1);
    assert_eq!(sent.load(Ordering::SeqCst), 1);
    assert_eq!(
        repo.get("e1").await.unwrap().unwrap().status,
        OutboxStatus::Sent
    );
}

#[tokio::test]
async fn test_spawned_sweeper_stops_on_shutdown() {
    let (_, publisher) = publisher();
    let send: SendFn = Arc::new(
        |_: OutboxEvent| -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
            Box::pin(async { Ok(()) })
        },
    );
    let config = OutboxConfig {
        sweep_interval_secs: 3600,
        ..OutboxConfig::default()
    };

    let handle = spawn_outbox_sweeper(OutboxSweeper::new(Arc::new(publisher), send, config));
    tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
        .await
        .expect("sweeper should stop promptly");
}
