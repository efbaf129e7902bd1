use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::*;
use crate::repository::memory::MemoryInboxRepository;

const CONSUMER: &str = "orders";

fn event(id: &str, seq: u64) -> NewInboxEvent {
    NewInboxEvent {
        consumer: CONSUMER.to_string(),
        event_id: Some(id.to_string()),
        stream: "COURIER".to_string(),
        stream_seq: seq,
        subject: "test.orders.order.created".to_string(),
        payload: br#"{"id":1}"#.to_vec(),
    }
}

fn processor() -> (Arc<MemoryInboxRepository>, InboxProcessor) {
    let repo = Arc::new(MemoryInboxRepository::new());
    let processor = InboxProcessor::new(repo.clone()).for_consumer(CONSUMER);
    (repo, processor)
}

#[tokio::test]
async fn test_handler_runs_once_for_repeated_event() {
    let (_, processor) = processor();
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        processor
            .process(
                event("e1", 1),
                |_, calls: Arc<AtomicUsize>| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                calls.clone(),
            )
            .await
            .unwrap();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(processor.is_processed("e1").await.unwrap());
}

#[tokio::test]
async fn test_outcomes_distinguish_first_and_repeat() {
    let (_, processor) = processor();
    let ok = |_: Vec<u8>, _: ()| async { Ok(()) };

    assert_eq!(
        processor.process_outcome(event("e1", 1), ok, ()).await.unwrap(),
        InboxOutcome::Processed
    );
    assert_eq!(
        processor.process_outcome(event("e1", 1), ok, ()).await.unwrap(),
        InboxOutcome::AlreadyProcessed
    );
}

#[tokio::test]
async fn test_handler_receives_payload_and_context() {
    let (_, processor) = processor();
    let seen = std::sync::Mutex::new(None);

    processor
        .process(
            event("e1", 1),
            |payload, ctx: String| {
                *seen.lock().unwrap() = Some((payload, ctx));
                async { Ok(()) }
            },
            "ctx".to_string(),
        )
        .await
        .unwrap();

    let (payload, ctx) = seen.lock().unwrap().take().unwrap();
    assert_eq!(payload, br#"{"id":1}"#.to_vec());
    assert_eq!(ctx, "ctx");
}

#[tokio::test]
async fn test_failure_allows_retry() {
    let (repo, processor) = processor();

    let err = processor
        .process(event("e1", 1), |_, _: ()| async { Err("boom".into()) }, ())
        .await
        .unwrap_err();
    assert!(matches!(err, InboxError::Handler(_)));

    let row = repo.get(CONSUMER, "e1").await.unwrap().unwrap();
    assert_eq!(row.status, InboxStatus::Failed);
    assert_eq!(row.error_message.as_deref(), Some("boom"));

    assert!(processor
        .process(event("e1", 1), |_, _: ()| async { Ok(()) }, ())
        .await
        .unwrap());
    let row = repo.get(CONSUMER, "e1").await.unwrap().unwrap();
    assert_eq!(row.status, InboxStatus::Processed);
    assert_eq!(row.deliveries, 2);
}

#[tokio::test]
async fn test_concurrent_duplicates_run_handler_once() {
    let (_, processor) = processor();
    let processor = Arc::new(processor);
    let calls = Arc::new(AtomicUsize::new(0));

    let run = |processor: Arc<InboxProcessor>, calls: Arc<AtomicUsize>| async move {
        processor
            .process_outcome(
                event("e1", 1),
                |_, calls: Arc<AtomicUsize>| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(())
                },
                calls,
            )
            .await
            .unwrap()
    };

    let (a, b) = tokio::join!(
        tokio::spawn(run(processor.clone(), calls.clone())),
        tokio::spawn(run(processor.clone(), calls.clone())),
    );
    let mut outcomes = vec![a.unwrap(), b.unwrap()];
    outcomes.sort_by_key(|o| *o != InboxOutcome::Processed);

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(outcomes[0], InboxOutcome::Processed);
    assert_ne!(outcomes[1], InboxOutcome::Processed);
    assert!(processor.is_processed("e1").await.unwrap());
}

#[tokio::test]
async fn test_fresh_claim_is_in_flight_until_stale() {
    let (repo, processor) = processor();
    repo.find_or_create(event("e1", 1)).await.unwrap();

    let outcome = processor
        .process_outcome(event("e1", 1), |_, _: ()| async { Ok(()) }, ())
        .await
        .unwrap();
    assert_eq!(outcome, InboxOutcome::InFlight);

    repo.backdate(CONSUMER, "e1", Utc::now() - ChronoDuration::minutes(10));
    let outcome = processor
        .process_outcome(event("e1", 1), |_, _: ()| async { Ok(()) }, ())
        .await
        .unwrap();
    assert_eq!(outcome, InboxOutcome::Processed);
}

#[tokio::test]
async fn test_event_without_id_dedups_on_position() {
    let (_, processor) = processor();
    let calls = Arc::new(AtomicUsize::new(0));
    let anonymous = NewInboxEvent {
        event_id: None,
        ..event("", 42)
    };

    for _ in 0..2 {
        processor
            .process(
                anonymous.clone(),
                |_, calls: Arc<AtomicUsize>| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                calls.clone(),
            )
            .await
            .unwrap();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(processor.is_processed("COURIER:42").await.unwrap());
}

#[tokio::test]
async fn test_reset_stale_and_cleanup() {
    let (repo, processor) = processor();
    repo.find_or_create(event("stuck", 1)).await.unwrap();
    repo.backdate(CONSUMER, "stuck", Utc::now() - ChronoDuration::minutes(30));

    processor
        .process(event("done", 2), |_, _: ()| async { Ok(()) }, ())
        .await
        .unwrap();
    repo.backdate(CONSUMER, "done", Utc::now() - ChronoDuration::days(10));

    assert_eq!(processor.reset_stale(5).await.unwrap(), 1);
    assert_eq!(
        repo.get(CONSUMER, "stuck").await.unwrap().unwrap().status,
        InboxStatus::Failed
    );

    assert_eq!(processor.cleanup(7).await.unwrap(), 1);
    let stats = processor.stats().await.unwrap();
    assert_eq!(stats.processed, 0);
    assert_eq!(stats.failed, 1);
}

#[tokio::test]
async fn test_each_consumer_processes_event_once() {
    let repo = Arc::new(MemoryInboxRepository::new());
    let shared = InboxProcessor::new(repo.clone());
    let billing = shared.for_consumer("billing");
    let shipping = shared.for_consumer("shipping");
    let calls = Arc::new(AtomicUsize::new(0));
    let count = |_: Vec<u8>, calls: Arc<AtomicUsize>| async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok::<_, HandlerError>(())
    };

    for processor in [&billing, &shipping, &billing, &shipping] {
        processor
            .process(event("e1", 1), count, calls.clone())
            .await
            .unwrap();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(billing.is_processed("e1").await.unwrap());
    assert!(shipping.is_processed("e1").await.unwrap());
    assert!(!shared.is_processed("e1").await.unwrap());
    assert_eq!(repo.get("billing", "e1").await.unwrap().unwrap().consumer, "billing");
}
