//! In-memory repositories.
//!
//! Each repository holds one mutex over its rows, so every operation is atomic.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    InboxEvent, InboxRepository, InboxStats, InboxStatus, NewInboxEvent, NewOutboxEvent,
    OutboxEvent, OutboxRepository, OutboxStats, OutboxStatus, Result, StorageError,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// Outbox
// ============================================================================

/// Outbox rows keyed by event id.
#[derive(Default)]
pub struct MemoryOutboxRepository {
    rows: Mutex<HashMap<String, OutboxEvent>>,
}

impl MemoryOutboxRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a row's last-update time. Test hook for staleness.
    pub fn backdate(&self, event_id: &str, updated_at: DateTime<Utc>) {
        if let Some(row) = lock(&self.rows).get_mut(event_id) {
            row.updated_at = updated_at;
            if row.sent_at.is_some() {
                row.sent_at = Some(updated_at);
            }
        }
    }

    fn update<F>(&self, event_id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut OutboxEvent),
    {
        let mut rows = lock(&self.rows);
        let row = rows
            .get_mut(event_id)
            .ok_or_else(|| StorageError::NotFound(event_id.to_string()))?;
        f(row);
        Ok(())
    }
}

#[async_trait]
impl OutboxRepository for MemoryOutboxRepository {
    async fn find_or_create(&self, event: NewOutboxEvent) -> Result<(OutboxEvent, bool)> {
        let mut rows = lock(&self.rows);
        if let Some(existing) = rows.get(&event.event_id) {
            return Ok((existing.clone(), false));
        }
        let row = OutboxEvent::from_new(event, Utc::now());
        rows.insert(row.event_id.clone(), row.clone());
        Ok((row, true))
    }

    async fn get(&self, event_id: &str) -> Result<Option<OutboxEvent>> {
        Ok(lock(&self.rows).get(event_id).cloned())
    }

    async fn mark_publishing(&self, event_id: &str, stale_before: DateTime<Utc>) -> Result<bool> {
        let mut rows = lock(&self.rows);
        let row = rows
            .get_mut(event_id)
            .ok_or_else(|| StorageError::NotFound(event_id.to_string()))?;
        let claimable = match row.status {
            OutboxStatus::Pending | OutboxStatus::Failed => true,
            OutboxStatus::Publishing => row.updated_at < stale_before,
            OutboxStatus::Sent => false,
        };
        if claimable {
            row.status = OutboxStatus::Publishing;
            row.attempts += 1;
            row.updated_at = Utc::now();
        }
        Ok(claimable)
    }

    async fn mark_as_sent(&self, event_id: &str) -> Result<()> {
        self.update(event_id, |row| {
            let now = Utc::now();
            row.status = OutboxStatus::Sent;
            row.error_message = None;
            row.updated_at = now;
            row.sent_at = Some(now);
        })
    }

    async fn mark_as_failed(&self, event_id: &str, error: &str) -> Result<()> {
        self.update(event_id, |row| {
            row.status = OutboxStatus::Failed;
            row.error_message = Some(error.to_string());
            row.updated_at = Utc::now();
        })
    }

    async fn find_pending(&self, limit: usize) -> Result<Vec<OutboxEvent>> {
        let rows = lock(&self.rows);
        let mut pending: Vec<OutboxEvent> = rows
            .values()
            .filter(|r| r.status == OutboxStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            a.enqueued_at
                .cmp(&b.enqueued_at)
                .then_with(|| a.event_id.cmp(&b.event_id))
        });
        pending.truncate(limit);
        Ok(pending)
    }

    async fn requeue_failed(&self, max_attempts: u32) -> Result<u64> {
        let mut rows = lock(&self.rows);
        let now = Utc::now();
        let mut count = 0;
        for row in rows
            .values_mut()
            .filter(|r| r.status == OutboxStatus::Failed && r.attempts < max_attempts)
        {
            row.status = OutboxStatus::Pending;
            row.updated_at = now;
            count += 1;
        }
        Ok(count)
    }

    async fn reset_stale(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut rows = lock(&self.rows);
        let now = Utc::now();
        let mut count = 0;
        for row in rows
            .values_mut()
            .filter(|r| r.status == OutboxStatus::Publishing && r.updated_at < cutoff)
        {
            row.status = OutboxStatus::Pending;
            row.updated_at = now;
            count += 1;
        }
        Ok(count)
    }

    async fn cleanup(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut rows = lock(&self.rows);
        let before = rows.len();
        rows.retain(|_, r| {
            !(r.status == OutboxStatus::Sent && r.sent_at.is_some_and(|at| at < cutoff))
        });
        Ok((before - rows.len()) as u64)
    }

    async fn count_by_status(&self) -> Result<OutboxStats> {
        let mut stats = OutboxStats::default();
        for row in lock(&self.rows).values() {
            stats.add(row.status, 1);
        }
        Ok(stats)
    }
}

// ============================================================================
// Inbox
// ============================================================================

type RowKey = (String, String);

#[derive(Default)]
struct InboxRows {
    by_key: HashMap<RowKey, InboxEvent>,
    by_position: HashMap<(String, String, u64), String>,
}

fn row_key(consumer: &str, key: &str) -> RowKey {
    (consumer.to_string(), key.to_string())
}

/// Inbox rows keyed by `(consumer, key)`, with a unique `(consumer, stream, stream_seq)`
/// index.
#[derive(Default)]
pub struct MemoryInboxRepository {
    rows: Mutex<InboxRows>,
}

impl MemoryInboxRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a row's last-update time. Test hook for staleness.
    pub fn backdate(&self, consumer: &str, key: &str, updated_at: DateTime<Utc>) {
        if let Some(row) = lock(&self.rows).by_key.get_mut(&row_key(consumer, key)) {
            row.updated_at = updated_at;
        }
    }

    fn update<F>(&self, consumer: &str, key: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut InboxEvent),
    {
        let mut rows = lock(&self.rows);
        let row = rows
            .by_key
            .get_mut(&row_key(consumer, key))
            .ok_or_else(|| StorageError::NotFound(format!("{}/{}", consumer, key)))?;
        f(row);
        Ok(())
    }
}

#[async_trait]
impl InboxRepository for MemoryInboxRepository {
    async fn find_or_create(&self, event: NewInboxEvent) -> Result<(InboxEvent, bool)> {
        let mut rows = lock(&self.rows);
        let key = row_key(&event.consumer, &event.key());
        if let Some(existing) = rows.by_key.get(&key) {
            return Ok((existing.clone(), false));
        }
        let position = (event.consumer.clone(), event.stream.clone(), event.stream_seq);
        if let Some(existing) = rows
            .by_position
            .get(&position)
            .and_then(|k| rows.by_key.get(&row_key(&event.consumer, k)))
        {
            return Ok((existing.clone(), false));
        }

        let row = InboxEvent::from_new(event, Utc::now());
        rows.by_position.insert(position, key.1.clone());
        rows.by_key.insert(key, row.clone());
        Ok((row, true))
    }

    async fn get(&self, consumer: &str, key: &str) -> Result<Option<InboxEvent>> {
        Ok(lock(&self.rows).by_key.get(&row_key(consumer, key)).cloned())
    }

    async fn try_claim(
        &self,
        consumer: &str,
        key: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<InboxEvent>> {
        let mut rows = lock(&self.rows);
        let Some(row) = rows.by_key.get_mut(&row_key(consumer, key)) else {
            return Ok(None);
        };
        let claimable = match row.status {
            InboxStatus::Failed => true,
            InboxStatus::Processing => row.updated_at < stale_before,
            InboxStatus::Processed => false,
        };
        if !claimable {
            return Ok(None);
        }
        row.status = InboxStatus::Processing;
        row.deliveries += 1;
        row.updated_at = Utc::now();
        Ok(Some(row.clone()))
    }

    async fn mark_as_processed(&self, consumer: &str, key: &str) -> Result<()> {
        self.update(consumer, key, |row| {
            let now = Utc::now();
            row.status = InboxStatus::Processed;
            row.error_message = None;
            row.updated_at = now;
            row.processed_at = Some(now);
        })
    }

    async fn mark_as_failed(&self, consumer: &str, key: &str, error: &str) -> Result<()> {
        self.update(consumer, key, |row| {
            row.status = InboxStatus::Failed;
            row.error_message = Some(error.to_string());
            row.updated_at = Utc::now();
        })
    }

    async fn reset_stale(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut rows = lock(&self.rows);
        let now = Utc::now();
        let mut count = 0;
        for row in rows
            .by_key
            .values_mut()
            .filter(|r| r.status == InboxStatus::Processing && r.updated_at < cutoff)
        {
            row.status = InboxStatus::Failed;
            row.error_message = Some("processing timed out".to_string());
            row.updated_at = now;
            count += 1;
        }
        Ok(count)
    }

    async fn cleanup(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut rows = lock(&self.rows);
        let expired: Vec<(RowKey, (String, String, u64))> = rows
            .by_key
            .values()
            .filter(|r| r.status != InboxStatus::Processing && r.updated_at < cutoff)
            .map(|r| {
                (
                    row_key(&r.consumer, &r.event_id),
                    (r.consumer.clone(), r.stream.clone(), r.stream_seq),
                )
            })
            .collect();
        for (key, position) in &expired {
            rows.by_key.remove(key);
            rows.by_position.remove(position);
        }
        Ok(expired.len() as u64)
    }

    async fn count_by_status(&self) -> Result<InboxStats> {
        let mut stats = InboxStats::default();
        for row in lock(&self.rows).by_key.values() {
            stats.add(row.status, 1);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const CONSUMER: &str = "billing";

    fn inbox_event(event_id: Option<&str>, seq: u64) -> NewInboxEvent {
        NewInboxEvent {
            consumer: CONSUMER.to_string(),
            event_id: event_id.map(str::to_string),
            stream: "COURIER".to_string(),
            stream_seq: seq,
            subject: "production.orders.created".to_string(),
            payload: b"{}".to_vec(),
        }
    }

    #[tokio::test]
    async fn test_outbox_find_or_create_is_idempotent() {
        let repo = MemoryOutboxRepository::new();
        let event = NewOutboxEvent::new("order-1", "production.orders.created", b"{}".to_vec());

        let (first, created) = repo.find_or_create(event.clone()).await.unwrap();
        assert!(created);
        assert_eq!(first.status, OutboxStatus::Pending);

        let (second, created) = repo.find_or_create(event).await.unwrap();
        assert!(!created);
        assert_eq!(second.enqueued_at, first.enqueued_at);
    }

    #[tokio::test]
    async fn test_outbox_mark_publishing_is_exclusive() {
        let repo = MemoryOutboxRepository::new();
        repo.find_or_create(NewOutboxEvent::new("e1", "production.a.b", Vec::new()))
            .await
            .unwrap();
        let long_ago = Utc::now() - Duration::hours(1);

        assert!(repo.mark_publishing("e1", long_ago).await.unwrap());
        assert!(!repo.mark_publishing("e1", long_ago).await.unwrap());

        // Stale claims may be taken over.
        assert!(repo
            .mark_publishing("e1", Utc::now() + Duration::minutes(1))
            .await
            .unwrap());
        assert_eq!(repo.get("e1").await.unwrap().unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn test_outbox_sent_rows_are_not_reclaimed() {
        let repo = MemoryOutboxRepository::new();
        repo.find_or_create(NewOutboxEvent::new("e1", "production.a.b", Vec::new()))
            .await
            .unwrap();
        repo.mark_as_sent("e1").await.unwrap();
        assert!(!repo
            .mark_publishing("e1", Utc::now() + Duration::minutes(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_outbox_requeue_respects_max_attempts() {
        let repo = MemoryOutboxRepository::new();
        for id in ["a", "b"] {
            repo.find_or_create(NewOutboxEvent::new(id, "production.a.b", Vec::new()))
                .await
                .unwrap();
        }
        let past = Utc::now() - Duration::hours(1);
        repo.mark_publishing("a", past).await.unwrap();
        repo.mark_as_failed("a", "boom").await.unwrap();
        for _ in 0..3 {
            repo.mark_publishing("b", past).await.unwrap();
            repo.mark_as_failed("b", "boom").await.unwrap();
        }

        assert_eq!(repo.requeue_failed(3).await.unwrap(), 1);
        assert_eq!(repo.get("a").await.unwrap().unwrap().status, OutboxStatus::Pending);
        assert_eq!(repo.get("b").await.unwrap().unwrap().status, OutboxStatus::Failed);
    }

    #[tokio::test]
    async fn test_outbox_cleanup_only_removes_old_sent_rows() {
        let repo = MemoryOutboxRepository::new();
        for id in ["old", "new", "pending"] {
            repo.find_or_create(NewOutboxEvent::new(id, "production.a.b", Vec::new()))
                .await
                .unwrap();
        }
        repo.mark_as_sent("old").await.unwrap();
        repo.mark_as_sent("new").await.unwrap();
        repo.backdate("old", Utc::now() - Duration::days(10));

        let removed = repo.cleanup(Utc::now() - Duration::days(7)).await.unwrap();
        assert_eq!(removed, 1);
        let stats = repo.count_by_status().await.unwrap();
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.pending, 1);
    }

    #[tokio::test]
    async fn test_inbox_position_is_unique() {
        let repo = MemoryInboxRepository::new();
        let (first, created) = repo.find_or_create(inbox_event(None, 3)).await.unwrap();
        assert!(created);
        assert_eq!(first.event_id, "COURIER:3");

        // A different key at the same position resolves to the existing row.
        let (second, created) = repo
            .find_or_create(inbox_event(Some("x"), 3))
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(second.event_id, "COURIER:3");
    }

    #[tokio::test]
    async fn test_inbox_rows_are_scoped_per_consumer() {
        let repo = MemoryInboxRepository::new();
        repo.find_or_create(inbox_event(Some("e1"), 1)).await.unwrap();
        repo.mark_as_processed(CONSUMER, "e1").await.unwrap();

        let other = NewInboxEvent {
            consumer: "shipping".to_string(),
            ..inbox_event(Some("e1"), 1)
        };
        let (row, created) = repo.find_or_create(other).await.unwrap();
        assert!(created);
        assert_eq!(row.consumer, "shipping");
        assert_eq!(row.status, InboxStatus::Processing);
        assert_eq!(repo.count_by_status().await.unwrap().total(), 2);
    }

    #[tokio::test]
    async fn test_inbox_claim_rules() {
        let repo = MemoryInboxRepository::new();
        repo.find_or_create(inbox_event(Some("e1"), 1)).await.unwrap();
        let past = Utc::now() - Duration::hours(1);

        // Fresh processing row is owned by its creator.
        assert!(repo.try_claim(CONSUMER, "e1", past).await.unwrap().is_none());

        repo.mark_as_failed(CONSUMER, "e1", "boom").await.unwrap();
        let claimed = repo.try_claim(CONSUMER, "e1", past).await.unwrap().unwrap();
        assert_eq!(claimed.deliveries, 2);
        assert_eq!(claimed.status, InboxStatus::Processing);

        repo.mark_as_processed(CONSUMER, "e1").await.unwrap();
        assert!(repo
            .try_claim(CONSUMER, "e1", Utc::now() + Duration::minutes(1))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_inbox_reset_stale_and_cleanup() {
        let repo = MemoryInboxRepository::new();
        repo.find_or_create(inbox_event(Some("stuck"), 1)).await.unwrap();
        repo.find_or_create(inbox_event(Some("done"), 2)).await.unwrap();
        repo.mark_as_processed(CONSUMER, "done").await.unwrap();
        repo.backdate(CONSUMER, "stuck", Utc::now() - Duration::hours(2));
        repo.backdate(CONSUMER, "done", Utc::now() - Duration::days(30));

        assert_eq!(
            repo.reset_stale(Utc::now() - Duration::hours(1)).await.unwrap(),
            1
        );
        assert_eq!(
            repo.get(CONSUMER, "stuck").await.unwrap().unwrap().status,
            InboxStatus::Failed
        );

        assert_eq!(repo.cleanup(Utc::now() - Duration::days(7)).await.unwrap(), 1);
        assert!(repo.get(CONSUMER, "done").await.unwrap().is_none());

        // The position index was released with the row.
        let (_, created) = repo.find_or_create(inbox_event(None, 2)).await.unwrap();
        assert!(created);
    }
}
