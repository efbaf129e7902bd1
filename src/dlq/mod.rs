//! Dead letter store.
//!
//! Messages that exhaust their delivery attempts are quarantined here with the last
//! handler error and the delivery count, for inspection, retry or discard.
//!
//! The store is bounded. Inserting into a full store evicts the oldest entry.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

/// Default number of retained entries.
pub const DEFAULT_CAPACITY: usize = 1000;

/// A quarantined message.
#[derive(Debug, Clone, PartialEq)]
pub struct DlqEntry {
    /// Handle for retry and discard.
    pub id: Uuid,
    pub subject: String,
    pub payload: Bytes,
    pub headers: HashMap<String, String>,
    pub event_id: Option<String>,
    /// Durable name of the consumer that gave up.
    pub consumer: String,
    pub error: String,
    pub deliveries: u32,
    pub failed_at: DateTime<Utc>,
}

impl DlqEntry {
    pub fn new(
        subject: impl Into<String>,
        payload: Bytes,
        error: impl Into<String>,
        deliveries: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject: subject.into(),
            payload,
            headers: HashMap::new(),
            event_id: None,
            consumer: String::new(),
            error: error.into(),
            deliveries,
            failed_at: Utc::now(),
        }
    }

    pub fn with_event_id(mut self, event_id: Option<String>) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }
}

/// Bounded FIFO of dead letters, safe for concurrent use.
pub struct DlqStore {
    capacity: usize,
    entries: Mutex<VecDeque<DlqEntry>>,
}

impl Default for DlqStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl DlqStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY))),
        }
    }

    fn entries(&self) -> MutexGuard<'_, VecDeque<DlqEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert an entry, returning the one evicted to make room, if any.
    pub fn push(&self, entry: DlqEntry) -> Option<DlqEntry> {
        if self.capacity == 0 {
            return Some(entry);
        }
        let mut entries = self.entries();
        let evicted = if entries.len() >= self.capacity {
            entries.pop_front()
        } else {
            None
        };
        if let Some(old) = &evicted {
            warn!(id = %old.id, subject = %old.subject, "DLQ full, evicted oldest entry");
        }
        entries.push_back(entry);
        evicted
    }

    /// All entries, oldest first.
    pub fn list(&self) -> Vec<DlqEntry> {
        self.entries().iter().cloned().collect()
    }

    pub fn get(&self, id: Uuid) -> Option<DlqEntry> {
        self.entries().iter().find(|e| e.id == id).cloned()
    }

    /// Remove and return an entry.
    pub fn take(&self, id: Uuid) -> Option<DlqEntry> {
        let mut entries = self.entries();
        let index = entries.iter().position(|e| e.id == id)?;
        entries.remove(index)
    }

    /// Put an entry back at the front, e.g. after a failed retry.
    ///
    /// If the store refilled in the meantime, the oldest other entry is evicted and
    /// returned, as with [`push`](Self::push).
    pub fn restore(&self, entry: DlqEntry) -> Option<DlqEntry> {
        if self.capacity == 0 {
            return Some(entry);
        }
        let mut entries = self.entries();
        let evicted = if entries.len() >= self.capacity {
            entries.pop_front()
        } else {
            None
        };
        if let Some(old) = &evicted {
            warn!(
                id = %old.id,
                subject = %old.subject,
                restored = %entry.id,
                "DLQ full on restore, evicted oldest entry"
            );
        }
        entries.push_front(entry);
        evicted
    }

    /// Drop an entry. Returns false if it was not present.
    pub fn discard(&self, id: Uuid) -> bool {
        self.take(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn clear(&self) {
        self.entries().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(n: usize) -> DlqEntry {
        DlqEntry::new(
            format!("production.orders.n{}", n),
            Bytes::from(n.to_string()),
            "boom",
            3,
        )
    }

    #[test]
    fn test_overflow_evicts_oldest_first() {
        let store = DlqStore::new(3);
        let entries: Vec<DlqEntry> = (0..4).map(entry).collect();
        for e in &entries[..3] {
            assert!(store.push(e.clone()).is_none());
        }

        let evicted = store.push(entries[3].clone()).unwrap();

        assert_eq!(evicted.id, entries[0].id);
        assert_eq!(store.len(), 3);
        let ids: Vec<Uuid> = store.list().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![entries[1].id, entries[2].id, entries[3].id]);
    }

    #[test]
    fn test_take_and_discard() {
        let store = DlqStore::new(10);
        let a = entry(1);
        let b = entry(2);
        store.push(a.clone());
        store.push(b.clone());

        assert_eq!(store.get(a.id), Some(a.clone()));
        assert_eq!(store.take(a.id).unwrap().id, a.id);
        assert!(store.get(a.id).is_none());
        assert!(store.discard(b.id));
        assert!(!store.discard(b.id));
        assert!(store.is_empty());
    }

    #[test]
    fn test_restore_returns_entry_to_front() {
        let store = DlqStore::new(10);
        let a = entry(1);
        let b = entry(2);
        store.push(a.clone());
        store.push(b.clone());

        let taken = store.take(b.id).unwrap();
        store.restore(taken);
        assert_eq!(store.list()[0].id, b.id);
    }

    #[test]
    fn test_restore_into_refilled_store_keeps_restored_entry() {
        let store = DlqStore::new(1);
        let a = entry(1);
        let b = entry(2);
        store.push(a.clone());

        let taken = store.take(a.id).unwrap();
        store.push(b.clone());
        let evicted = store.restore(taken).unwrap();

        assert_eq!(evicted.id, b.id);
        assert_eq!(store.len(), 1);
        assert!(store.get(a.id).is_some());
    }

    #[test]
    fn test_zero_capacity_keeps_nothing() {
        let store = DlqStore::new(0);
        let e = entry(1);
        assert_eq!(store.push(e.clone()).unwrap().id, e.id);
        assert!(store.is_empty());
    }
}
