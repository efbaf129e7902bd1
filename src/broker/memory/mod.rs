//! In-memory broker with JetStream-like semantics.
//!
//! Streams are ordered logs keyed by sequence. Durable pull consumers track a
//! delivery cursor plus the set of delivered-but-unacknowledged messages, each with
//! a delivery count and a redelivery deadline (ack wait, or the nak delay).
//!
//! Single process only. Messages are never expired.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tracing::{debug, info};

use super::{
    Acker, ApiError, ApiErrorCode, Broker, BrokerAdmin, BrokerError, ConnectionEvent, ConsumerSpec,
    PublishAck, PublishOptions, RawMessage, Result, StreamSpec, CONSUMER_NOT_FOUND,
    STREAM_NAME_IN_USE, STREAM_NOT_FOUND, STREAM_SUBJECT_OVERLAP,
};
use crate::subject;

/// Capacity of the connection event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Per-consumer delivery counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub delivered: u64,
    pub acked: u64,
    pub naked: u64,
    pub termed: u64,
    /// Delivered but not yet acked or termed.
    pub pending: usize,
}

struct StoredMessage {
    subject: String,
    payload: Bytes,
    headers: HashMap<String, String>,
}

struct StreamState {
    spec: StreamSpec,
    messages: BTreeMap<u64, StoredMessage>,
    last_sequence: u64,
    msg_ids: HashMap<String, u64>,
}

struct PendingDelivery {
    deliveries: u32,
    redeliver_at: Instant,
}

struct ConsumerState {
    spec: ConsumerSpec,
    /// Highest stream sequence considered for first delivery.
    cursor: u64,
    pending: BTreeMap<u64, PendingDelivery>,
    stats: ConsumerStats,
}

impl ConsumerState {
    fn can_redeliver(&self, delivery: &PendingDelivery) -> bool {
        self.spec.max_deliver <= 0 || i64::from(delivery.deliveries) < self.spec.max_deliver
    }
}

#[derive(Default)]
struct State {
    streams: BTreeMap<String, StreamState>,
    consumers: HashMap<(String, String), ConsumerState>,
    connected: bool,
    draining: bool,
    fail_on_publish: bool,
    fail_admin: Option<ApiError>,
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a test panicked mid-operation; the state is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn settle(&self, stream: &str, durable: &str, sequence: u64, outcome: Settle) -> Result<()> {
        let mut state = self.lock();
        let key = (stream.to_string(), durable.to_string());
        let consumer = state.consumers.get_mut(&key).ok_or_else(|| {
            BrokerError::Ack(format!("consumer '{}' on '{}' is gone", durable, stream))
        })?;
        match outcome {
            Settle::Ack => {
                if consumer.pending.remove(&sequence).is_some() {
                    consumer.stats.acked += 1;
                }
            }
            Settle::Term => {
                if consumer.pending.remove(&sequence).is_some() {
                    consumer.stats.termed += 1;
                }
            }
            Settle::Nak(delay) => {
                if let Some(delivery) = consumer.pending.get_mut(&sequence) {
                    delivery.redeliver_at = Instant::now() + delay;
                    consumer.stats.naked += 1;
                }
            }
        }
        consumer.stats.pending = consumer.pending.len();
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }
}

enum Settle {
    Ack,
    Nak(Duration),
    Term,
}

struct MemoryAcker {
    inner: Arc<Inner>,
    stream: String,
    durable: String,
    sequence: u64,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.inner
            .settle(&self.stream, &self.durable, self.sequence, Settle::Ack)
    }

    async fn nak(&self, delay: Duration) -> Result<()> {
        self.inner
            .settle(&self.stream, &self.durable, self.sequence, Settle::Nak(delay))
    }

    async fn term(&self) -> Result<()> {
        self.inner
            .settle(&self.stream, &self.durable, self.sequence, Settle::Term)
    }
}

/// In-process broker.
///
/// Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let state = State {
            connected: true,
            ..Default::default()
        };
        info!("In-memory broker initialized");
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                notify: Notify::new(),
                events,
            }),
        }
    }

    /// Make every publish fail.
    pub fn set_fail_on_publish(&self, fail: bool) {
        self.inner.lock().fail_on_publish = fail;
    }

    /// Make every admin call fail with the given error, or clear with `None`.
    pub fn set_fail_on_admin(&self, error: Option<ApiError>) {
        self.inner.lock().fail_admin = error;
    }

    /// Simulate a connection loss or recovery.
    pub fn set_connected(&self, connected: bool) {
        let was = {
            let mut state = self.inner.lock();
            std::mem::replace(&mut state.connected, connected)
        };
        let event = match (was, connected) {
            (true, false) => ConnectionEvent::Disconnected,
            (false, true) => ConnectionEvent::Reconnected,
            _ => return,
        };
        let _ = self.inner.events.send(event);
    }

    /// Delivery counters for a durable consumer.
    pub fn consumer_stats(&self, stream: &str, durable: &str) -> Option<ConsumerStats> {
        self.inner
            .lock()
            .consumers
            .get(&(stream.to_string(), durable.to_string()))
            .map(|c| c.stats.clone())
    }

    /// Number of messages stored on a stream.
    pub fn stream_len(&self, stream: &str) -> usize {
        self.inner
            .lock()
            .streams
            .get(stream)
            .map_or(0, |s| s.messages.len())
    }

    fn check_admin(state: &State) -> Result<()> {
        match &state.fail_admin {
            Some(err) => Err(BrokerError::Api(err.clone())),
            None => Ok(()),
        }
    }

    fn stream_not_found(name: &str) -> BrokerError {
        ApiError::not_found(STREAM_NOT_FOUND, format!("stream '{}' not found", name)).into()
    }

    /// Reject subjects that overlap another stream's subjects.
    fn check_overlap(state: &State, spec: &StreamSpec) -> Result<()> {
        for other in state.streams.values().filter(|s| s.spec.name != spec.name) {
            let overlaps = spec.subjects.iter().any(|mine| {
                other
                    .spec
                    .subjects
                    .iter()
                    .any(|theirs| subject::intersects(mine, theirs))
            });
            if overlaps {
                return Err(ApiError::new(
                    Some(400),
                    Some(ApiErrorCode::Numeric(STREAM_SUBJECT_OVERLAP)),
                    format!("subjects overlap with stream '{}'", other.spec.name),
                )
                .into());
            }
        }
        Ok(())
    }

    /// Select the next batch for a consumer. Returns the batch and, when empty, the
    /// earliest instant at which a pending message becomes redeliverable.
    fn take_batch(
        &self,
        state: &mut State,
        stream: &str,
        durable: &str,
        batch: usize,
    ) -> Result<(Vec<RawMessage>, Option<Instant>)> {
        let stream_state = state
            .streams
            .get(stream)
            .ok_or_else(|| Self::stream_not_found(stream))?;
        let consumer = state
            .consumers
            .get_mut(&(stream.to_string(), durable.to_string()))
            .ok_or_else(|| -> BrokerError {
                ApiError::not_found(
                    CONSUMER_NOT_FOUND,
                    format!("consumer '{}' not found", durable),
                )
                .into()
            })?;

        let now = Instant::now();
        let mut selected: Vec<(u64, u32)> = Vec::new();

        // Redeliveries first, in stream order.
        let due: Vec<u64> = consumer
            .pending
            .iter()
            .filter(|(_, d)| d.redeliver_at <= now && consumer.can_redeliver(d))
            .map(|(seq, _)| *seq)
            .take(batch)
            .collect();
        for seq in due {
            if let Some(delivery) = consumer.pending.get_mut(&seq) {
                delivery.deliveries += 1;
                delivery.redeliver_at = now + consumer.spec.ack_wait;
                selected.push((seq, delivery.deliveries));
            }
        }

        // Then new messages past the cursor.
        if selected.len() < batch {
            let mut last_seen = consumer.cursor;
            for (seq, message) in stream_state.messages.range(consumer.cursor + 1..) {
                if selected.len() >= batch {
                    break;
                }
                last_seen = *seq;
                if subject::matches(&consumer.spec.filter_subject, &message.subject) {
                    consumer.pending.insert(
                        *seq,
                        PendingDelivery {
                            deliveries: 1,
                            redeliver_at: now + consumer.spec.ack_wait,
                        },
                    );
                    selected.push((*seq, 1));
                }
            }
            consumer.cursor = last_seen;
        }

        consumer.stats.delivered += selected.len() as u64;
        consumer.stats.pending = consumer.pending.len();

        let messages: Vec<RawMessage> = selected
            .into_iter()
            .filter_map(|(seq, deliveries)| {
                let stored = stream_state.messages.get(&seq)?;
                Some(RawMessage {
                    subject: stored.subject.clone(),
                    payload: stored.payload.clone(),
                    headers: stored.headers.clone(),
                    stream: stream.to_string(),
                    stream_sequence: seq,
                    deliveries,
                    acker: Arc::new(MemoryAcker {
                        inner: self.inner.clone(),
                        stream: stream.to_string(),
                        durable: durable.to_string(),
                        sequence: seq,
                    }),
                })
            })
            .collect();

        let next_wake = consumer
            .pending
            .values()
            .filter(|d| consumer.can_redeliver(d))
            .map(|d| d.redeliver_at)
            .min();

        Ok((messages, next_wake))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(
        &self,
        subject_name: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> Result<PublishAck> {
        if !subject::is_valid(subject_name) || subject::has_wildcard(subject_name) {
            return Err(BrokerError::Publish(format!(
                "invalid subject '{}'",
                subject_name
            )));
        }

        let ack = {
            let mut state = self.inner.lock();
            if state.draining {
                return Err(BrokerError::Connection("connection is draining".to_string()));
            }
            if !state.connected {
                return Err(BrokerError::Connection("not connected".to_string()));
            }
            if state.fail_on_publish {
                return Err(BrokerError::Publish("simulated publish failure".to_string()));
            }

            let stream = state
                .streams
                .values_mut()
                .find(|s| {
                    s.spec
                        .subjects
                        .iter()
                        .any(|pattern| subject::matches(pattern, subject_name))
                })
                .ok_or_else(|| BrokerError::NoStream(subject_name.to_string()))?;

            if let Some(sequence) = options
                .msg_id
                .as_ref()
                .and_then(|id| stream.msg_ids.get(id))
            {
                debug!(subject = %subject_name, sequence, "Duplicate message id suppressed");
                return Ok(PublishAck {
                    stream: stream.spec.name.clone(),
                    sequence: *sequence,
                    duplicate: true,
                });
            }

            stream.last_sequence += 1;
            let sequence = stream.last_sequence;
            let mut headers = options.headers;
            if let Some(id) = options.msg_id {
                headers.insert(crate::envelope::MSG_ID_HEADER.to_string(), id.clone());
                stream.msg_ids.insert(id, sequence);
            }
            stream.messages.insert(
                sequence,
                StoredMessage {
                    subject: subject_name.to_string(),
                    payload,
                    headers,
                },
            );
            PublishAck {
                stream: stream.spec.name.clone(),
                sequence,
                duplicate: false,
            }
        };

        self.inner.notify.notify_waiters();
        Ok(ack)
    }

    async fn pull(
        &self,
        stream: &str,
        durable: &str,
        batch: usize,
        expires: Duration,
    ) -> Result<Vec<RawMessage>> {
        let deadline = Instant::now() + expires;
        let batch = batch.max(1);

        loop {
            // Register interest before inspecting state so a publish in between is not missed.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_wake = {
                let mut state = self.inner.lock();
                if state.draining {
                    return Ok(Vec::new());
                }
                let (messages, next_wake) = self.take_batch(&mut state, stream, durable, batch)?;
                if !messages.is_empty() {
                    return Ok(messages);
                }
                next_wake
            };

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            let wake = next_wake.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn drain(&self) -> Result<()> {
        {
            let mut state = self.inner.lock();
            if state.draining {
                return Ok(());
            }
            state.draining = true;
        }
        self.inner.notify.notify_waiters();
        let _ = self.inner.events.send(ConnectionEvent::Closed);
        info!("In-memory broker drained");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        let state = self.inner.lock();
        state.connected && !state.draining
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }
}

#[async_trait]
impl BrokerAdmin for MemoryBroker {
    async fn list_streams(&self) -> Result<Vec<StreamSpec>> {
        let state = self.inner.lock();
        Self::check_admin(&state)?;
        Ok(state.streams.values().map(|s| s.spec.clone()).collect())
    }

    async fn stream_info(&self, name: &str) -> Result<StreamSpec> {
        let state = self.inner.lock();
        Self::check_admin(&state)?;
        state
            .streams
            .get(name)
            .map(|s| s.spec.clone())
            .ok_or_else(|| Self::stream_not_found(name))
    }

    async fn create_stream(&self, spec: &StreamSpec) -> Result<()> {
        let mut state = self.inner.lock();
        Self::check_admin(&state)?;
        if state.streams.contains_key(&spec.name) {
            return Err(ApiError::new(
                Some(400),
                Some(ApiErrorCode::Numeric(STREAM_NAME_IN_USE)),
                format!("stream name '{}' already in use", spec.name),
            )
            .into());
        }
        Self::check_overlap(&state, spec)?;
        state.streams.insert(
            spec.name.clone(),
            StreamState {
                spec: spec.clone(),
                messages: BTreeMap::new(),
                last_sequence: 0,
                msg_ids: HashMap::new(),
            },
        );
        info!(stream = %spec.name, subjects = ?spec.subjects, "Stream created");
        Ok(())
    }

    async fn update_stream(&self, spec: &StreamSpec) -> Result<()> {
        let mut state = self.inner.lock();
        Self::check_admin(&state)?;
        Self::check_overlap(&state, spec)?;
        let stream = state
            .streams
            .get_mut(&spec.name)
            .ok_or_else(|| Self::stream_not_found(&spec.name))?;
        stream.spec = spec.clone();
        info!(stream = %spec.name, subjects = ?spec.subjects, "Stream updated");
        Ok(())
    }

    async fn consumer_info(&self, stream: &str, durable: &str) -> Result<ConsumerSpec> {
        let state = self.inner.lock();
        Self::check_admin(&state)?;
        if !state.streams.contains_key(stream) {
            return Err(Self::stream_not_found(stream));
        }
        state
            .consumers
            .get(&(stream.to_string(), durable.to_string()))
            .map(|c| c.spec.clone())
            .ok_or_else(|| {
                ApiError::not_found(
                    CONSUMER_NOT_FOUND,
                    format!("consumer '{}' not found", durable),
                )
                .into()
            })
    }

    async fn create_consumer(&self, stream: &str, spec: &ConsumerSpec) -> Result<()> {
        let mut state = self.inner.lock();
        Self::check_admin(&state)?;
        if !state.streams.contains_key(stream) {
            return Err(Self::stream_not_found(stream));
        }
        let key = (stream.to_string(), spec.durable_name.clone());
        match state.consumers.get_mut(&key) {
            Some(existing) => existing.spec = spec.clone(),
            None => {
                state.consumers.insert(
                    key,
                    ConsumerState {
                        spec: spec.clone(),
                        cursor: 0,
                        pending: BTreeMap::new(),
                        stats: ConsumerStats::default(),
                    },
                );
            }
        }
        info!(
            stream = %stream,
            durable = %spec.durable_name,
            filter = %spec.filter_subject,
            "Consumer provisioned"
        );
        Ok(())
    }
}
