//! In-process queue and lock store.
//!
//! [`MemoryQueue`] mimics the JetStream behaviour the engine relies on: ack
//! wait redelivery, nak delays, `working` resetting the ack deadline,
//! max-deliver and message-id deduplication. [`MemoryLockStore`] mimics the
//! Redis commands used by the scheduler. Both run on tokio time, so paused
//! clocks in tests drive them deterministically.
//!
//! Cloning either type creates a new handle to the same underlying state.

use crate::config::{ConsumerSettings, Retention, StreamSettings};
use crate::error::JobsError;
use crate::lock::LockStore;
use crate::queue::{
    AckOutcome, ConsumerSummary, JobMessage, JobQueue, MessageAcker, MessageInfo, PullConsumer,
    Publisher, MSG_ID_HEADER,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Duplicate window used when a stream does not set one.
pub const DEFAULT_DUPLICATE_WINDOW: Duration = Duration::from_secs(120);

const PULL_POLL_STEP: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryState {
    Available { not_before: Instant },
    InFlight { deadline: Instant },
    Acked,
}

#[derive(Debug, Clone)]
struct Delivery {
    count: u64,
    state: DeliveryState,
}

#[derive(Debug)]
struct ConsumerState {
    summary: ConsumerSummary,
    filter_subject: Option<String>,
    deliveries: HashMap<u64, Delivery>,
    next_consumer_seq: u64,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    subject: String,
    payload: Bytes,
    headers: HashMap<String, String>,
}

#[derive(Debug)]
struct StreamState {
    settings: StreamSettings,
    messages: BTreeMap<u64, StoredMessage>,
    last_seq: u64,
    msg_ids: HashMap<String, (u64, Instant)>,
    consumers: HashMap<String, ConsumerState>,
}

impl StreamState {
    fn captures(&self, subject: &str) -> bool {
        self.settings
            .subjects
            .iter()
            .any(|pattern| subject_matches(pattern, subject))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    streams: HashMap<String, StreamState>,
    stream_creates: HashMap<String, usize>,
    consumer_creates: HashMap<(String, String), usize>,
    published: HashMap<String, Vec<Bytes>>,
    pulls: HashMap<String, Vec<Instant>>,
    working_calls: HashMap<(String, u64), usize>,
    naks: HashMap<String, Vec<(u64, Duration)>>,
    fail_acks: bool,
    fail_ensure_stream: bool,
    closed: bool,
}

/// In-memory work queue.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A panic while holding the lock cannot leave the state half-updated
        // in a way later readers care about.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every ack report [`AckOutcome::Unconfirmed`].
    pub fn set_fail_acks(&self, fail: bool) {
        self.lock().fail_acks = fail;
    }

    /// Make `ensure_stream` fail.
    pub fn set_fail_ensure_stream(&self, fail: bool) {
        self.lock().fail_ensure_stream = fail;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// How many times a stream was actually created.
    pub fn stream_creates(&self, stream: &str) -> usize {
        self.lock().stream_creates.get(stream).copied().unwrap_or(0)
    }

    /// How many times a consumer was actually created.
    pub fn consumer_creates(&self, stream: &str, durable: &str) -> usize {
        self.lock()
            .consumer_creates
            .get(&(stream.to_string(), durable.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Payloads accepted by `stream`, in publish order, duplicates excluded.
    pub fn published(&self, stream: &str) -> Vec<Bytes> {
        self.lock().published.get(stream).cloned().unwrap_or_default()
    }

    /// Instants at which pulls were issued against `stream`.
    pub fn pulls(&self, stream: &str) -> Vec<Instant> {
        self.lock().pulls.get(stream).cloned().unwrap_or_default()
    }

    pub fn working_calls(&self, stream: &str, stream_sequence: u64) -> usize {
        self.lock()
            .working_calls
            .get(&(stream.to_string(), stream_sequence))
            .copied()
            .unwrap_or(0)
    }

    /// Naks received on `stream` as `(stream_sequence, delay)`.
    pub fn naks(&self, stream: &str) -> Vec<(u64, Duration)> {
        self.lock().naks.get(stream).cloned().unwrap_or_default()
    }

    /// Number of times a message was delivered to `durable`.
    pub fn delivery_count(&self, stream: &str, durable: &str, stream_sequence: u64) -> u64 {
        self.lock()
            .streams
            .get(stream)
            .and_then(|s| s.consumers.get(durable))
            .and_then(|c| c.deliveries.get(&stream_sequence))
            .map(|d| d.count)
            .unwrap_or(0)
    }

    /// Whether `durable` acknowledged the message.
    pub fn is_acked(&self, stream: &str, durable: &str, stream_sequence: u64) -> bool {
        self.lock()
            .streams
            .get(stream)
            .and_then(|s| s.consumers.get(durable))
            .and_then(|c| c.deliveries.get(&stream_sequence))
            .map(|d| d.state == DeliveryState::Acked)
            .unwrap_or(false)
    }

    /// Messages still stored in `stream`.
    pub fn stored(&self, stream: &str) -> usize {
        self.lock()
            .streams
            .get(stream)
            .map(|s| s.messages.len())
            .unwrap_or(0)
    }

    fn settle(&self, target: &AckTarget, op: impl FnOnce(&mut Delivery, &ConsumerSummary)) -> Result<(), JobsError> {
        let mut state = self.lock();
        if state.closed {
            return Err(JobsError::Closed);
        }
        let stream = state
            .streams
            .get_mut(&target.stream)
            .ok_or_else(|| JobsError::consumer_error(format!("stream {} not found", target.stream)))?;
        let consumer = stream
            .consumers
            .get_mut(&target.durable)
            .ok_or_else(|| JobsError::consumer_error(format!("consumer {} not found", target.durable)))?;
        if let Some(delivery) = consumer.deliveries.get_mut(&target.stream_sequence) {
            op(delivery, &consumer.summary);
        }
        Ok(())
    }

    fn take_available(
        &self,
        stream_name: &str,
        durable: &str,
        batch: usize,
    ) -> Result<Vec<JobMessage>, JobsError> {
        let now = Instant::now();
        let mut state = self.lock();
        if state.closed {
            return Err(JobsError::Closed);
        }
        let stream = state
            .streams
            .get_mut(stream_name)
            .ok_or_else(|| JobsError::consumer_error(format!("stream {stream_name} not found")))?;
        let consumer = stream
            .consumers
            .get_mut(durable)
            .ok_or_else(|| JobsError::consumer_error(format!("consumer {durable} not found")))?;
        let max_deliver = consumer.summary.max_deliver;

        let mut picked = Vec::new();
        let mut remaining = 0u64;
        for (seq, msg) in &stream.messages {
            if let Some(filter) = &consumer.filter_subject {
                if !subject_matches(filter, &msg.subject) {
                    continue;
                }
            }
            let delivery = consumer.deliveries.entry(*seq).or_insert(Delivery {
                count: 0,
                state: DeliveryState::Available { not_before: now },
            });
            let ready = match delivery.state {
                DeliveryState::Available { not_before } => not_before <= now,
                DeliveryState::InFlight { deadline } => deadline <= now,
                DeliveryState::Acked => false,
            };
            let attempts_left = max_deliver <= 0 || (delivery.count as i64) < max_deliver;
            if !ready || !attempts_left {
                continue;
            }
            if picked.len() >= batch {
                remaining += 1;
                continue;
            }
            delivery.count += 1;
            delivery.state = DeliveryState::InFlight {
                deadline: now + consumer.summary.ack_wait,
            };
            consumer.next_consumer_seq += 1;
            picked.push((*seq, delivery.count, consumer.next_consumer_seq, msg.clone()));
        }

        let messages = picked
            .into_iter()
            .map(|(seq, count, consumer_seq, msg)| {
                let info = MessageInfo {
                    stream: stream_name.to_string(),
                    consumer: durable.to_string(),
                    subject: msg.subject.clone(),
                    stream_sequence: seq,
                    consumer_sequence: consumer_seq,
                    redelivery_count: count,
                    pending: remaining,
                };
                let acker = MemoryAcker {
                    queue: self.clone(),
                    target: AckTarget {
                        stream: stream_name.to_string(),
                        durable: durable.to_string(),
                        stream_sequence: seq,
                    },
                };
                JobMessage::new(msg.subject, msg.payload, msg.headers, info, Arc::new(acker))
            })
            .collect();
        Ok(messages)
    }
}

#[async_trait]
impl Publisher for MemoryQueue {
    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        msg_id: Option<String>,
    ) -> Result<u64, JobsError> {
        let now = Instant::now();
        let seq = {
            let mut state = self.lock();
            if state.closed {
                return Err(JobsError::Closed);
            }
            let (name, stream) = state
                .streams
                .iter_mut()
                .find(|(_, s)| s.captures(subject))
                .ok_or_else(|| JobsError::publish_error(format!("no stream for subject {subject}")))?;
            let name = name.clone();

            let window = stream
                .settings
                .duplicate_window
                .unwrap_or(DEFAULT_DUPLICATE_WINDOW);
            stream.msg_ids.retain(|_, (_, at)| now.duration_since(*at) < window);
            if let Some(id) = &msg_id {
                if let Some((seq, _)) = stream.msg_ids.get(id) {
                    return Ok(*seq);
                }
            }

            stream.last_seq += 1;
            let seq = stream.last_seq;
            let mut headers = HashMap::new();
            if let Some(id) = msg_id {
                headers.insert(MSG_ID_HEADER.to_string(), id.clone());
                stream.msg_ids.insert(id, (seq, now));
            }
            stream.messages.insert(
                seq,
                StoredMessage {
                    subject: subject.to_string(),
                    payload: payload.clone(),
                    headers,
                },
            );
            state.published.entry(name).or_default().push(payload);
            seq
        };
        self.notify.notify_waiters();
        Ok(seq)
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn ensure_stream(&self, settings: &StreamSettings) -> Result<(), JobsError> {
        let mut state = self.lock();
        if state.fail_ensure_stream {
            return Err(JobsError::from_jetstream_error("stream creation refused"));
        }
        if state.streams.contains_key(&settings.name) {
            return Ok(());
        }
        state.streams.insert(
            settings.name.clone(),
            StreamState {
                settings: settings.clone(),
                messages: BTreeMap::new(),
                last_seq: 0,
                msg_ids: HashMap::new(),
                consumers: HashMap::new(),
            },
        );
        *state.stream_creates.entry(settings.name.clone()).or_default() += 1;
        Ok(())
    }

    async fn ensure_consumer(
        &self,
        stream: &str,
        settings: &ConsumerSettings,
    ) -> Result<Box<dyn PullConsumer>, JobsError> {
        let mut state = self.lock();
        let stream_state = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| JobsError::consumer_error(format!("stream {stream} not found")))?;

        let created = !stream_state.consumers.contains_key(&settings.durable_name);
        let consumer = stream_state
            .consumers
            .entry(settings.durable_name.clone())
            .or_insert_with(|| ConsumerState {
                summary: ConsumerSummary {
                    stream: stream.to_string(),
                    durable_name: settings.durable_name.clone(),
                    ack_wait: settings.ack_wait,
                    max_deliver: settings.max_deliver.unwrap_or(-1),
                },
                filter_subject: settings.filter_subject.clone(),
                deliveries: HashMap::new(),
                next_consumer_seq: 0,
            });
        let summary = consumer.summary.clone();
        if created {
            *state
                .consumer_creates
                .entry((stream.to_string(), settings.durable_name.clone()))
                .or_default() += 1;
        }

        Ok(Box::new(MemoryConsumer {
            queue: self.clone(),
            summary,
        }))
    }

    async fn close(&self) -> Result<(), JobsError> {
        self.lock().closed = true;
        self.notify.notify_waiters();
        Ok(())
    }
}

struct MemoryConsumer {
    queue: MemoryQueue,
    summary: ConsumerSummary,
}

#[async_trait]
impl PullConsumer for MemoryConsumer {
    fn info(&self) -> &ConsumerSummary {
        &self.summary
    }

    async fn pull(&self, batch: usize, expires: Duration) -> Result<Vec<JobMessage>, JobsError> {
        let stream = &self.summary.stream;
        let durable = &self.summary.durable_name;
        let expires_at = Instant::now() + expires;
        self.queue
            .lock()
            .pulls
            .entry(stream.clone())
            .or_default()
            .push(Instant::now());

        loop {
            // Register before checking so a publish in between is not missed.
            let notified = self.queue.notify.notified();
            let messages = self.queue.take_available(stream, durable, batch)?;
            if !messages.is_empty() {
                return Ok(messages);
            }
            let now = Instant::now();
            if now >= expires_at {
                return Ok(messages);
            }
            let step = (expires_at - now).min(PULL_POLL_STEP);
            let _ = tokio::time::timeout(step, notified).await;
        }
    }
}

#[derive(Debug, Clone)]
struct AckTarget {
    stream: String,
    durable: String,
    stream_sequence: u64,
}

struct MemoryAcker {
    queue: MemoryQueue,
    target: AckTarget,
}

#[async_trait]
impl MessageAcker for MemoryAcker {
    async fn ack_ack(&self) -> Result<AckOutcome, JobsError> {
        if self.queue.lock().fail_acks {
            return Ok(AckOutcome::Unconfirmed("ack confirmation timed out".to_string()));
        }
        self.queue.settle(&self.target, |delivery, _| {
            delivery.state = DeliveryState::Acked;
        })?;

        let mut state = self.queue.lock();
        if let Some(stream) = state.streams.get_mut(&self.target.stream) {
            if stream.settings.retention == Retention::WorkQueue {
                stream.messages.remove(&self.target.stream_sequence);
            }
        }
        Ok(AckOutcome::Confirmed)
    }

    async fn nak(&self, delay: Duration) -> Result<(), JobsError> {
        let now = Instant::now();
        self.queue.settle(&self.target, |delivery, _| {
            if delivery.state != DeliveryState::Acked {
                delivery.state = DeliveryState::Available {
                    not_before: now + delay,
                };
            }
        })?;
        self.queue
            .lock()
            .naks
            .entry(self.target.stream.clone())
            .or_default()
            .push((self.target.stream_sequence, delay));
        self.queue.notify.notify_waiters();
        Ok(())
    }

    async fn working(&self) -> Result<(), JobsError> {
        let now = Instant::now();
        self.queue.settle(&self.target, |delivery, summary| {
            if let DeliveryState::InFlight { .. } = delivery.state {
                delivery.state = DeliveryState::InFlight {
                    deadline: now + summary.ack_wait,
                };
            }
        })?;
        *self
            .queue
            .lock()
            .working_calls
            .entry((self.target.stream.clone(), self.target.stream_sequence))
            .or_default() += 1;
        Ok(())
    }
}

/// NATS subject matching with `*` (one token) and `>` (one or more trailing tokens).
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut subject_tokens = subject.split('.');
    for token in pattern.split('.') {
        match (token, subject_tokens.next()) {
            (">", Some(_)) => return true,
            ("*", Some(_)) => {}
            (t, Some(s)) if t == s => {}
            _ => return false,
        }
    }
    subject_tokens.next().is_none()
}

#[derive(Debug, Default)]
struct LockState {
    keys: HashMap<String, (String, Instant)>,
    sorted_sets: HashMap<String, HashMap<Vec<u8>, i64>>,
}

/// In-memory lock and sorted-set store.
#[derive(Debug, Clone, Default)]
pub struct MemoryLockStore {
    state: Arc<Mutex<LockState>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current value of an unexpired key.
    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.lock()
            .keys
            .get(key)
            .filter(|(_, expires)| *expires > now)
            .map(|(value, _)| value.clone())
    }

    /// Number of members in a sorted set.
    pub fn sorted_set_len(&self, key: &str) -> usize {
        self.lock().sorted_sets.get(key).map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, JobsError> {
        let now = Instant::now();
        let mut state = self.lock();
        if let Some((_, expires)) = state.keys.get(key) {
            if *expires > now {
                return Ok(false);
            }
        }
        state.keys.insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(true)
    }

    async fn sorted_set_add(&self, key: &str, score: i64, member: &[u8]) -> Result<u64, JobsError> {
        let mut state = self.lock();
        let set = state.sorted_sets.entry(key.to_string()).or_default();
        Ok(match set.insert(member.to_vec(), score) {
            Some(_) => 0,
            None => 1,
        })
    }

    async fn sorted_set_range_by_score(&self, key: &str, upper: i64) -> Result<Vec<Bytes>, JobsError> {
        let state = self.lock();
        let mut members: Vec<(i64, &Vec<u8>)> = state
            .sorted_sets
            .get(key)
            .map(|set| {
                set.iter()
                    .filter(|(_, score)| **score <= upper)
                    .map(|(member, score)| (*score, member))
                    .collect()
            })
            .unwrap_or_default();
        members.sort();
        Ok(members
            .into_iter()
            .map(|(_, member)| Bytes::copy_from_slice(member))
            .collect())
    }

    async fn sorted_set_remove_range_by_score(&self, key: &str, upper: i64) -> Result<u64, JobsError> {
        let mut state = self.lock();
        let Some(set) = state.sorted_sets.get_mut(key) else {
            return Ok(0);
        };
        let before = set.len();
        set.retain(|_, score| *score > upper);
        Ok((before - set.len()) as u64)
    }
}
