//! In-memory message broker

use super::{
    subject_matches, Broker, ConsumerConfig, Delivery, QueueResult, StreamConfig, Subscription,
};
use crate::error::QueueError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct StoredMessage {
    subject: String,
    payload: Vec<u8>,
}

#[derive(Debug, Clone)]
struct PendingMessage {
    subject: String,
    payload: Vec<u8>,
    available_at: Instant,
    delivered: u32,
}

#[derive(Debug)]
struct ConsumerState {
    config: ConsumerConfig,
    pending: BTreeMap<u64, PendingMessage>,
}

#[derive(Debug)]
struct StreamState {
    config: StreamConfig,
    log: VecDeque<StoredMessage>,
    consumers: HashMap<String, ConsumerState>,
}

#[derive(Debug, Default)]
struct BrokerState {
    streams: HashMap<String, StreamState>,
}

/// Messages each stream retains for consumers created later
pub const DEFAULT_RETAINED_MESSAGES: usize = 10_000;

/// In-memory broker for development and testing
///
/// Each stream retains its most recent messages; a consumer created after
/// messages were published receives the retained ones. Redelivery deadlines
/// use the tokio clock.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    sequence: Arc<AtomicU64>,
    retained: usize,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self {
            state: Arc::default(),
            sequence: Arc::default(),
            retained: DEFAULT_RETAINED_MESSAGES,
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retain at most `retained` messages per stream
    pub fn with_retained_messages(mut self, retained: usize) -> Self {
        self.retained = retained;
        self
    }

    /// Messages held for a consumer, in flight or waiting
    pub async fn pending(&self, stream: &str, consumer: &str) -> usize {
        let state = self.state.lock().await;
        state
            .streams
            .get(stream)
            .and_then(|s| s.consumers.get(consumer))
            .map(|c| c.pending.len())
            .unwrap_or(0)
    }

    /// Messages a consumer could pull right now
    pub async fn available(&self, stream: &str, consumer: &str) -> usize {
        let now = Instant::now();
        let state = self.state.lock().await;
        state
            .streams
            .get(stream)
            .and_then(|s| s.consumers.get(consumer))
            .map(|c| c.pending.values().filter(|m| m.available_at <= now).count())
            .unwrap_or(0)
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn ensure_stream(&self, config: &StreamConfig) -> QueueResult<()> {
        let mut state = self.state.lock().await;

        match state.streams.get_mut(&config.name) {
            Some(existing) => {
                for subject in &config.subjects {
                    if !existing.config.subjects.contains(subject) {
                        existing.config.subjects.push(subject.clone());
                    }
                }
            }
            None => {
                state.streams.insert(
                    config.name.clone(),
                    StreamState {
                        config: config.clone(),
                        log: VecDeque::new(),
                        consumers: HashMap::new(),
                    },
                );
            }
        }

        Ok(())
    }

    async fn ensure_consumer(&self, config: &ConsumerConfig) -> QueueResult<()> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let stream = state
            .streams
            .get_mut(&config.stream)
            .ok_or_else(|| QueueError::StreamNotFound(config.stream.clone()))?;

        if stream.consumers.contains_key(&config.durable_name) {
            return Ok(());
        }

        let mut pending = BTreeMap::new();
        for message in stream
            .log
            .iter()
            .filter(|m| subject_matches(&config.filter_subject, &m.subject))
        {
            pending.insert(
                self.next_sequence(),
                PendingMessage {
                    subject: message.subject.clone(),
                    payload: message.payload.clone(),
                    available_at: now,
                    delivered: 0,
                },
            );
        }

        stream.consumers.insert(
            config.durable_name.clone(),
            ConsumerState {
                config: config.clone(),
                pending,
            },
        );

        Ok(())
    }

    async fn publish(&self, subject: &str, payload: &[u8]) -> QueueResult<()> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let mut captured = false;

        for stream in state.streams.values_mut() {
            if !stream
                .config
                .subjects
                .iter()
                .any(|pattern| subject_matches(pattern, subject))
            {
                continue;
            }
            captured = true;

            stream.log.push_back(StoredMessage {
                subject: subject.to_string(),
                payload: payload.to_vec(),
            });
            while stream.log.len() > self.retained {
                stream.log.pop_front();
            }

            for consumer in stream.consumers.values_mut() {
                if subject_matches(&consumer.config.filter_subject, subject) {
                    consumer.pending.insert(
                        self.next_sequence(),
                        PendingMessage {
                            subject: subject.to_string(),
                            payload: payload.to_vec(),
                            available_at: now,
                            delivered: 0,
                        },
                    );
                }
            }
        }

        if !captured {
            return Err(QueueError::NoStreamForSubject(subject.to_string()));
        }

        Ok(())
    }

    async fn subscribe(&self, stream: &str, consumer: &str) -> QueueResult<Arc<dyn Subscription>> {
        let state = self.state.lock().await;
        let stream_state = state
            .streams
            .get(stream)
            .ok_or_else(|| QueueError::StreamNotFound(stream.to_string()))?;

        if !stream_state.consumers.contains_key(consumer) {
            return Err(QueueError::ConsumerNotFound(consumer.to_string()));
        }

        Ok(Arc::new(InMemorySubscription {
            state: self.state.clone(),
            stream: stream.to_string(),
            consumer: consumer.to_string(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct InMemorySubscription {
    state: Arc<Mutex<BrokerState>>,
    stream: String,
    consumer: String,
    closed: AtomicBool,
}

impl InMemorySubscription {
    fn ensure_open(&self) -> QueueResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    async fn with_consumer<T>(
        &self,
        f: impl FnOnce(&mut ConsumerState) -> T,
    ) -> QueueResult<T> {
        let mut state = self.state.lock().await;
        let consumer = state
            .streams
            .get_mut(&self.stream)
            .and_then(|s| s.consumers.get_mut(&self.consumer))
            .ok_or_else(|| QueueError::ConsumerNotFound(self.consumer.clone()))?;
        Ok(f(consumer))
    }

    async fn reschedule(&self, delivery: &Delivery, delay: Duration) -> QueueResult<()> {
        let available_at = Instant::now() + delay;
        self.with_consumer(|consumer| {
            if let Some(message) = consumer.pending.get_mut(&delivery.sequence) {
                message.available_at = available_at;
            }
        })
        .await
    }
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn pull(&self) -> QueueResult<Option<Delivery>> {
        self.ensure_open()?;
        let now = Instant::now();

        self.with_consumer(|consumer| {
            let ack_wait = consumer.config.ack_wait;
            let max_deliver = consumer.config.max_deliver;

            if let Some(max) = max_deliver {
                consumer
                    .pending
                    .retain(|_, m| m.delivered < max || m.available_at > now);
            }

            let (&sequence, message) = consumer
                .pending
                .iter_mut()
                .find(|(_, m)| m.available_at <= now)?;

            message.available_at = now + ack_wait;
            message.delivered += 1;

            Some(Delivery {
                sequence,
                subject: message.subject.clone(),
                payload: message.payload.clone(),
                delivered: message.delivered,
                received_at: chrono::Utc::now(),
            })
        })
        .await
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        self.ensure_open()?;
        self.with_consumer(|consumer| {
            consumer.pending.remove(&delivery.sequence);
        })
        .await
    }

    async fn nak(&self, delivery: &Delivery, delay: Duration) -> QueueResult<()> {
        self.ensure_open()?;
        self.reschedule(delivery, delay).await
    }

    async fn close(&self) -> QueueResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
