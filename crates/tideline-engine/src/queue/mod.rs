//! Durable pull-based message queue
//!
//! A broker holds streams, each bound to a set of subject patterns. Each
//! stream has durable consumers filtered to a subject pattern; every worker of
//! a resource type pulls from the same consumer, so the broker spreads work
//! across workers. Deliveries must be acknowledged explicitly. A delivery that
//! is neither acked nor nak'd within the consumer's ack wait is redelivered;
//! a nak with a delay schedules redelivery of the same payload after that
//! delay.

mod memory;
mod postgres;
mod publisher;
mod subjects;

pub use memory::InMemoryBroker;
pub use postgres::PostgresBroker;
pub use publisher::NotificationPublisher;
pub use subjects::{subject_matches, Subjects};

use crate::error::QueueError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tideline_types::ObjectType;

/// Result type for broker operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Stream definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Stream name
    pub name: String,

    /// Subject patterns captured by the stream
    pub subjects: Vec<String>,
}

/// Durable consumer definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Stream the consumer reads from
    pub stream: String,

    /// Durable consumer name
    pub durable_name: String,

    /// Subject pattern the consumer is filtered to
    pub filter_subject: String,

    /// Time after which an unacknowledged delivery is redelivered
    pub ack_wait: Duration,

    /// Stop delivering a message after this many attempts
    pub max_deliver: Option<u32>,
}

/// A message handed to a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker sequence of the message within its consumer
    pub sequence: u64,

    /// Subject the message was published to
    pub subject: String,

    /// Raw payload
    pub payload: Vec<u8>,

    /// How many times the message has been delivered, including this one
    pub delivered: u32,

    /// When this delivery was pulled
    pub received_at: DateTime<Utc>,
}

/// Message broker
#[async_trait]
pub trait Broker: Send + Sync {
    /// Create a stream, or add subjects to an existing one
    async fn ensure_stream(&self, config: &StreamConfig) -> QueueResult<()>;

    /// Create a durable consumer if it does not exist
    async fn ensure_consumer(&self, config: &ConsumerConfig) -> QueueResult<()>;

    /// Publish a payload to a subject
    async fn publish(&self, subject: &str, payload: &[u8]) -> QueueResult<()>;

    /// Bind a pull subscription to an existing durable consumer
    async fn subscribe(&self, stream: &str, consumer: &str) -> QueueResult<Arc<dyn Subscription>>;
}

/// Pull subscription bound to a durable consumer
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Poll for one message; `None` when nothing is currently available
    async fn pull(&self) -> QueueResult<Option<Delivery>>;

    /// Acknowledge successful processing
    async fn ack(&self, delivery: &Delivery) -> QueueResult<()>;

    /// Negatively acknowledge, asking for redelivery after `delay`
    async fn nak(&self, delivery: &Delivery, delay: Duration) -> QueueResult<()>;

    /// Tear down the subscription; the durable consumer remains
    async fn close(&self) -> QueueResult<()>;
}

/// Provision the stream family and durable consumer for a resource type
///
/// Safe to call from every worker on startup.
pub async fn provision(
    broker: &dyn Broker,
    object_type: &ObjectType,
    ack_wait: Duration,
    max_deliver: Option<u32>,
) -> QueueResult<()> {
    let subjects = Subjects::new(object_type);

    broker
        .ensure_stream(&StreamConfig {
            name: object_type.stream.clone(),
            subjects: vec![subjects.all()],
        })
        .await?;

    broker
        .ensure_consumer(&ConsumerConfig {
            stream: object_type.stream.clone(),
            durable_name: object_type.consumer_name(),
            filter_subject: subjects.all(),
            ack_wait,
            max_deliver,
        })
        .await?;

    tracing::debug!(
        stream = %object_type.stream,
        consumer = %object_type.consumer_name(),
        "Queue provisioned"
    );
    Ok(())
}
