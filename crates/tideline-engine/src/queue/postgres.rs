//! PostgreSQL message broker
//!
//! Each published message is fanned out into one row per matching durable
//! consumer. Pulling claims the oldest due row with `FOR UPDATE SKIP LOCKED`
//! and pushes its `deliver_after` forward by the ack wait; acking deletes the
//! row and nak'ing moves `deliver_after` to the requested delay.

use super::{
    subject_matches, Broker, ConsumerConfig, Delivery, QueueResult, StreamConfig, Subscription,
};
use crate::error::QueueError;
use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// PostgreSQL-backed durable broker
#[derive(Debug, Clone)]
pub struct PostgresBroker {
    pool: PgPool,
}

impl PostgresBroker {
    /// Connect to PostgreSQL and initialize schema
    pub async fn connect(
        url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> Result<Self, QueueError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(connect_timeout_secs))
            .connect(url)
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        Self::from_pool(pool).await
    }

    /// Use an existing pool and initialize schema
    pub async fn from_pool(pool: PgPool) -> Result<Self, QueueError> {
        let broker = Self { pool };
        broker.initialize_schema().await?;
        Ok(broker)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn initialize_schema(&self) -> Result<(), QueueError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS tideline_streams (
                name TEXT PRIMARY KEY,
                subjects TEXT[] NOT NULL
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS tideline_consumers (
                stream TEXT NOT NULL REFERENCES tideline_streams(name),
                name TEXT NOT NULL,
                filter_subject TEXT NOT NULL,
                ack_wait_ms BIGINT NOT NULL,
                max_deliver INT,
                PRIMARY KEY (stream, name)
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS tideline_messages (
                id BIGSERIAL PRIMARY KEY,
                stream TEXT NOT NULL,
                consumer TEXT NOT NULL,
                subject TEXT NOT NULL,
                payload BYTEA NOT NULL,
                delivered INT NOT NULL DEFAULT 0,
                deliver_after TIMESTAMPTZ NOT NULL DEFAULT now(),
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );
            "#,
            r#"CREATE INDEX IF NOT EXISTS tideline_messages_due ON tideline_messages(stream, consumer, deliver_after);"#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| QueueError::Connection(e.to_string()))?;
        }

        Ok(())
    }
}

#[async_trait]
impl Broker for PostgresBroker {
    async fn ensure_stream(&self, config: &StreamConfig) -> QueueResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tideline_streams (name, subjects)
            VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE
            SET subjects = ARRAY(
                SELECT DISTINCT unnest(tideline_streams.subjects || EXCLUDED.subjects)
            )
            "#,
        )
        .bind(&config.name)
        .bind(&config.subjects)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Connection(e.to_string()))?;

        Ok(())
    }

    async fn ensure_consumer(&self, config: &ConsumerConfig) -> QueueResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO tideline_consumers (stream, name, filter_subject, ack_wait_ms, max_deliver)
            SELECT $1, $2, $3, $4, $5
            WHERE EXISTS (SELECT 1 FROM tideline_streams WHERE name = $1)
            ON CONFLICT (stream, name) DO NOTHING
            "#,
        )
        .bind(&config.stream)
        .bind(&config.durable_name)
        .bind(&config.filter_subject)
        .bind(config.ack_wait.as_millis() as i64)
        .bind(config.max_deliver.map(|m| m as i32))
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Connection(e.to_string()))?;

        if result.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM tideline_streams WHERE name = $1")
                .bind(&config.stream)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| QueueError::Connection(e.to_string()))?;

            if exists.is_none() {
                return Err(QueueError::StreamNotFound(config.stream.clone()));
            }
        }

        Ok(())
    }

    async fn publish(&self, subject: &str, payload: &[u8]) -> QueueResult<()> {
        let publish_err = |e: sqlx::Error| QueueError::Publish {
            subject: subject.to_string(),
            cause: e.to_string(),
        };

        let streams = sqlx::query("SELECT name, subjects FROM tideline_streams")
            .fetch_all(&self.pool)
            .await
            .map_err(publish_err)?;

        let matching: Vec<String> = streams
            .iter()
            .filter_map(|row| {
                let name: String = row.try_get("name").ok()?;
                let subjects: Vec<String> = row.try_get("subjects").ok()?;
                subjects
                    .iter()
                    .any(|pattern| subject_matches(pattern, subject))
                    .then_some(name)
            })
            .collect();

        if matching.is_empty() {
            return Err(QueueError::NoStreamForSubject(subject.to_string()));
        }

        let consumers = sqlx::query(
            "SELECT stream, name, filter_subject FROM tideline_consumers WHERE stream = ANY($1)",
        )
        .bind(&matching)
        .fetch_all(&self.pool)
        .await
        .map_err(publish_err)?;

        let mut tx = self.pool.begin().await.map_err(publish_err)?;
        for row in &consumers {
            let stream: String = row.try_get("stream").map_err(publish_err)?;
            let name: String = row.try_get("name").map_err(publish_err)?;
            let filter: String = row.try_get("filter_subject").map_err(publish_err)?;

            if !subject_matches(&filter, subject) {
                continue;
            }

            sqlx::query(
                "INSERT INTO tideline_messages (stream, consumer, subject, payload) VALUES ($1, $2, $3, $4)",
            )
            .bind(&stream)
            .bind(&name)
            .bind(subject)
            .bind(payload)
            .execute(&mut *tx)
            .await
            .map_err(publish_err)?;
        }
        tx.commit().await.map_err(publish_err)?;

        Ok(())
    }

    async fn subscribe(&self, stream: &str, consumer: &str) -> QueueResult<Arc<dyn Subscription>> {
        let row = sqlx::query(
            "SELECT ack_wait_ms, max_deliver FROM tideline_consumers WHERE stream = $1 AND name = $2",
        )
        .bind(stream)
        .bind(consumer)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| QueueError::Connection(e.to_string()))?
        .ok_or_else(|| QueueError::ConsumerNotFound(consumer.to_string()))?;

        let ack_wait_ms: i64 = row
            .try_get("ack_wait_ms")
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        let max_deliver: Option<i32> = row
            .try_get("max_deliver")
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        Ok(Arc::new(PostgresSubscription {
            pool: self.pool.clone(),
            stream: stream.to_string(),
            consumer: consumer.to_string(),
            ack_wait: Duration::from_millis(ack_wait_ms.max(0) as u64),
            max_deliver,
            closed: AtomicBool::new(false),
        }))
    }
}

struct PostgresSubscription {
    pool: PgPool,
    stream: String,
    consumer: String,
    ack_wait: Duration,
    max_deliver: Option<i32>,
    closed: AtomicBool,
}

impl PostgresSubscription {
    fn ensure_open(&self) -> QueueResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    /// Delete due messages that have used up their deliveries
    ///
    /// A message still inside its ack wait is in flight and kept.
    async fn purge_exhausted(&self) -> QueueResult<u64> {
        let Some(max_deliver) = self.max_deliver else {
            return Ok(0);
        };

        let result = sqlx::query(
            r#"
            DELETE FROM tideline_messages
            WHERE stream = $1
              AND consumer = $2
              AND deliver_after <= now()
              AND delivered >= $3
            "#,
        )
        .bind(&self.stream)
        .bind(&self.consumer)
        .bind(max_deliver)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Pull {
            consumer: self.consumer.clone(),
            cause: e.to_string(),
        })?;

        if result.rows_affected() > 0 {
            tracing::warn!(
                consumer = %self.consumer,
                dropped = result.rows_affected(),
                max_deliver,
                "Dropped messages that exhausted their deliveries"
            );
        }

        Ok(result.rows_affected())
    }

    fn ack_err(&self, delivery: &Delivery, e: sqlx::Error) -> QueueError {
        QueueError::Acknowledge {
            message_id: delivery.sequence.to_string(),
            cause: e.to_string(),
        }
    }
}

#[async_trait]
impl Subscription for PostgresSubscription {
    async fn pull(&self) -> QueueResult<Option<Delivery>> {
        self.ensure_open()?;
        self.purge_exhausted().await?;

        let row = sqlx::query(
            r#"
            UPDATE tideline_messages
            SET delivered = delivered + 1,
                deliver_after = now() + make_interval(secs => $3)
            WHERE id = (
                SELECT id FROM tideline_messages
                WHERE stream = $1
                  AND consumer = $2
                  AND deliver_after <= now()
                  AND ($4::INT IS NULL OR delivered < $4)
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, subject, payload, delivered
            "#,
        )
        .bind(&self.stream)
        .bind(&self.consumer)
        .bind(self.ack_wait.as_secs_f64())
        .bind(self.max_deliver)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| QueueError::Pull {
            consumer: self.consumer.clone(),
            cause: e.to_string(),
        })?;

        let Some(row) = row else {
            return Ok(None);
        };

        let decode_err = |e: sqlx::Error| QueueError::Pull {
            consumer: self.consumer.clone(),
            cause: e.to_string(),
        };

        let id: i64 = row.try_get("id").map_err(decode_err)?;
        let delivered: i32 = row.try_get("delivered").map_err(decode_err)?;

        Ok(Some(Delivery {
            sequence: id as u64,
            subject: row.try_get("subject").map_err(decode_err)?,
            payload: row.try_get("payload").map_err(decode_err)?,
            delivered: delivered.max(0) as u32,
            received_at: chrono::Utc::now(),
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        self.ensure_open()?;

        sqlx::query("DELETE FROM tideline_messages WHERE id = $1")
            .bind(delivery.sequence as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| self.ack_err(delivery, e))?;

        Ok(())
    }

    async fn nak(&self, delivery: &Delivery, delay: Duration) -> QueueResult<()> {
        self.ensure_open()?;

        sqlx::query(
            "UPDATE tideline_messages SET deliver_after = now() + make_interval(secs => $2) WHERE id = $1",
        )
        .bind(delivery.sequence as i64)
        .bind(delay.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(|e| self.ack_err(delivery, e))?;

        Ok(())
    }

    async fn close(&self) -> QueueResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
