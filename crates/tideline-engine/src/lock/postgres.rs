//! PostgreSQL key-value store

use super::{KvStore, LockResult};
use crate::error::LockError;
use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use std::time::Duration;

/// PostgreSQL-backed TTL bucket
///
/// Entries live in a shared `tideline_kv` table keyed by `(bucket, key)`.
/// An expired row is treated as absent and is overwritten by the next create.
#[derive(Debug, Clone)]
pub struct PostgresKvStore {
    pool: PgPool,
    bucket: String,
    ttl: Duration,
}

impl PostgresKvStore {
    /// Connect to PostgreSQL and initialize schema
    pub async fn connect(
        url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
        bucket: impl Into<String>,
        ttl: Duration,
    ) -> Result<Self, LockError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(connect_timeout_secs))
            .connect(url)
            .await
            .map_err(|e| LockError::Unavailable(e.to_string()))?;

        Self::from_pool(pool, bucket, ttl).await
    }

    /// Use an existing pool and initialize schema
    pub async fn from_pool(
        pool: PgPool,
        bucket: impl Into<String>,
        ttl: Duration,
    ) -> Result<Self, LockError> {
        let store = Self {
            pool,
            bucket: bucket.into(),
            ttl,
        };
        store.initialize_schema().await?;
        Ok(store)
    }

    async fn initialize_schema(&self) -> Result<(), LockError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS tideline_kv (
                bucket TEXT NOT NULL,
                key TEXT NOT NULL,
                value BYTEA NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (bucket, key)
            );
            "#,
            r#"CREATE INDEX IF NOT EXISTS tideline_kv_expires_at ON tideline_kv(expires_at);"#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        }

        Ok(())
    }

    /// Delete expired rows in this bucket
    pub async fn purge_expired(&self) -> LockResult<u64> {
        let result = sqlx::query("DELETE FROM tideline_kv WHERE bucket = $1 AND expires_at <= now()")
            .bind(&self.bucket)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl KvStore for PostgresKvStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn create(&self, key: &str, value: &[u8]) -> LockResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO tideline_kv (bucket, key, value, expires_at)
            VALUES ($1, $2, $3, now() + make_interval(secs => $4))
            ON CONFLICT (bucket, key) DO UPDATE
            SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
            WHERE tideline_kv.expires_at <= now()
            "#,
        )
        .bind(&self.bucket)
        .bind(key)
        .bind(value)
        .bind(self.ttl.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, key: &str) -> LockResult<Option<Vec<u8>>> {
        let row = sqlx::query(
            "SELECT value FROM tideline_kv WHERE bucket = $1 AND key = $2 AND expires_at > now()",
        )
        .bind(&self.bucket)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.map(|r| r.try_get::<Vec<u8>, _>("value"))
            .transpose()
            .map_err(map_sqlx_error)
    }

    async fn delete(&self, key: &str) -> LockResult<bool> {
        let result = sqlx::query("DELETE FROM tideline_kv WHERE bucket = $1 AND key = $2")
            .bind(&self.bucket)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() > 0)
    }
}

fn map_sqlx_error(err: sqlx::Error) -> LockError {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            LockError::Unavailable(err.to_string())
        }
        other => LockError::Query(other.to_string()),
    }
}
