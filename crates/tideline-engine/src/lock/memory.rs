//! In-memory key-value store

use super::{KvStore, LockResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// In-memory TTL bucket for development and testing
///
/// Expiry is evaluated lazily against the tokio clock, so tests can advance
/// paused time to simulate TTL elapsing.
#[derive(Debug, Clone)]
pub struct InMemoryKvStore {
    bucket: String,
    ttl: Duration,
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl InMemoryKvStore {
    pub fn new(bucket: impl Into<String>, ttl: Duration) -> Self {
        Self {
            bucket: bucket.into(),
            ttl,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Number of live entries
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.read().await;
        entries.values().filter(|e| e.expires_at > now).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn create(&self, key: &str, value: &[u8]) -> LockResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;

        if let Some(existing) = entries.get(key) {
            if existing.expires_at > now {
                return Ok(false);
            }
        }

        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: now + self.ttl,
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> LockResult<Option<Vec<u8>>> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.value.clone()))
    }

    async fn delete(&self, key: &str) -> LockResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        Ok(entries
            .remove(key)
            .map(|e| e.expires_at > now)
            .unwrap_or(false))
    }
}
