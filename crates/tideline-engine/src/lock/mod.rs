//! Per-object mutual exclusion backed by a TTL key-value store
//!
//! A lock is a single record keyed `{type}-{id}` in a bucket whose entries
//! expire after a fixed TTL. Acquiring creates the record only if no live one
//! exists; releasing deletes it. Locks are not owned: the stored value names
//! the holder for diagnostics, but correctness depends only on whether the
//! record is present. A holder that crashes without releasing is healed by
//! the TTL.

mod memory;
mod postgres;

pub use memory::InMemoryKvStore;
pub use postgres::PostgresKvStore;

use crate::error::LockError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tideline_types::{ObjectId, ObjectType, ReconcilerId};

/// Result type for lock store operations
pub type LockResult<T> = Result<T, LockError>;

/// Default lifetime of a lock record
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(20 * 60);

/// A bucket of expiring key-value entries
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Bucket name
    fn bucket(&self) -> &str;

    /// Lifetime of every entry in the bucket
    fn ttl(&self) -> Duration;

    /// Create an entry if no live entry exists for `key`
    ///
    /// Returns `false` when a live entry is already present.
    async fn create(&self, key: &str, value: &[u8]) -> LockResult<bool>;

    /// Get the value of a live entry
    async fn get(&self, key: &str) -> LockResult<Option<Vec<u8>>>;

    /// Delete an entry, returning whether one was removed
    async fn delete(&self, key: &str) -> LockResult<bool>;
}

/// Lock over objects of one resource type
#[derive(Clone)]
pub struct ObjectLock {
    store: Arc<dyn KvStore>,
    object_type: ObjectType,
    owner: ReconcilerId,
}

impl ObjectLock {
    pub fn new(store: Arc<dyn KvStore>, object_type: ObjectType, owner: ReconcilerId) -> Self {
        Self {
            store,
            object_type,
            owner,
        }
    }

    pub fn object_type(&self) -> &ObjectType {
        &self.object_type
    }

    /// Whether the object is currently locked
    ///
    /// An error means the store could not be asked; callers treat that as
    /// locked.
    pub async fn check(&self, id: ObjectId) -> LockResult<bool> {
        let key = self.object_type.lock_key(id);
        Ok(self.store.get(&key).await?.is_some())
    }

    /// Try to take the lock, returning `false` if it is already held
    pub async fn lock(&self, id: ObjectId) -> LockResult<bool> {
        let key = self.object_type.lock_key(id);
        let acquired = self
            .store
            .create(&key, self.owner.to_string().as_bytes())
            .await?;

        if acquired {
            tracing::debug!(
                lock_key = %key,
                reconciler_id = %self.owner,
                ttl_secs = self.store.ttl().as_secs(),
                "Lock acquired"
            );
        }

        Ok(acquired)
    }

    /// Release the lock
    ///
    /// Returns `false` if no record was present.
    pub async fn unlock(&self, id: ObjectId) -> LockResult<bool> {
        let key = self.object_type.lock_key(id);
        let removed = self.store.delete(&key).await?;

        tracing::debug!(lock_key = %key, removed, "Lock released");
        Ok(removed)
    }

    /// Identity recorded by whoever holds the lock
    pub async fn holder(&self, id: ObjectId) -> LockResult<Option<String>> {
        let key = self.object_type.lock_key(id);
        Ok(self
            .store
            .get(&key)
            .await?
            .map(|value| String::from_utf8_lossy(&value).into_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_for(store: Arc<dyn KvStore>) -> ObjectLock {
        ObjectLock::new(
            store,
            ObjectType::new("TypeX", "/v0/type-xs", "TypeStream"),
            ReconcilerId::generate(),
        )
    }

    #[tokio::test]
    async fn test_concurrent_lock_has_one_winner() {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new("locks", DEFAULT_LOCK_TTL));
        let id = ObjectId::new(42);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = lock_for(store.clone());
            handles.push(tokio::spawn(async move { lock.lock(id).await.unwrap() }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_unlock_makes_lock_available() {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new("locks", DEFAULT_LOCK_TTL));
        let first = lock_for(store.clone());
        let second = lock_for(store.clone());
        let id = ObjectId::new(42);

        assert!(first.lock(id).await.unwrap());
        assert!(second.check(id).await.unwrap());
        assert!(!second.lock(id).await.unwrap());

        assert!(first.unlock(id).await.unwrap());
        assert!(!second.check(id).await.unwrap());
        assert!(second.lock(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_holder_reports_owner_tag() {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new("locks", DEFAULT_LOCK_TTL));
        let lock = lock_for(store);
        let id = ObjectId::new(5);

        assert_eq!(lock.holder(id).await.unwrap(), None);
        lock.lock(id).await.unwrap();
        assert_eq!(lock.holder(id).await.unwrap(), Some(lock.owner.to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreleased_lock_expires_after_ttl() {
        let store: Arc<dyn KvStore> =
            Arc::new(InMemoryKvStore::new("locks", Duration::from_secs(2)));
        let crashed = lock_for(store.clone());
        let survivor = lock_for(store.clone());
        let id = ObjectId::new(42);

        assert!(crashed.lock(id).await.unwrap());
        assert!(!survivor.lock(id).await.unwrap());

        tokio::time::advance(Duration::from_secs(3)).await;

        assert!(!survivor.check(id).await.unwrap());
        assert!(survivor.lock(id).await.unwrap());
    }
}
