//! Resource-specific extension points
//!
//! The engine is generic over the reconciled type. A resource supplies its
//! concrete type (decoded from the notification and from the API) and a
//! handler with one method per operation. Everything else, from locking to
//! requeueing and status write-back, is shared.

use crate::api::ApiClient;
use crate::error::HandlerError;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tideline_types::{ObjectId, ObjectType, Operation, ReconcilerId};

/// A reconciled resource type
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Numeric ID assigned by the API
    fn id(&self) -> Option<ObjectId>;
}

/// What a handler asks the engine to do after it returns successfully
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerOutcome {
    requeue_after: Option<Duration>,
}

impl HandlerOutcome {
    /// Reconciliation is complete
    pub fn done() -> Self {
        Self::default()
    }

    /// Call the handler again after `delay`
    ///
    /// A zero delay means done.
    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue_after: (!delay.is_zero()).then_some(delay),
        }
    }

    pub fn requeue_delay(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// Result returned by handlers
pub type HandlerResult = Result<HandlerOutcome, HandlerError>;

/// Per-message context passed to handlers
#[derive(Clone)]
pub struct ReconcileContext {
    pub object_type: ObjectType,
    pub reconciler_id: ReconcilerId,
    pub operation: Operation,

    /// Delivery attempt of the notification, starting at 1
    pub attempt: u32,

    /// Client for reading and writing related resources
    pub api: Arc<dyn ApiClient>,

    /// Key for decrypting secrets stored on resources
    pub encryption_key: Option<String>,
}

/// Resource-specific reconciliation logic
///
/// Handlers must be idempotent: a notification may be delivered more than
/// once, and a lock that outlives a crashed holder's TTL lets another
/// reconciler repeat the work.
#[async_trait]
pub trait ReconcileHandler<R: Resource>: Send + Sync {
    async fn created(&self, ctx: &ReconcileContext, object: &R) -> HandlerResult;

    async fn updated(&self, ctx: &ReconcileContext, object: &R) -> HandlerResult;

    async fn deleted(&self, ctx: &ReconcileContext, object: &R) -> HandlerResult;
}
