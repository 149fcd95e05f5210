//! # Tideline Engine
//!
//! Queue-driven reconciliation with distributed per-object locking.
//!
//! A [`Reconciler`] pulls change notifications for one resource type from a
//! durable [`queue`], takes an [`ObjectLock`] on the object, re-reads it
//! through the [`ApiClient`], runs the resource's [`ReconcileHandler`] and
//! writes the resulting status back. Failures become delayed requeues whose
//! delay grows with the notification's age ([`BackoffPolicy`]).
//!
//! Backends are pluggable: in-memory implementations for development and
//! tests, PostgreSQL for the broker and lock store, and HTTP for the API.

#![deny(unsafe_code)]

pub mod api;
pub mod backoff;
pub mod error;
pub mod events;
pub mod interrupt;
pub mod lock;
pub mod queue;
pub mod reconciler;
pub mod resource;
pub mod shutdown;

pub use api::{ApiClient, InMemoryApi, RestApiClient};
pub use backoff::BackoffPolicy;
pub use error::{ApiError, EngineError, EngineResult, HandlerError, LockError, QueueError};
pub use events::{ApiEventRecorder, EventRecorder, InMemoryEventRecorder, LogEventRecorder};
pub use interrupt::{InterruptGuard, Interrupts};
pub use lock::{InMemoryKvStore, KvStore, ObjectLock, PostgresKvStore, DEFAULT_LOCK_TTL};
pub use queue::{
    provision, Broker, Delivery, InMemoryBroker, NotificationPublisher, PostgresBroker,
    Subscription,
};
pub use reconciler::{Outcome, Reconciler, ReconcilerConfig};
pub use resource::{HandlerOutcome, HandlerResult, ReconcileContext, ReconcileHandler, Resource};
pub use shutdown::{ShutdownRegistry, TaskTracker};

pub use tideline_types as types;
