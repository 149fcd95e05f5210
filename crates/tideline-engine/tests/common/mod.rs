//! Shared fixtures for reconcile loop tests

#![allow(dead_code)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Map;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tideline_engine::queue::provision;
use tideline_engine::types::{ObjectId, ObjectType, Operation};
use tideline_engine::lock::LockResult;
use tideline_engine::{
    HandlerError, HandlerOutcome, HandlerResult, InMemoryApi, InMemoryBroker,
    InMemoryEventRecorder, InMemoryKvStore, Interrupts, KvStore, NotificationPublisher,
    ReconcileContext, ReconcileHandler, Reconciler, ReconcilerConfig, Resource, TaskTracker,
    DEFAULT_LOCK_TTL,
};
use tokio::sync::{watch, Notify};

pub const STREAM: &str = "TypeStream";
pub const CONSUMER: &str = "TypeXReconciler";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TypeX {
    #[serde(rename = "ID")]
    pub id: u64,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub reconciled: bool,
}

impl TypeX {
    pub fn new(id: u64, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            reconciled: false,
        }
    }
}

impl Resource for TypeX {
    fn id(&self) -> Option<ObjectId> {
        Some(ObjectId::new(self.id))
    }
}

pub fn object_type() -> ObjectType {
    ObjectType::new("TypeX", "/v0/type-xs", STREAM)
}

/// Handler that records calls and can be told to fail, requeue or block
#[derive(Default)]
pub struct ScriptedHandler {
    calls: Mutex<Vec<(Operation, u64)>>,
    failures_left: AtomicUsize,
    requeue_after: Mutex<Option<Duration>>,
    gate: Mutex<Option<Gate>>,
}

#[derive(Clone, Default)]
pub struct Gate {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

impl ScriptedHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_times(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn requeue_after(&self, delay: Duration) {
        *self.requeue_after.lock().unwrap() = Some(delay);
    }

    /// Block every call until the returned gate is released
    pub fn gated(&self) -> Gate {
        let gate = Gate::default();
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<(Operation, u64)> {
        self.calls.lock().unwrap().clone()
    }

    async fn handle(&self, operation: Operation, object: &TypeX) -> HandlerResult {
        self.calls.lock().unwrap().push((operation, object.id));

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(HandlerError::msg("infrastructure not ready"));
        }

        match *self.requeue_after.lock().unwrap() {
            Some(delay) => Ok(HandlerOutcome::requeue_after(delay)),
            None => Ok(HandlerOutcome::done()),
        }
    }
}

#[async_trait]
impl ReconcileHandler<TypeX> for ScriptedHandler {
    async fn created(&self, _ctx: &ReconcileContext, object: &TypeX) -> HandlerResult {
        self.handle(Operation::Created, object).await
    }

    async fn updated(&self, _ctx: &ReconcileContext, object: &TypeX) -> HandlerResult {
        self.handle(Operation::Updated, object).await
    }

    async fn deleted(&self, _ctx: &ReconcileContext, object: &TypeX) -> HandlerResult {
        self.handle(Operation::Deleted, object).await
    }
}

/// In-memory world a reconciler runs against
pub struct Harness {
    pub api: InMemoryApi,
    pub broker: InMemoryBroker,
    pub store: InMemoryKvStore,
    pub events: InMemoryEventRecorder,
    pub handler: Arc<ScriptedHandler>,
    pub publisher: NotificationPublisher,
    pub shutdown_tx: watch::Sender<bool>,
    pub tracker: TaskTracker,
    pub interrupts: Interrupts,
}

impl Harness {
    pub async fn new() -> Self {
        let broker = InMemoryBroker::new();
        provision(&broker, &object_type(), Duration::from_secs(30), None)
            .await
            .unwrap();

        let (shutdown_tx, _) = watch::channel(false);

        Self {
            api: InMemoryApi::new(),
            publisher: NotificationPublisher::new(Arc::new(broker.clone()), &object_type()),
            broker,
            store: InMemoryKvStore::new("locks", DEFAULT_LOCK_TTL),
            events: InMemoryEventRecorder::new(),
            handler: ScriptedHandler::new(),
            shutdown_tx,
            tracker: TaskTracker::new(),
            interrupts: Interrupts::manual(),
        }
    }

    pub fn config(&self) -> ReconcilerConfig<TypeX> {
        ReconcilerConfig::new(
            object_type(),
            Arc::new(self.api.clone()),
            Arc::new(self.broker.clone()),
            Arc::new(self.store.clone()),
            self.handler.clone(),
            self.shutdown_tx.subscribe(),
            self.tracker.clone(),
            self.interrupts.clone(),
        )
        .with_events(Arc::new(self.events.clone()))
        .with_poll_interval(Duration::from_millis(10))
    }

    pub async fn reconciler(&self) -> Reconciler<TypeX> {
        Reconciler::start(self.config()).await.unwrap()
    }

    /// Store an object in the API
    pub async fn seed(&self, object: &TypeX) {
        let mut fields = match serde_json::to_value(object).unwrap() {
            serde_json::Value::Object(map) => map,
            _ => Map::new(),
        };
        fields.remove("ID");
        self.api
            .insert(&object_type(), ObjectId::new(object.id), fields)
            .await;
    }

    pub async fn pending(&self) -> usize {
        self.broker.pending(STREAM, CONSUMER).await
    }

    pub async fn available(&self) -> usize {
        self.broker.available(STREAM, CONSUMER).await
    }
}

/// Lock store whose `create` waits to be released
pub struct GatedKvStore {
    inner: InMemoryKvStore,
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

impl GatedKvStore {
    pub fn new(inner: InMemoryKvStore) -> Self {
        Self {
            inner,
            entered: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        }
    }
}

#[async_trait]
impl KvStore for GatedKvStore {
    fn bucket(&self) -> &str {
        self.inner.bucket()
    }

    fn ttl(&self) -> Duration {
        self.inner.ttl()
    }

    async fn create(&self, key: &str, value: &[u8]) -> LockResult<bool> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.create(key, value).await
    }

    async fn get(&self, key: &str) -> LockResult<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> LockResult<bool> {
        self.inner.delete(key).await
    }
}
