//! Reconciliation loop
//!
//! One [`Reconciler`] is one worker. Workers of the same resource type share
//! a durable consumer, so the broker spreads notifications across them; the
//! object lock keeps two workers (in this process or any other) from working
//! on the same object at once.
//!
//! Per message the loop decodes the notification, takes the object lock,
//! re-reads the object from the API, dispatches to the handler and writes the
//! resulting status back. Every failure is turned into a requeue; nothing
//! short of a shutdown or interrupt stops the loop. A message is acked only
//! once the whole sequence has succeeded.

use crate::api::ApiClient;
use crate::backoff::BackoffPolicy;
use crate::error::{ApiError, EngineResult};
use crate::events::{EventRecorder, LogEventRecorder};
use crate::interrupt::{InterruptGuard, Interrupts};
use crate::lock::{KvStore, ObjectLock};
use crate::queue::{Broker, Delivery, Subscription};
use crate::resource::{ReconcileContext, ReconcileHandler, Resource};
use crate::shutdown::{TaskTracker, TaskTrackerToken};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tideline_types::{
    notification, ObjectId, ObjectType, Operation, ReconcileEvent, ReconcilerId, StatusPatch,
};
use tokio::sync::watch;
use tracing::instrument;

/// Default pause after an empty pull
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default delay before redelivering a payload that could not be decoded
pub const DEFAULT_RAW_REQUEUE_DELAY: Duration = Duration::from_secs(10);

/// Everything a reconciler needs to run
pub struct ReconcilerConfig<R: Resource> {
    pub object_type: ObjectType,
    pub reconciler_id: ReconcilerId,
    pub api: Arc<dyn ApiClient>,
    pub encryption_key: Option<String>,
    pub broker: Arc<dyn Broker>,
    pub kv_store: Arc<dyn KvStore>,
    pub handler: Arc<dyn ReconcileHandler<R>>,
    pub events: Arc<dyn EventRecorder>,
    pub backoff: BackoffPolicy,
    pub poll_interval: Duration,
    pub raw_requeue_delay: Duration,
    pub shutdown: watch::Receiver<bool>,
    pub tracker: TaskTracker,
    pub interrupts: Interrupts,
}

impl<R: Resource> ReconcilerConfig<R> {
    /// Configuration with default backoff, polling and log-only events
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        object_type: ObjectType,
        api: Arc<dyn ApiClient>,
        broker: Arc<dyn Broker>,
        kv_store: Arc<dyn KvStore>,
        handler: Arc<dyn ReconcileHandler<R>>,
        shutdown: watch::Receiver<bool>,
        tracker: TaskTracker,
        interrupts: Interrupts,
    ) -> Self {
        Self {
            object_type,
            reconciler_id: ReconcilerId::generate(),
            api,
            encryption_key: None,
            broker,
            kv_store,
            handler,
            events: Arc::new(LogEventRecorder),
            backoff: BackoffPolicy::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            raw_requeue_delay: DEFAULT_RAW_REQUEUE_DELAY,
            shutdown,
            tracker,
            interrupts,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventRecorder>) -> Self {
        self.events = events;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_raw_requeue_delay(mut self, delay: Duration) -> Self {
        self.raw_requeue_delay = delay;
        self
    }

    pub fn with_encryption_key(mut self, key: impl Into<String>) -> Self {
        self.encryption_key = Some(key.into());
        self
    }

    pub fn with_reconciler_id(mut self, reconciler_id: ReconcilerId) -> Self {
        self.reconciler_id = reconciler_id;
        self
    }
}

/// How one message was disposed of
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Created or updated object reconciled and acked
    Reconciled,
    /// Deleted object confirmed, removed and acked
    Deleted,
    /// Object no longer exists; acked without calling the handler
    NotFound,
    /// Another reconciler holds the lock, or the lock store failed
    Contended,
    /// Handler asked to be called again later
    Requeued,
    /// Handler, API or lock release failed; requeued with backoff
    Failed,
    /// Operation is not one the engine knows
    Unrecognized,
    /// Payload could not be decoded; requeued unchanged with a fixed delay
    RequeuedRaw,
    /// Process interrupt arrived mid-iteration; cleanup ran instead
    Interrupted,
}

/// Settlement of a delivery and its object lock
///
/// Cloned into interrupt guards, so it holds only shared handles.
#[derive(Clone)]
struct Settler {
    lock: ObjectLock,
    subscription: Arc<dyn Subscription>,
}

impl Settler {
    /// Delete the lock record, optionally acking the delivery
    ///
    /// Returns `false` if either step failed. An unreleased lock heals by TTL
    /// and an unacked message is redelivered, so failures are only logged.
    async fn release_lock(&self, id: ObjectId, delivery: &Delivery, ack: bool) -> bool {
        let mut ok = true;

        if let Err(e) = self.lock.unlock(id).await {
            tracing::warn!(object_id = %id, error = %e, "Failed to release lock");
            ok = false;
        }

        if ack {
            if let Err(e) = self.subscription.ack(delivery).await {
                tracing::warn!(
                    object_id = %id,
                    sequence = delivery.sequence,
                    error = %e,
                    "Failed to acknowledge message"
                );
                ok = false;
            }
        }

        ok
    }

    /// Release the lock and ask for redelivery after `delay`
    async fn unlock_and_requeue(&self, id: ObjectId, delay: Duration, delivery: &Delivery) {
        self.release_lock(id, delivery, false).await;
        self.requeue(delivery, delay).await;
    }

    /// Ask for redelivery of the same payload after `delay`
    async fn requeue(&self, delivery: &Delivery, delay: Duration) {
        match self.subscription.nak(delivery, delay).await {
            Ok(()) => tracing::debug!(
                sequence = delivery.sequence,
                delay_ms = delay.as_millis() as u64,
                "Message requeued"
            ),
            Err(e) => tracing::warn!(
                sequence = delivery.sequence,
                error = %e,
                "Failed to requeue message, leaving it to broker redelivery"
            ),
        }
    }
}

/// What to do with a message once processing has stopped
enum Disposition {
    /// Release the lock and ack
    Complete(Outcome),
    /// Release the lock if held and requeue
    Requeue { delay: Duration, outcome: Outcome },
}

impl Disposition {
    fn requeue(delay: Duration, outcome: Outcome) -> Self {
        Self::Requeue { delay, outcome }
    }
}

/// A running reconciler for one resource type
pub struct Reconciler<R: Resource> {
    object_type: ObjectType,
    reconciler_id: ReconcilerId,
    api: Arc<dyn ApiClient>,
    encryption_key: Option<String>,
    handler: Arc<dyn ReconcileHandler<R>>,
    events: Arc<dyn EventRecorder>,
    backoff: BackoffPolicy,
    poll_interval: Duration,
    raw_requeue_delay: Duration,
    shutdown: watch::Receiver<bool>,
    interrupts: Interrupts,
    lock: ObjectLock,
    subscription: Arc<dyn Subscription>,
    settler: Settler,
    ticket: TaskTrackerToken,
}

impl<R: Resource> Reconciler<R> {
    /// Take a wait-group ticket and bind to the type's durable consumer
    pub async fn start(config: ReconcilerConfig<R>) -> EngineResult<Self> {
        let ticket = config.tracker.token();

        let subscription = config
            .broker
            .subscribe(&config.object_type.stream, &config.object_type.consumer_name())
            .await?;

        let lock = ObjectLock::new(
            config.kv_store,
            config.object_type.clone(),
            config.reconciler_id,
        );

        let settler = Settler {
            lock: lock.clone(),
            subscription: subscription.clone(),
        };

        Ok(Self {
            object_type: config.object_type,
            reconciler_id: config.reconciler_id,
            api: config.api,
            encryption_key: config.encryption_key,
            handler: config.handler,
            events: config.events,
            backoff: config.backoff,
            poll_interval: config.poll_interval,
            raw_requeue_delay: config.raw_requeue_delay,
            shutdown: config.shutdown,
            interrupts: config.interrupts,
            lock,
            subscription,
            settler,
            ticket,
        })
    }

    /// Start a reconciler and run it until shutdown
    pub async fn run(config: ReconcilerConfig<R>) -> EngineResult<()> {
        Self::start(config).await?.run_until_shutdown().await
    }

    pub fn reconciler_id(&self) -> ReconcilerId {
        self.reconciler_id
    }

    pub fn object_type(&self) -> &ObjectType {
        &self.object_type
    }

    /// Run the loop until a shutdown or interrupt is observed at the top of an
    /// iteration, then close the subscription and return the ticket
    pub async fn run_until_shutdown(self) -> EngineResult<()> {
        tracing::info!(
            object_type = %self.object_type,
            reconciler_id = %self.reconciler_id,
            "Reconciler started"
        );

        loop {
            if *self.shutdown.borrow() {
                tracing::info!(
                    object_type = %self.object_type,
                    reconciler_id = %self.reconciler_id,
                    "Shutdown requested, stopping reconciler"
                );
                break;
            }

            if self.interrupts.is_triggered() {
                tracing::info!(
                    object_type = %self.object_type,
                    reconciler_id = %self.reconciler_id,
                    "Interrupted, stopping reconciler"
                );
                break;
            }

            match self.reconcile_next().await {
                Ok(Some(_)) => {}
                Ok(None) => tokio::time::sleep(self.poll_interval).await,
                Err(e) => {
                    tracing::warn!(
                        object_type = %self.object_type,
                        error = %e,
                        "Failed to pull message"
                    );
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        if let Err(e) = self.subscription.close().await {
            tracing::warn!(object_type = %self.object_type, error = %e, "Failed to close subscription");
        }

        // Ticket goes back only after the subscription is closed.
        drop(self.ticket);
        tracing::info!(
            object_type = %self.object_type,
            reconciler_id = %self.reconciler_id,
            "Reconciler stopped"
        );
        Ok(())
    }

    /// Pull and process at most one message
    ///
    /// Returns `None` when nothing was available.
    pub async fn reconcile_next(&self) -> EngineResult<Option<Outcome>> {
        match self.subscription.pull().await? {
            Some(delivery) => Ok(Some(self.process(delivery).await)),
            None => Ok(None),
        }
    }

    #[instrument(
        name = "reconcile",
        skip_all,
        fields(
            object_type = %self.object_type,
            reconciler_id = %self.reconciler_id,
            sequence = delivery.sequence,
            attempt = delivery.delivered,
        )
    )]
    async fn process(&self, delivery: Delivery) -> Outcome {
        let notification = match notification::decode(&delivery.payload) {
            Ok(notification) => notification,
            Err(e) => {
                tracing::error!(error = %e, "Failed to decode notification");
                return self.requeue_raw(&delivery).await;
            }
        };

        let object: R = match notification.decode_object() {
            Ok(object) => object,
            Err(e) => {
                tracing::error!(error = %e, operation = %notification.operation, "Failed to decode object");
                return self.requeue_raw(&delivery).await;
            }
        };

        let Some(id) = object.id() else {
            tracing::error!(operation = %notification.operation, "Notification object has no ID");
            return self.requeue_raw(&delivery).await;
        };

        let delay = self.backoff.compute_delay(notification.timing());

        let held = Arc::new(AtomicBool::new(false));
        let guard = self.arm_interrupt_guard(&delivery, id, delay, held.clone());

        let disposition = self
            .attempt(&notification.operation, object, id, delay, delivery.delivered, &held)
            .await;

        if guard.stand_down().await {
            // Cleanup ran before the lock was taken; the lock is still ours.
            if held.load(Ordering::SeqCst) {
                if let Err(e) = self.lock.unlock(id).await {
                    tracing::warn!(object_id = %id, error = %e, "Failed to release lock after interrupt");
                }
            }
            return Outcome::Interrupted;
        }

        match disposition {
            Disposition::Complete(outcome) => {
                self.settler.release_lock(id, &delivery, true).await;

                match outcome {
                    Outcome::Reconciled => {
                        tracing::info!(object_id = %id, operation = %notification.operation, "Object reconciled");
                        let event = ReconcileEvent::reconciled(
                            self.object_type.name.clone(),
                            format!("{} reconciled", self.object_type),
                        );
                        self.record(event, id).await;
                    }
                    Outcome::Deleted => {
                        tracing::info!(object_id = %id, "Object deleted");
                        let event = ReconcileEvent::deleted(
                            self.object_type.name.clone(),
                            format!("{} deleted", self.object_type),
                        );
                        self.record(event, id).await;
                    }
                    _ => {}
                }

                outcome
            }
            Disposition::Requeue { delay, outcome } => {
                if held.load(Ordering::SeqCst) {
                    self.settler.unlock_and_requeue(id, delay, &delivery).await;
                } else {
                    self.settler.requeue(&delivery, delay).await;
                }
                outcome
            }
        }
    }

    /// Steps from lock acquisition to status write-back
    async fn attempt(
        &self,
        operation: &Operation,
        object: R,
        id: ObjectId,
        delay: Duration,
        delivered: u32,
        held: &AtomicBool,
    ) -> Disposition {
        match self.lock.check(id).await {
            Ok(false) => {}
            Ok(true) => {
                tracing::debug!(object_id = %id, "Object locked by another reconciler, requeueing");
                return Disposition::requeue(delay, Outcome::Contended);
            }
            Err(e) => {
                tracing::debug!(object_id = %id, error = %e, "Failed to check lock, assuming locked");
                return Disposition::requeue(delay, Outcome::Contended);
            }
        }

        match self.lock.lock(id).await {
            Ok(true) => held.store(true, Ordering::SeqCst),
            Ok(false) => {
                tracing::debug!(object_id = %id, "Lost lock race, requeueing");
                return Disposition::requeue(delay, Outcome::Contended);
            }
            Err(e) => {
                tracing::debug!(object_id = %id, error = %e, "Failed to acquire lock, requeueing");
                return Disposition::requeue(delay, Outcome::Contended);
            }
        }

        if self.interrupts.is_triggered() {
            tracing::warn!(object_id = %id, "Interrupted after taking lock, requeueing");
            return Disposition::requeue(delay, Outcome::Interrupted);
        }

        if let Operation::Unrecognized(name) = operation {
            tracing::error!(object_id = %id, operation = %name, "Unrecognized operation, requeueing");
            return Disposition::requeue(delay, Outcome::Unrecognized);
        }

        let object = if *operation == Operation::Deleted {
            object
        } else {
            match self.fetch(id).await {
                Ok(Some(current)) => current,
                Ok(None) => {
                    tracing::info!(object_id = %id, "Object no longer exists, nothing to reconcile");
                    return Disposition::Complete(Outcome::NotFound);
                }
                Err(e) => {
                    tracing::warn!(object_id = %id, error = %e, "Failed to fetch object, requeueing");
                    return Disposition::requeue(delay, Outcome::Failed);
                }
            }
        };

        let ctx = ReconcileContext {
            object_type: self.object_type.clone(),
            reconciler_id: self.reconciler_id,
            operation: operation.clone(),
            attempt: delivered,
            api: self.api.clone(),
            encryption_key: self.encryption_key.clone(),
        };

        let result = match operation {
            Operation::Created => self.handler.created(&ctx, &object).await,
            Operation::Updated => self.handler.updated(&ctx, &object).await,
            _ => self.handler.deleted(&ctx, &object).await,
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                self.events
                    .handle_event_override(
                        ReconcileEvent::failed(
                            self.object_type.name.clone(),
                            format!("failed to reconcile {} on {}", self.object_type, operation),
                        )
                        .with_reconciler(self.reconciler_id),
                        id,
                        Some(&e),
                    )
                    .await;
                return Disposition::requeue(delay, Outcome::Failed);
            }
        };

        if let Some(custom) = outcome.requeue_delay() {
            tracing::info!(
                object_id = %id,
                delay_ms = custom.as_millis() as u64,
                "Handler requested requeue"
            );
            self.record(
                ReconcileEvent::requeued(
                    self.object_type.name.clone(),
                    format!("{} requeued after {}s", self.object_type, custom.as_secs()),
                ),
                id,
            )
            .await;
            return Disposition::requeue(custom, Outcome::Requeued);
        }

        if *operation == Operation::Deleted {
            self.confirm_deletion(id, delay).await
        } else {
            match self.write_status(id, &StatusPatch::reconciled()).await {
                Ok(()) => Disposition::Complete(Outcome::Reconciled),
                Err(e) if e.is_not_found() => Disposition::Complete(Outcome::NotFound),
                Err(e) => {
                    tracing::warn!(object_id = %id, error = %e, "Failed to mark object reconciled, requeueing");
                    Disposition::requeue(delay, Outcome::Failed)
                }
            }
        }
    }

    /// Re-read the authoritative object; `None` if it no longer exists
    async fn fetch(&self, id: ObjectId) -> EngineResult<Option<R>> {
        match self.api.get_by_id(&self.object_type, id).await {
            Ok(value) => {
                let object = serde_json::from_value(value).map_err(ApiError::from)?;
                Ok(Some(object))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_status(
        &self,
        id: ObjectId,
        patch: &StatusPatch,
    ) -> Result<(), ApiError> {
        let body = serde_json::to_value(patch)?;
        self.api.update(&self.object_type, id, &body).await?;
        Ok(())
    }

    /// Stamp deletion timestamps, then delete the record
    async fn confirm_deletion(&self, id: ObjectId, delay: Duration) -> Disposition {
        let patch = StatusPatch::deletion_confirmed(Utc::now());

        match self.write_status(id, &patch).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                tracing::warn!(object_id = %id, error = %e, "Failed to confirm deletion, requeueing");
                return Disposition::requeue(delay, Outcome::Failed);
            }
        }

        match self.api.delete(&self.object_type, id).await {
            Ok(_) => Disposition::Complete(Outcome::Deleted),
            Err(e) if e.is_not_found() => Disposition::Complete(Outcome::Deleted),
            Err(e) => {
                tracing::warn!(object_id = %id, error = %e, "Failed to delete object, requeueing");
                Disposition::requeue(delay, Outcome::Failed)
            }
        }
    }

    fn arm_interrupt_guard(
        &self,
        delivery: &Delivery,
        id: ObjectId,
        delay: Duration,
        held: Arc<AtomicBool>,
    ) -> InterruptGuard {
        let settler = self.settler.clone();
        let delivery = delivery.clone();

        InterruptGuard::arm(&self.interrupts, move || async move {
            tracing::warn!(object_id = %id, "Interrupted mid-reconcile, requeueing");
            // Clearing the flag hands any later acquisition back to `process`.
            if held.swap(false, Ordering::SeqCst) {
                settler.unlock_and_requeue(id, delay, &delivery).await;
            } else {
                settler.requeue(&delivery, delay).await;
            }
        })
    }

    async fn requeue_raw(&self, delivery: &Delivery) -> Outcome {
        self.settler.requeue(delivery, self.raw_requeue_delay).await;
        Outcome::RequeuedRaw
    }

    async fn record(&self, event: ReconcileEvent, id: ObjectId) {
        self.events
            .handle_event_override(event.with_reconciler(self.reconciler_id), id, None)
            .await;
    }
}
