//! End-to-end behavior of the reconcile loop against in-memory backends

mod common;

use common::{object_type, GatedKvStore, Harness, TypeX, STREAM};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tideline_engine::api::ApiCall;
use tideline_engine::types::{notification, EventReason, ObjectId, Operation, Timing};
use tideline_engine::{Broker, KvStore, Outcome, Reconciler, Subscription};

#[tokio::test(start_paused = true)]
async fn test_created_object_is_reconciled_and_acked() {
    let h = Harness::new().await;
    h.seed(&TypeX::new(42, "orders")).await;
    h.publisher
        .publish(&TypeX::new(42, "orders"), Operation::Created)
        .await
        .unwrap();

    let reconciler = h.reconciler().await;
    let outcome = reconciler.reconcile_next().await.unwrap();

    assert_eq!(outcome, Some(Outcome::Reconciled));
    assert_eq!(h.handler.calls(), vec![(Operation::Created, 42)]);

    let stored = h.api.object(&object_type(), ObjectId::new(42)).await.unwrap();
    assert_eq!(stored["Reconciled"], true);
    assert_eq!(
        h.api.calls().await,
        vec![
            ApiCall::Get("TypeX".into(), ObjectId::new(42)),
            ApiCall::Update("TypeX".into(), ObjectId::new(42)),
        ]
    );

    assert!(h.store.is_empty().await);
    assert_eq!(h.pending().await, 0);

    let events = h.events.events_for(ObjectId::new(42)).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event.reason, EventReason::Reconciled);
    assert_eq!(events[0].event.reconciler_id, Some(reconciler.reconciler_id()));
}

#[tokio::test(start_paused = true)]
async fn test_locked_object_is_requeued_without_fetching() {
    let h = Harness::new().await;
    h.seed(&TypeX::new(42, "orders")).await;
    assert!(h.store.create("TypeX-42", b"someone-else").await.unwrap());

    h.publisher
        .publish(&TypeX::new(42, "orders"), Operation::Created)
        .await
        .unwrap();

    let reconciler = h.reconciler().await;
    let outcome = reconciler.reconcile_next().await.unwrap();

    assert_eq!(outcome, Some(Outcome::Contended));
    assert!(h.handler.calls().is_empty());
    assert!(h.api.calls().await.is_empty());

    // The other holder's lock is untouched.
    assert_eq!(
        h.store.get("TypeX-42").await.unwrap(),
        Some(b"someone-else".to_vec())
    );

    // Requeued with the initial backoff delay, not acked.
    assert_eq!(h.pending().await, 1);
    assert_eq!(h.available().await, 0);
    tokio::time::advance(Duration::from_millis(1_100)).await;
    assert_eq!(h.available().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_contended_message_is_processed_once_lock_is_released() {
    let h = Harness::new().await;
    h.seed(&TypeX::new(42, "orders")).await;
    h.store.create("TypeX-42", b"someone-else").await.unwrap();
    h.publisher
        .publish(&TypeX::new(42, "orders"), Operation::Created)
        .await
        .unwrap();

    let reconciler = h.reconciler().await;
    assert_eq!(
        reconciler.reconcile_next().await.unwrap(),
        Some(Outcome::Contended)
    );

    h.store.delete("TypeX-42").await.unwrap();
    tokio::time::advance(Duration::from_secs(2)).await;

    assert_eq!(
        reconciler.reconcile_next().await.unwrap(),
        Some(Outcome::Reconciled)
    );
    assert_eq!(h.pending().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_delete_confirms_then_deletes_without_fetch() {
    let h = Harness::new().await;
    h.seed(&TypeX::new(42, "orders")).await;
    h.publisher
        .publish(&TypeX::new(42, "orders"), Operation::Deleted)
        .await
        .unwrap();

    let reconciler = h.reconciler().await;
    let outcome = reconciler.reconcile_next().await.unwrap();

    assert_eq!(outcome, Some(Outcome::Deleted));
    assert_eq!(h.handler.calls(), vec![(Operation::Deleted, 42)]);
    assert_eq!(
        h.api.calls().await,
        vec![
            ApiCall::Update("TypeX".into(), ObjectId::new(42)),
            ApiCall::Delete("TypeX".into(), ObjectId::new(42)),
        ]
    );
    assert!(h.api.object(&object_type(), ObjectId::new(42)).await.is_none());
    assert!(h.store.is_empty().await);
    assert_eq!(h.pending().await, 0);

    let events = h.events.events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event.reason, EventReason::Deleted);
}

#[tokio::test(start_paused = true)]
async fn test_missing_object_is_acked_without_handler() {
    let h = Harness::new().await;
    h.publisher
        .publish(&TypeX::new(7, "gone"), Operation::Updated)
        .await
        .unwrap();

    let reconciler = h.reconciler().await;
    let outcome = reconciler.reconcile_next().await.unwrap();

    assert_eq!(outcome, Some(Outcome::NotFound));
    assert!(h.handler.calls().is_empty());
    assert!(h.store.is_empty().await);
    assert_eq!(h.pending().await, 0);
    assert!(h.events.events().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_handler_error_is_redelivered_until_success() {
    let h = Harness::new().await;
    h.seed(&TypeX::new(42, "orders")).await;
    h.handler.fail_times(1);
    h.publisher
        .publish(&TypeX::new(42, "orders"), Operation::Created)
        .await
        .unwrap();

    let reconciler = h.reconciler().await;
    assert_eq!(
        reconciler.reconcile_next().await.unwrap(),
        Some(Outcome::Failed)
    );

    assert_eq!(h.pending().await, 1);
    assert!(h.store.is_empty().await);
    let stored = h.api.object(&object_type(), ObjectId::new(42)).await.unwrap();
    assert_eq!(stored["Reconciled"], false);

    let events = h.events.events_for(ObjectId::new(42)).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event.reason, EventReason::ReconcileFailed);

    assert_eq!(reconciler.reconcile_next().await.unwrap(), None);
    tokio::time::advance(Duration::from_secs(2)).await;

    assert_eq!(
        reconciler.reconcile_next().await.unwrap(),
        Some(Outcome::Reconciled)
    );
    assert_eq!(h.handler.calls().len(), 2);
    assert_eq!(h.pending().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_api_outage_requeues_with_backoff() {
    let h = Harness::new().await;
    h.seed(&TypeX::new(42, "orders")).await;
    h.api.set_unavailable(true);
    h.publisher
        .publish(&TypeX::new(42, "orders"), Operation::Created)
        .await
        .unwrap();

    let reconciler = h.reconciler().await;
    assert_eq!(
        reconciler.reconcile_next().await.unwrap(),
        Some(Outcome::Failed)
    );
    assert!(h.handler.calls().is_empty());
    assert!(h.store.is_empty().await);
    assert_eq!(h.pending().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_custom_requeue_delay_is_honored() {
    let h = Harness::new().await;
    h.seed(&TypeX::new(42, "orders")).await;
    h.handler.requeue_after(Duration::from_secs(30));
    h.publisher
        .publish(&TypeX::new(42, "orders"), Operation::Created)
        .await
        .unwrap();

    let reconciler = h.reconciler().await;
    assert_eq!(
        reconciler.reconcile_next().await.unwrap(),
        Some(Outcome::Requeued)
    );

    let stored = h.api.object(&object_type(), ObjectId::new(42)).await.unwrap();
    assert_eq!(stored["Reconciled"], false);
    assert!(h.store.is_empty().await);

    tokio::time::advance(Duration::from_secs(10)).await;
    assert_eq!(h.available().await, 0);
    tokio::time::advance(Duration::from_secs(21)).await;
    assert_eq!(h.available().await, 1);

    let events = h.events.events().await;
    assert_eq!(events[0].event.reason, EventReason::Requeued);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_payload_is_requeued_raw() {
    let h = Harness::new().await;
    h.broker.publish("TypeX.create", b"not json").await.unwrap();

    let reconciler = h.reconciler().await;
    assert_eq!(
        reconciler.reconcile_next().await.unwrap(),
        Some(Outcome::RequeuedRaw)
    );
    assert_eq!(h.pending().await, 1);

    tokio::time::advance(Duration::from_secs(9)).await;
    assert_eq!(h.available().await, 0);
    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(h.available().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_object_without_id_is_requeued_raw() {
    let h = Harness::new().await;
    let payload = notification::encode(
        &json!({"Name": "orphan"}),
        Operation::Created,
        Timing::CreatedAt(chrono::Utc::now()),
    )
    .unwrap();
    h.broker.publish("TypeX.create", &payload).await.unwrap();

    let reconciler = h.reconciler().await;
    assert_eq!(
        reconciler.reconcile_next().await.unwrap(),
        Some(Outcome::RequeuedRaw)
    );
    assert!(h.handler.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unrecognized_operation_is_requeued() {
    let h = Harness::new().await;
    h.seed(&TypeX::new(42, "orders")).await;
    let payload = notification::encode(
        &TypeX::new(42, "orders"),
        Operation::Unrecognized("Archived".into()),
        Timing::CreatedAt(chrono::Utc::now()),
    )
    .unwrap();
    h.broker.publish("TypeX.update", &payload).await.unwrap();

    let reconciler = h.reconciler().await;
    assert_eq!(
        reconciler.reconcile_next().await.unwrap(),
        Some(Outcome::Unrecognized)
    );
    assert!(h.handler.calls().is_empty());
    assert!(h.store.is_empty().await);
    assert_eq!(h.pending().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_old_notification_backs_off_longer() {
    let h = Harness::new().await;
    h.store.create("TypeX-42", b"someone-else").await.unwrap();

    let created = chrono::Utc::now() - chrono::Duration::seconds(60);
    let payload = notification::encode(
        &TypeX::new(42, "orders"),
        Operation::Created,
        Timing::CreatedAt(created),
    )
    .unwrap();
    h.broker.publish("TypeX.create", &payload).await.unwrap();

    let reconciler = h.reconciler().await;
    assert_eq!(
        reconciler.reconcile_next().await.unwrap(),
        Some(Outcome::Contended)
    );

    tokio::time::advance(Duration::from_secs(50)).await;
    assert_eq!(h.available().await, 0);
    tokio::time::advance(Duration::from_secs(15)).await;
    assert_eq!(h.available().await, 1);
}

#[tokio::test]
async fn test_concurrent_workers_never_share_an_object() {
    let h = Harness::new().await;
    h.seed(&TypeX::new(42, "orders")).await;
    let gate = h.handler.gated();

    h.publisher
        .publish(&TypeX::new(42, "orders"), Operation::Created)
        .await
        .unwrap();
    h.publisher
        .publish(&TypeX::new(42, "orders"), Operation::Updated)
        .await
        .unwrap();

    let first = h.reconciler().await;
    let second = h.reconciler().await;

    let busy = tokio::spawn(async move { first.reconcile_next().await.unwrap() });
    gate.entered.notified().await;

    assert_eq!(
        second.reconcile_next().await.unwrap(),
        Some(Outcome::Contended)
    );

    gate.release.notify_one();
    assert_eq!(busy.await.unwrap(), Some(Outcome::Reconciled));
    assert_eq!(h.handler.calls().len(), 1);
}

#[tokio::test]
async fn test_shutdown_finishes_in_flight_message() {
    let h = Harness::new().await;
    h.seed(&TypeX::new(42, "orders")).await;
    let gate = h.handler.gated();
    h.publisher
        .publish(&TypeX::new(42, "orders"), Operation::Created)
        .await
        .unwrap();

    let reconciler = h.reconciler().await;
    let worker = tokio::spawn(reconciler.run_until_shutdown());
    h.tracker.close();

    gate.entered.notified().await;
    h.shutdown_tx.send_replace(true);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!h.tracker.is_empty());

    gate.release.notify_one();
    tokio::time::timeout(Duration::from_secs(5), h.tracker.wait())
        .await
        .unwrap();
    worker.await.unwrap().unwrap();

    let stored = h.api.object(&object_type(), ObjectId::new(42)).await.unwrap();
    assert_eq!(stored["Reconciled"], true);
    assert_eq!(h.pending().await, 0);
}

#[tokio::test]
async fn test_closed_subscription_after_shutdown() {
    let h = Harness::new().await;
    h.shutdown_tx.send_replace(true);

    let reconciler = h.reconciler().await;
    reconciler.run_until_shutdown().await.unwrap();
    h.tracker.close();
    h.tracker.wait().await;

    // Durable consumer outlives the worker.
    let subscription = h.broker.subscribe(STREAM, "TypeXReconciler").await.unwrap();
    assert!(subscription.pull().await.unwrap().is_none());
}

#[tokio::test]
async fn test_interrupt_mid_iteration_unlocks_and_requeues() {
    let h = Harness::new().await;
    h.seed(&TypeX::new(42, "orders")).await;
    let gate = h.handler.gated();
    h.publisher
        .publish(&TypeX::new(42, "orders"), Operation::Created)
        .await
        .unwrap();

    let reconciler = Arc::new(h.reconciler().await);
    let running = reconciler.clone();
    let busy = tokio::spawn(async move { running.reconcile_next().await.unwrap() });

    gate.entered.notified().await;
    assert_eq!(h.store.len().await, 1);

    h.interrupts.trigger();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !h.store.is_empty().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    gate.release.notify_one();
    assert_eq!(busy.await.unwrap(), Some(Outcome::Interrupted));

    // Not acked: the message waits out its backoff and comes back.
    assert_eq!(h.pending().await, 1);
    assert!(h.store.is_empty().await);
}

#[tokio::test]
async fn test_interrupt_while_locking_releases_lock_and_skips_handler() {
    let h = Harness::new().await;
    h.seed(&TypeX::new(42, "orders")).await;
    h.publisher
        .publish(&TypeX::new(42, "orders"), Operation::Created)
        .await
        .unwrap();

    let store = Arc::new(GatedKvStore::new(h.store.clone()));
    let mut config = h.config();
    config.kv_store = store.clone();
    let reconciler = Reconciler::start(config).await.unwrap();
    let busy = tokio::spawn(async move { reconciler.reconcile_next().await.unwrap() });

    store.entered.notified().await;
    h.interrupts.trigger();
    tokio::time::sleep(Duration::from_millis(20)).await;
    store.release.notify_one();

    assert_eq!(busy.await.unwrap(), Some(Outcome::Interrupted));
    assert!(h.handler.calls().is_empty());
    assert!(h.store.is_empty().await);
    assert_eq!(h.pending().await, 1);

    let stored = h.api.object(&object_type(), ObjectId::new(42)).await.unwrap();
    assert_eq!(stored["Reconciled"], false);
}
