//! Event recording

use crate::api::ApiClient;
use crate::error::{ApiError, EventError};
use async_trait::async_trait;
use std::sync::Arc;
use tideline_types::{EventSeverity, ObjectEvent, ObjectId, ObjectType, ReconcileEvent};
use tokio::sync::RwLock;

/// Sink for operator-facing reconcile events
#[async_trait]
pub trait EventRecorder: Send + Sync {
    /// Record an event against an object
    async fn record_event(
        &self,
        event: ReconcileEvent,
        object_id: ObjectId,
    ) -> Result<(), EventError>;

    /// Record an event, logging `cause` and any recording failure instead of
    /// returning them
    async fn handle_event_override(
        &self,
        event: ReconcileEvent,
        object_id: ObjectId,
        cause: Option<&(dyn std::error::Error + Send + Sync)>,
    ) {
        if let Some(cause) = cause {
            tracing::error!(
                object_id = %object_id,
                object_type = %event.object_type,
                error = %cause,
                "{}",
                event.message
            );
        }

        if let Err(e) = self.record_event(event, object_id).await {
            tracing::warn!(object_id = %object_id, error = %e, "Failed to record event");
        }
    }
}

/// Records events by creating them through the resource API
pub struct ApiEventRecorder {
    api: Arc<dyn ApiClient>,
    events_type: ObjectType,
}

impl ApiEventRecorder {
    pub fn new(api: Arc<dyn ApiClient>, events_type: ObjectType) -> Self {
        Self { api, events_type }
    }
}

#[async_trait]
impl EventRecorder for ApiEventRecorder {
    async fn record_event(
        &self,
        event: ReconcileEvent,
        object_id: ObjectId,
    ) -> Result<(), EventError> {
        let body = serde_json::to_value(event.for_object(object_id)).map_err(ApiError::from)?;
        self.api.create(&self.events_type, &body).await?;
        Ok(())
    }
}

/// Writes events to the log only
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEventRecorder;

#[async_trait]
impl EventRecorder for LogEventRecorder {
    async fn record_event(
        &self,
        event: ReconcileEvent,
        object_id: ObjectId,
    ) -> Result<(), EventError> {
        match event.severity {
            EventSeverity::Normal => tracing::info!(
                object_id = %object_id,
                object_type = %event.object_type,
                reason = ?event.reason,
                "{}",
                event.message
            ),
            EventSeverity::Warning => tracing::warn!(
                object_id = %object_id,
                object_type = %event.object_type,
                reason = ?event.reason,
                "{}",
                event.message
            ),
        }
        Ok(())
    }
}

/// Keeps recorded events in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventRecorder {
    events: Arc<RwLock<Vec<ObjectEvent>>>,
}

impl InMemoryEventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events recorded so far, oldest first
    pub async fn events(&self) -> Vec<ObjectEvent> {
        self.events.read().await.clone()
    }

    /// Events recorded against one object
    pub async fn events_for(&self, object_id: ObjectId) -> Vec<ObjectEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.object_id == object_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventRecorder for InMemoryEventRecorder {
    async fn record_event(
        &self,
        event: ReconcileEvent,
        object_id: ObjectId,
    ) -> Result<(), EventError> {
        self.events.write().await.push(event.for_object(object_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiCall, InMemoryApi};
    use tideline_types::EventReason;

    #[tokio::test]
    async fn test_in_memory_recorder_keys_events() {
        let recorder = InMemoryEventRecorder::new();
        recorder
            .record_event(ReconcileEvent::reconciled("TypeX", "ok"), ObjectId::new(1))
            .await
            .unwrap();
        recorder
            .record_event(ReconcileEvent::failed("TypeX", "boom"), ObjectId::new(2))
            .await
            .unwrap();

        let events = recorder.events_for(ObjectId::new(2)).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.reason, EventReason::ReconcileFailed);
    }

    #[tokio::test]
    async fn test_api_recorder_creates_event_objects() {
        let api = InMemoryApi::new();
        let events_type = ObjectType::new("Event", "/v0/events", "");
        let recorder = ApiEventRecorder::new(Arc::new(api.clone()), events_type);

        recorder
            .record_event(ReconcileEvent::deleted("TypeX", "gone"), ObjectId::new(42))
            .await
            .unwrap();

        assert_eq!(api.calls().await, vec![ApiCall::Create("Event".into())]);
    }

    #[tokio::test]
    async fn test_override_swallows_recording_failure() {
        let api = InMemoryApi::new();
        api.set_unavailable(true);
        let recorder =
            ApiEventRecorder::new(Arc::new(api.clone()), ObjectType::new("Event", "/v0/events", ""));

        let cause = std::io::Error::new(std::io::ErrorKind::Other, "handler failed");
        recorder
            .handle_event_override(
                ReconcileEvent::failed("TypeX", "reconcile failed"),
                ObjectId::new(42),
                Some(&cause),
            )
            .await;

        assert_eq!(api.calls().await.len(), 1);
    }
}
