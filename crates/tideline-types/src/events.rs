//! Outcome events recorded against reconciled objects
//!
//! Events are the operator-facing record of what a reconciler did. They are
//! keyed to an object when recorded, so the event itself only carries what
//! happened.

use crate::ids::{ObjectId, ReconcilerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSeverity {
    /// Expected outcome
    Normal,
    /// Something operators should look at
    Warning,
}

/// Why an event was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventReason {
    /// Create or update reconciled successfully
    Reconciled,
    /// Object deleted after its delete handler succeeded
    Deleted,
    /// Handler returned an error
    ReconcileFailed,
    /// Handler asked to be called again later
    Requeued,
}

/// An outcome event before it is keyed to an object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileEvent {
    /// Unique event ID
    pub id: Uuid,

    /// Event timestamp
    pub timestamp: DateTime<Utc>,

    /// Why the event was recorded
    pub reason: EventReason,

    /// Event severity
    pub severity: EventSeverity,

    /// Type name of the reconciled object
    pub object_type: String,

    /// Human-readable note
    pub message: String,

    /// Reconciler that produced the event
    pub reconciler_id: Option<ReconcilerId>,
}

impl ReconcileEvent {
    /// Create a new event
    pub fn new(
        reason: EventReason,
        severity: EventSeverity,
        object_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            reason,
            severity,
            object_type: object_type.into(),
            message: message.into(),
            reconciler_id: None,
        }
    }

    pub fn reconciled(object_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventReason::Reconciled, EventSeverity::Normal, object_type, message)
    }

    pub fn deleted(object_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventReason::Deleted, EventSeverity::Normal, object_type, message)
    }

    pub fn failed(object_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventReason::ReconcileFailed, EventSeverity::Warning, object_type, message)
    }

    pub fn requeued(object_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventReason::Requeued, EventSeverity::Normal, object_type, message)
    }

    /// Set the producing reconciler
    pub fn with_reconciler(mut self, reconciler_id: ReconcilerId) -> Self {
        self.reconciler_id = Some(reconciler_id);
        self
    }

    /// Key the event to an object
    pub fn for_object(self, object_id: ObjectId) -> ObjectEvent {
        ObjectEvent {
            object_id,
            event: self,
        }
    }
}

/// An event keyed to the object it describes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectEvent {
    pub object_id: ObjectId,

    #[serde(flatten)]
    pub event: ReconcileEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_events_are_warnings() {
        let event = ReconcileEvent::failed("TypeX", "boom");
        assert_eq!(event.reason, EventReason::ReconcileFailed);
        assert_eq!(event.severity, EventSeverity::Warning);
    }

    #[test]
    fn test_object_event_flattens() {
        let event = ReconcileEvent::reconciled("TypeX", "ok").for_object(ObjectId::new(42));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["object_id"], 42);
        assert_eq!(json["object_type"], "TypeX");
        assert_eq!(json["reason"], "Reconciled");
    }
}
