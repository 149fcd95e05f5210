//! Producer side of the notification protocol

use super::{Broker, Subjects};
use crate::error::{EngineResult, QueueError};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tideline_types::{notification, ObjectType, Operation, Timing};

/// Publishes change notifications for one resource type
#[derive(Clone)]
pub struct NotificationPublisher {
    broker: Arc<dyn Broker>,
    subjects: Subjects,
}

impl NotificationPublisher {
    pub fn new(broker: Arc<dyn Broker>, object_type: &ObjectType) -> Self {
        Self {
            broker,
            subjects: Subjects::new(object_type),
        }
    }

    /// Notify reconcilers that `object` was changed by `operation`
    pub async fn publish<T: Serialize + Sync>(
        &self,
        object: &T,
        operation: Operation,
    ) -> EngineResult<()> {
        self.publish_with_timing(object, operation, Timing::CreatedAt(Utc::now()))
            .await
    }

    /// Publish with an explicit timing value
    pub async fn publish_with_timing<T: Serialize + Sync>(
        &self,
        object: &T,
        operation: Operation,
        timing: Timing,
    ) -> EngineResult<()> {
        let subject = self
            .subjects
            .for_operation(&operation)
            .ok_or_else(|| QueueError::Publish {
                subject: self.subjects.all(),
                cause: format!("no subject for operation {}", operation),
            })?;

        let payload = notification::encode(object, operation, timing)?;
        self.broker.publish(&subject, &payload).await?;

        tracing::debug!(subject = %subject, bytes = payload.len(), "Notification published");
        Ok(())
    }
}
