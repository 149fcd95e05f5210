//! Change notifications exchanged between the API and reconcilers
//!
//! A notification carries a snapshot of the changed object, the operation that
//! changed it and a timing value used for requeue backoff. The object is kept
//! as a generic JSON map because the engine does not know its concrete type;
//! [`Notification::decode_object`] performs the second decode step into the
//! resource's own type.
//!
//! Two timing shapes are accepted on the wire. `CreationTime` (unix
//! nanoseconds of the original notification) is canonical and is what
//! [`encode`] writes. `LastRequeueDelay` (seconds) is the older shape and is
//! still decoded for compatibility.

use crate::ids::ObjectId;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while encoding or decoding notifications
#[derive(Debug, Error)]
pub enum NotificationError {
    /// Payload is not a valid notification envelope
    #[error("Malformed notification: {0}")]
    Malformed(#[source] serde_json::Error),

    /// Envelope `Object` field is not a JSON object
    #[error("Notification object is not a JSON object")]
    ObjectNotAMap,

    /// Embedded object could not be decoded into the resource type
    #[error("Failed to decode {type_name} from notification: {source}")]
    ObjectDecode {
        type_name: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// Object or envelope could not be serialized
    #[error("Failed to encode notification: {0}")]
    Encode(#[source] serde_json::Error),

    /// Creation time is outside the representable nanosecond range
    #[error("Creation time out of range: {0}")]
    TimeOutOfRange(DateTime<Utc>),
}

/// Operation that produced a notification
///
/// Unknown operation names survive decoding as [`Operation::Unrecognized`] so
/// the engine can requeue them instead of treating the payload as malformed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operation {
    Created,
    Updated,
    Deleted,
    Unrecognized(String),
}

impl Operation {
    pub fn as_str(&self) -> &str {
        match self {
            Operation::Created => "Created",
            Operation::Updated => "Updated",
            Operation::Deleted => "Deleted",
            Operation::Unrecognized(other) => other,
        }
    }

    /// Subject suffix used by the broker for this operation
    pub fn subject_suffix(&self) -> Option<&'static str> {
        match self {
            Operation::Created => Some("create"),
            Operation::Updated => Some("update"),
            Operation::Deleted => Some("delete"),
            Operation::Unrecognized(_) => None,
        }
    }
}

impl From<String> for Operation {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Created" => Operation::Created,
            "Updated" => Operation::Updated,
            "Deleted" => Operation::Deleted,
            _ => Operation::Unrecognized(value),
        }
    }
}

impl From<Operation> for String {
    fn from(op: Operation) -> Self {
        op.as_str().to_string()
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timing value carried by a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timing {
    /// Creation time of the original notification
    CreatedAt(DateTime<Utc>),

    /// Delay applied on the previous requeue (legacy shape)
    LastDelay(Duration),
}

/// A decoded change notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Notification {
    /// Snapshot of the object at the time of change
    pub object: Map<String, Value>,

    /// Operation that changed the object
    pub operation: Operation,

    /// Unix nanoseconds at which the first notification was created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<i64>,

    /// Seconds of delay applied on the last requeue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_requeue_delay: Option<i64>,
}

impl Notification {
    /// Timing value used for backoff, preferring the canonical creation time
    pub fn timing(&self) -> Option<Timing> {
        if let Some(nanos) = self.creation_time {
            return Some(Timing::CreatedAt(DateTime::from_timestamp_nanos(nanos)));
        }

        self.last_requeue_delay
            .map(|secs| Timing::LastDelay(Duration::from_secs(secs.max(0) as u64)))
    }

    /// Numeric ID of the embedded object, if present
    pub fn object_id(&self) -> Option<ObjectId> {
        ["ID", "Id", "id"]
            .iter()
            .find_map(|key| self.object.get(*key))
            .and_then(Value::as_u64)
            .map(ObjectId::new)
    }

    /// Decode the embedded object into a concrete resource type
    pub fn decode_object<T: DeserializeOwned>(&self) -> Result<T, NotificationError> {
        serde_json::from_value(Value::Object(self.object.clone())).map_err(|source| {
            NotificationError::ObjectDecode {
                type_name: std::any::type_name::<T>(),
                source,
            }
        })
    }
}

/// Encode an object, operation and timing value into a notification payload
pub fn encode<T: Serialize>(
    object: &T,
    operation: Operation,
    timing: Timing,
) -> Result<Vec<u8>, NotificationError> {
    let object = match serde_json::to_value(object).map_err(NotificationError::Encode)? {
        Value::Object(map) => map,
        _ => return Err(NotificationError::ObjectNotAMap),
    };

    let (creation_time, last_requeue_delay) = match timing {
        Timing::CreatedAt(at) => (
            Some(
                at.timestamp_nanos_opt()
                    .ok_or(NotificationError::TimeOutOfRange(at))?,
            ),
            None,
        ),
        Timing::LastDelay(delay) => (None, Some(delay.as_secs() as i64)),
    };

    let notification = Notification {
        object,
        operation,
        creation_time,
        last_requeue_delay,
    };

    serde_json::to_vec(&notification).map_err(NotificationError::Encode)
}

/// Decode a notification payload
pub fn decode(bytes: &[u8]) -> Result<Notification, NotificationError> {
    let value: Value = serde_json::from_slice(bytes).map_err(NotificationError::Malformed)?;

    if let Some(object) = value.get("Object") {
        if !object.is_object() {
            return Err(NotificationError::ObjectNotAMap);
        }
    }

    serde_json::from_value(value).map_err(NotificationError::Malformed)
}
