//! # Tideline Types
//!
//! Shared types for the Tideline reconciliation engine:
//!
//! - [`ObjectId`], [`ReconcilerId`] and [`ObjectType`] identify what is being
//!   reconciled and by whom
//! - [`Notification`] and the [`notification::encode`] / [`notification::decode`]
//!   codec describe units of work on the message queue
//! - [`ReconcileEvent`] is the operator-facing outcome record
//! - [`StatusPatch`] is the status written back to resource records

#![deny(unsafe_code)]

pub mod events;
pub mod ids;
pub mod notification;
pub mod status;

pub use events::{EventReason, EventSeverity, ObjectEvent, ReconcileEvent};
pub use ids::{ObjectId, ObjectType, ReconcilerId};
pub use notification::{Notification, NotificationError, Operation, Timing};
pub use status::StatusPatch;
