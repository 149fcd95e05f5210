//! Reconciliation status written back to resource records
//!
//! These are partial updates: only the fields set here are sent to the API,
//! everything else on the record is left alone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Partial update of a record's reconciliation status
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciled: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_scheduled: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_acknowledged: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_confirmed: Option<DateTime<Utc>>,
}

impl StatusPatch {
    /// Mark a created or updated object as reconciled
    pub fn reconciled() -> Self {
        Self {
            reconciled: Some(true),
            ..Default::default()
        }
    }

    /// Confirm deletion of an object whose delete handler succeeded
    pub fn deletion_confirmed(at: DateTime<Utc>) -> Self {
        Self {
            deletion_acknowledged: Some(at),
            deletion_confirmed: Some(at),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconciled_patch_only_sets_flag() {
        let json = serde_json::to_value(StatusPatch::reconciled()).unwrap();
        assert_eq!(json, serde_json::json!({"Reconciled": true}));
    }

    #[test]
    fn test_deletion_patch_sets_both_timestamps() {
        let now = Utc::now();
        let patch = StatusPatch::deletion_confirmed(now);
        assert_eq!(patch.deletion_acknowledged, Some(now));
        assert_eq!(patch.deletion_confirmed, Some(now));
        assert!(patch.reconciled.is_none());
        assert!(!patch.is_empty());
        assert!(StatusPatch::default().is_empty());
    }
}
