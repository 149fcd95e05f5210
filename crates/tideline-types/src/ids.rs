//! Identifiers for reconciled objects and reconciler processes
//!
//! Object IDs are the numeric primary keys assigned by the API. Reconciler IDs
//! are UUIDs generated once per process and used only for observability.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Numeric identity of a resource record in the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(u64);

impl ObjectId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for ObjectId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-scoped identity of a reconciler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReconcilerId(Uuid);

impl ReconcilerId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ReconcilerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reconciler:{}", self.0)
    }
}

/// Metadata describing one reconciled resource type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectType {
    /// Type name, e.g. `AwsRelationalDatabaseInstance`
    pub name: String,

    /// REST collection path, e.g. `/v0/aws-relational-database-instances`
    pub api_path: String,

    /// Broker stream the type's subjects belong to
    pub stream: String,
}

impl ObjectType {
    pub fn new(
        name: impl Into<String>,
        api_path: impl Into<String>,
        stream: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            api_path: api_path.into(),
            stream: stream.into(),
        }
    }

    /// Key of the lock record guarding one object of this type
    pub fn lock_key(&self, id: ObjectId) -> String {
        format!("{}-{}", self.name, id)
    }

    /// Name of the durable consumer shared by every worker of this type
    pub fn consumer_name(&self) -> String {
        format!("{}Reconciler", self.name)
    }

    /// API path of a single object
    pub fn object_path(&self, id: ObjectId) -> String {
        format!("{}/{}", self.api_path.trim_end_matches('/'), id)
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
