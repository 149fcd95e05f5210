//! In-memory resource API

use super::{ApiClient, ApiResult};
use crate::error::ApiError;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tideline_types::{ObjectId, ObjectType};
use tokio::sync::RwLock;

/// A call made against [`InMemoryApi`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    Get(String, ObjectId),
    Update(String, ObjectId),
    Delete(String, ObjectId),
    Create(String),
}

/// In-memory resource API for development and testing
///
/// Records every call so tests can assert on what the engine did, and can be
/// switched into an unavailable mode that fails every call.
#[derive(Debug, Clone, Default)]
pub struct InMemoryApi {
    objects: Arc<RwLock<HashMap<(String, ObjectId), Map<String, Value>>>>,
    calls: Arc<RwLock<Vec<ApiCall>>>,
    next_id: Arc<AtomicU64>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object under its `ID` field
    pub async fn insert(&self, object_type: &ObjectType, id: ObjectId, mut object: Map<String, Value>) {
        object.insert("ID".to_string(), Value::from(id.get()));
        self.next_id.fetch_max(id.get(), Ordering::SeqCst);
        let mut objects = self.objects.write().await;
        objects.insert((object_type.name.clone(), id), object);
    }

    /// Current state of an object
    pub async fn object(&self, object_type: &ObjectType, id: ObjectId) -> Option<Map<String, Value>> {
        let objects = self.objects.read().await;
        objects.get(&(object_type.name.clone(), id)).cloned()
    }

    /// Every call made so far
    pub async fn calls(&self) -> Vec<ApiCall> {
        self.calls.read().await.clone()
    }

    /// Fail every subsequent call with a 503
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    async fn record(&self, call: ApiCall) -> ApiResult<()> {
        self.calls.write().await.push(call);

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ApiError::Api {
                status: 503,
                message: "API unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ApiClient for InMemoryApi {
    async fn get_by_id(&self, object_type: &ObjectType, id: ObjectId) -> ApiResult<Value> {
        self.record(ApiCall::Get(object_type.name.clone(), id)).await?;

        let objects = self.objects.read().await;
        objects
            .get(&(object_type.name.clone(), id))
            .cloned()
            .map(Value::Object)
            .ok_or_else(|| ApiError::NotFound(object_type.object_path(id)))
    }

    async fn update(
        &self,
        object_type: &ObjectType,
        id: ObjectId,
        patch: &Value,
    ) -> ApiResult<Value> {
        self.record(ApiCall::Update(object_type.name.clone(), id)).await?;

        let mut objects = self.objects.write().await;
        let object = objects
            .get_mut(&(object_type.name.clone(), id))
            .ok_or_else(|| ApiError::NotFound(object_type.object_path(id)))?;

        if let Value::Object(fields) = patch {
            for (key, value) in fields {
                object.insert(key.clone(), value.clone());
            }
        }

        Ok(Value::Object(object.clone()))
    }

    async fn delete(&self, object_type: &ObjectType, id: ObjectId) -> ApiResult<Value> {
        self.record(ApiCall::Delete(object_type.name.clone(), id)).await?;

        let mut objects = self.objects.write().await;
        objects
            .remove(&(object_type.name.clone(), id))
            .map(Value::Object)
            .ok_or_else(|| ApiError::NotFound(object_type.object_path(id)))
    }

    async fn create(&self, object_type: &ObjectType, object: &Value) -> ApiResult<Value> {
        self.record(ApiCall::Create(object_type.name.clone())).await?;

        let Value::Object(fields) = object else {
            return Err(ApiError::Api {
                status: 400,
                message: "object must be a JSON object".to_string(),
            });
        };

        let id = ObjectId::new(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let mut stored = fields.clone();
        stored.insert("ID".to_string(), Value::from(id.get()));

        let mut objects = self.objects.write().await;
        objects.insert((object_type.name.clone(), id), stored.clone());
        Ok(Value::Object(stored))
    }
}
