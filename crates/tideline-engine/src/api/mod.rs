//! Client contract for the authoritative resource API
//!
//! Objects travel as JSON; the engine decodes them into concrete resource
//! types itself. `update` takes a partial document and only touches the
//! fields it names.

mod memory;
mod rest;

pub use memory::{ApiCall, InMemoryApi};
pub use rest::RestApiClient;

use crate::error::ApiError;
use async_trait::async_trait;
use serde_json::Value;
use tideline_types::{ObjectId, ObjectType};

/// Result type for API operations
pub type ApiResult<T> = Result<T, ApiError>;

/// Resource API used by reconcilers
#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Fetch one object; [`ApiError::NotFound`] if it does not exist
    async fn get_by_id(&self, object_type: &ObjectType, id: ObjectId) -> ApiResult<Value>;

    /// Apply a partial update and return the updated object
    async fn update(&self, object_type: &ObjectType, id: ObjectId, patch: &Value)
        -> ApiResult<Value>;

    /// Delete an object and return what was deleted
    async fn delete(&self, object_type: &ObjectType, id: ObjectId) -> ApiResult<Value>;

    /// Create an object and return it with its assigned ID
    async fn create(&self, object_type: &ObjectType, object: &Value) -> ApiResult<Value>;
}
