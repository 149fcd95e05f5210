//! HTTP client for the resource API

use super::{ApiClient, ApiResult};
use crate::error::ApiError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tideline_types::{ObjectId, ObjectType};

/// REST client for the resource API
#[derive(Debug, Clone)]
pub struct RestApiClient {
    client: Client,
    base_url: String,
}

impl RestApiClient {
    /// Create a new client
    pub fn new(endpoint: &str, timeout: Duration) -> ApiResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: endpoint.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn handle_response(&self, path: &str, response: reqwest::Response) -> ApiResult<Value> {
        let status = response.status();

        if status == StatusCode::NO_CONTENT {
            Ok(Value::Null)
        } else if status.is_success() {
            Ok(response.json().await?)
        } else if status == StatusCode::NOT_FOUND {
            Err(ApiError::NotFound(path.to_string()))
        } else {
            let message = response.text().await.unwrap_or_default();
            Err(ApiError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }
}

#[async_trait]
impl ApiClient for RestApiClient {
    async fn get_by_id(&self, object_type: &ObjectType, id: ObjectId) -> ApiResult<Value> {
        let path = object_type.object_path(id);
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await?;
        self.handle_response(&path, response).await
    }

    async fn update(
        &self,
        object_type: &ObjectType,
        id: ObjectId,
        patch: &Value,
    ) -> ApiResult<Value> {
        let path = object_type.object_path(id);
        let response = self
            .client
            .patch(format!("{}{}", self.base_url, path))
            .json(patch)
            .send()
            .await?;
        self.handle_response(&path, response).await
    }

    async fn delete(&self, object_type: &ObjectType, id: ObjectId) -> ApiResult<Value> {
        let path = object_type.object_path(id);
        let response = self
            .client
            .delete(format!("{}{}", self.base_url, path))
            .send()
            .await?;
        self.handle_response(&path, response).await
    }

    async fn create(&self, object_type: &ObjectType, object: &Value) -> ApiResult<Value> {
        let path = object_type.api_path.clone();
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(object)
            .send()
            .await?;
        self.handle_response(&path, response).await
    }
}
