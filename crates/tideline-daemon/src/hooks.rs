//! Webhook-backed resource handlers
//!
//! The daemon does not link resource-specific code. Each configured resource
//! type is reconciled as an untyped JSON object, and its handler forwards the
//! object to an HTTP hook that does the actual infrastructure work.
//!
//! The hook receives `{"operation", "object", "attempt", "reconciler_id"}`.
//! A 2xx response completes reconciliation; a body of
//! `{"requeue_after_secs": n}` asks to be called again after `n` seconds. Any
//! other status is a handler error.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tideline_engine::{
    HandlerError, HandlerOutcome, HandlerResult, ReconcileContext, ReconcileHandler, Resource,
};
use tideline_types::ObjectId;

/// A resource object of a type the daemon has no Rust type for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DynamicObject(pub Map<String, Value>);

impl Resource for DynamicObject {
    fn id(&self) -> Option<ObjectId> {
        ["ID", "Id", "id"]
            .iter()
            .find_map(|key| self.0.get(*key))
            .and_then(Value::as_u64)
            .map(ObjectId::new)
    }
}

#[derive(Debug, Serialize)]
struct HookRequest<'a> {
    operation: &'a str,
    object: &'a DynamicObject,
    attempt: u32,
    reconciler_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct HookResponse {
    #[serde(default)]
    requeue_after_secs: Option<u64>,
}

/// Handler that posts every operation to a webhook
#[derive(Debug, Clone)]
pub struct HookHandler {
    client: Client,
    url: String,
}

impl HookHandler {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call(&self, ctx: &ReconcileContext, object: &DynamicObject) -> HandlerResult {
        let request = HookRequest {
            operation: ctx.operation.as_str(),
            object,
            attempt: ctx.attempt,
            reconciler_id: ctx.reconciler_id.to_string(),
        };

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(HandlerError::new)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HandlerError::msg(format!(
                "hook {} returned {}: {}",
                self.url, status, body
            )));
        }

        let body = response.bytes().await.map_err(HandlerError::new)?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(HandlerOutcome::done());
        }

        let reply: HookResponse = serde_json::from_slice(&body).map_err(HandlerError::new)?;
        Ok(match reply.requeue_after_secs {
            Some(secs) => HandlerOutcome::requeue_after(Duration::from_secs(secs)),
            None => HandlerOutcome::done(),
        })
    }
}

#[async_trait]
impl ReconcileHandler<DynamicObject> for HookHandler {
    async fn created(&self, ctx: &ReconcileContext, object: &DynamicObject) -> HandlerResult {
        self.call(ctx, object).await
    }

    async fn updated(&self, ctx: &ReconcileContext, object: &DynamicObject) -> HandlerResult {
        self.call(ctx, object).await
    }

    async fn deleted(&self, ctx: &ReconcileContext, object: &DynamicObject) -> HandlerResult {
        self.call(ctx, object).await
    }
}
