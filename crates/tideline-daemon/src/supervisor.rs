//! Reconciler supervision
//!
//! Builds the shared backends from configuration, provisions a stream and
//! durable consumer for every configured resource type, and spawns the
//! requested number of reconciler workers for each.

use crate::api::rest::state::ResourceSummary;
use crate::config::{BackendConfig, DaemonConfig, ResourceConfig};
use crate::error::DaemonResult;
use crate::hooks::{DynamicObject, HookHandler};
use std::sync::Arc;
use std::time::Duration;
use tideline_engine::{
    provision, ApiClient, ApiEventRecorder, Broker, EventRecorder, InMemoryBroker,
    InMemoryKvStore, Interrupts, KvStore, LogEventRecorder, PostgresBroker, PostgresKvStore,
    Reconciler, ReconcilerConfig, RestApiClient, ShutdownRegistry, TaskTracker,
};
use tideline_types::ObjectType;
use tokio::task::JoinHandle;

/// How often expired lock rows are deleted
const LOCK_JANITOR_INTERVAL: Duration = Duration::from_secs(60);

/// Shared clients every reconciler uses
#[derive(Clone)]
pub struct Backends {
    pub api: Arc<dyn ApiClient>,
    pub broker: Arc<dyn Broker>,
    pub kv_store: Arc<dyn KvStore>,
    pub events: Arc<dyn EventRecorder>,
    postgres_locks: Option<PostgresKvStore>,
}

impl Backends {
    /// Connect to the resource API and the configured broker and lock store
    pub async fn connect(config: &DaemonConfig) -> DaemonResult<Self> {
        let api: Arc<dyn ApiClient> = Arc::new(RestApiClient::new(
            &config.api.endpoint,
            config.api.request_timeout(),
        )?);

        let events: Arc<dyn EventRecorder> = match &config.api.events_path {
            Some(path) => Arc::new(ApiEventRecorder::new(
                api.clone(),
                ObjectType::new("Event", path.clone(), "EventStream"),
            )),
            None => Arc::new(LogEventRecorder),
        };

        match &config.backend {
            BackendConfig::Memory => {
                tracing::warn!("Using in-memory broker and lock store; state is not shared");
                Ok(Self {
                    api,
                    broker: Arc::new(InMemoryBroker::new()),
                    kv_store: Arc::new(InMemoryKvStore::new(
                        config.lock.bucket.clone(),
                        config.lock.ttl(),
                    )),
                    events,
                    postgres_locks: None,
                })
            }
            BackendConfig::Postgres {
                url,
                max_connections,
                connect_timeout_secs,
            } => {
                let broker =
                    PostgresBroker::connect(url, *max_connections, *connect_timeout_secs).await?;
                let locks = PostgresKvStore::from_pool(
                    broker.pool().clone(),
                    config.lock.bucket.clone(),
                    config.lock.ttl(),
                )
                .await?;

                tracing::info!(
                    max_connections = *max_connections,
                    "Connected to PostgreSQL backend"
                );
                Ok(Self {
                    api,
                    broker: Arc::new(broker),
                    kv_store: Arc::new(locks.clone()),
                    events,
                    postgres_locks: Some(locks),
                })
            }
        }
    }

    /// Use prebuilt clients
    pub fn new(
        api: Arc<dyn ApiClient>,
        broker: Arc<dyn Broker>,
        kv_store: Arc<dyn KvStore>,
        events: Arc<dyn EventRecorder>,
    ) -> Self {
        Self {
            api,
            broker,
            kv_store,
            events,
            postgres_locks: None,
        }
    }
}

/// Owns every running reconciler
pub struct Supervisor {
    registry: ShutdownRegistry,
    tracker: TaskTracker,
    resources: Vec<ResourceSummary>,
    janitor: Option<JoinHandle<()>>,
}

impl Supervisor {
    /// Provision queues and start all configured workers
    pub async fn start(
        config: &DaemonConfig,
        backends: Backends,
        interrupts: Interrupts,
    ) -> DaemonResult<Self> {
        let registry = ShutdownRegistry::new();
        let tracker = TaskTracker::new();
        let mut resources = Vec::with_capacity(config.resources.len());

        for resource in &config.resources {
            let summary = start_resource(
                config,
                resource,
                &backends,
                &registry,
                &tracker,
                &interrupts,
            )
            .await?;
            resources.push(summary);
        }

        // Reconcilers hold their own tickets; nothing else joins the group.
        tracker.close();

        let janitor = backends.postgres_locks.clone().map(spawn_lock_janitor);

        Ok(Self {
            registry,
            tracker,
            resources,
            janitor,
        })
    }

    pub fn registry(&self) -> &ShutdownRegistry {
        &self.registry
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    pub fn resources(&self) -> &[ResourceSummary] {
        &self.resources
    }

    /// Ask every reconciler to stop after its current message
    pub async fn shutdown(&self) -> usize {
        self.registry.shutdown_all().await
    }

    /// Wait for every reconciler to close its subscription
    pub async fn wait(self) {
        self.tracker.wait().await;
        if let Some(janitor) = self.janitor {
            janitor.abort();
        }
        tracing::info!("All reconcilers stopped");
    }
}

async fn start_resource(
    config: &DaemonConfig,
    resource: &ResourceConfig,
    backends: &Backends,
    registry: &ShutdownRegistry,
    tracker: &TaskTracker,
    interrupts: &Interrupts,
) -> DaemonResult<ResourceSummary> {
    let object_type = resource.object_type();

    provision(
        backends.broker.as_ref(),
        &object_type,
        config.queue.ack_wait(),
        config.queue.max_deliver,
    )
    .await?;

    let handler = Arc::new(HookHandler::new(
        resource.hook_url.clone(),
        config.api.request_timeout(),
    )?);

    for worker in 0..resource.workers {
        let mut reconciler_config = ReconcilerConfig::<DynamicObject>::new(
            object_type.clone(),
            backends.api.clone(),
            backends.broker.clone(),
            backends.kv_store.clone(),
            handler.clone(),
            registry.register().await,
            tracker.clone(),
            interrupts.clone(),
        )
        .with_events(backends.events.clone())
        .with_backoff(config.backoff.clone())
        .with_poll_interval(config.queue.poll_interval())
        .with_raw_requeue_delay(config.queue.raw_requeue_delay());

        if let Some(key) = &config.api.encryption_key {
            reconciler_config = reconciler_config.with_encryption_key(key.clone());
        }

        let reconciler = Reconciler::start(reconciler_config).await?;
        let reconciler_id = reconciler.reconciler_id();

        tokio::spawn(async move {
            if let Err(e) = reconciler.run_until_shutdown().await {
                tracing::error!(%reconciler_id, error = %e, "Reconciler exited with error");
            }
        });

        tracing::debug!(
            object_type = %object_type,
            %reconciler_id,
            worker,
            "Reconciler worker spawned"
        );
    }

    tracing::info!(
        object_type = %object_type,
        stream = %object_type.stream,
        workers = resource.workers,
        hook = %handler.url(),
        "Resource type registered"
    );

    Ok(ResourceSummary {
        name: resource.name.clone(),
        stream: object_type.stream.clone(),
        workers: resource.workers,
    })
}

fn spawn_lock_janitor(locks: PostgresKvStore) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(LOCK_JANITOR_INTERVAL);
        loop {
            interval.tick().await;
            match locks.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => tracing::debug!(purged, "Purged expired locks"),
                Err(e) => tracing::warn!(error = %e, "Failed to purge expired locks"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceConfig;
    use serde_json::json;
    use tideline_engine::{InMemoryApi, InMemoryEventRecorder, NotificationPublisher};
    use tideline_types::{ObjectId, Operation};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(hook_url: String) -> DaemonConfig {
        let mut config = DaemonConfig::default();
        config.queue.poll_interval_ms = 20;
        config.resources.push(ResourceConfig {
            name: "Workload".to_string(),
            api_path: "/v0/workloads".to_string(),
            stream: None,
            workers: 2,
            hook_url,
        });
        config
    }

    #[tokio::test]
    async fn test_workers_reconcile_and_stop() {
        let hook = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&hook)
            .await;

        let config = config(format!("{}/hook", hook.uri()));
        let object_type = config.resources[0].object_type();

        let api = Arc::new(InMemoryApi::new());
        let object = match json!({"ID": 7, "Name": "web"}) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        };
        api.insert(&object_type, ObjectId::new(7), object.clone()).await;

        let broker = Arc::new(InMemoryBroker::new());
        let backends = Backends::new(
            api.clone(),
            broker.clone(),
            Arc::new(InMemoryKvStore::new("locks", Duration::from_secs(60))),
            Arc::new(InMemoryEventRecorder::new()),
        );

        let supervisor = Supervisor::start(&config, backends, Interrupts::manual())
            .await
            .unwrap();
        assert_eq!(supervisor.registry().len().await, 2);
        assert_eq!(supervisor.resources()[0].stream, "WorkloadStream");

        NotificationPublisher::new(broker.clone(), &object_type)
            .publish(&object, Operation::Created)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while broker
                .pending("WorkloadStream", "WorkloadReconciler")
                .await
                > 0
            {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(supervisor.shutdown().await, 2);
        tokio::time::timeout(Duration::from_secs(5), supervisor.wait())
            .await
            .unwrap();
    }
}
