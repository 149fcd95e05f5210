//! Configuration for tidelined

use crate::error::{DaemonError, DaemonResult};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tideline_engine::BackoffPolicy;
use tideline_types::ObjectType;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Control server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Resource API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Broker and lock store backend
    #[serde(default)]
    pub backend: BackendConfig,

    /// Queue configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Lock configuration
    #[serde(default)]
    pub lock: LockConfig,

    /// Requeue backoff
    #[serde(default)]
    pub backoff: BackoffPolicy,

    /// Reconciled resource types
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Control server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    pub listen_addr: SocketAddr,

    /// Enable CORS
    #[serde(default = "default_true")]
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8181)),
            enable_cors: true,
        }
    }
}

/// Resource API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the resource API
    #[serde(default = "default_api_endpoint")]
    pub endpoint: String,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Collection path events are created under; events are only logged
    /// when unset
    #[serde(default)]
    pub events_path: Option<String>,

    /// Key handed to handlers for decrypting stored secrets
    #[serde(default)]
    pub encryption_key: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: default_api_endpoint(),
            request_timeout_secs: default_request_timeout(),
            events_path: None,
            encryption_key: None,
        }
    }
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Broker and lock store backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// In-memory broker and lock store (single process only)
    #[default]
    Memory,

    /// PostgreSQL broker and lock store
    Postgres {
        /// Connection URL
        url: String,

        /// Maximum connections in pool
        #[serde(default = "default_pool_size")]
        max_connections: u32,

        /// Connection timeout in seconds
        #[serde(default = "default_connection_timeout")]
        connect_timeout_secs: u64,
    },
}

/// Queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Seconds before an unacknowledged delivery is redelivered
    #[serde(default = "default_ack_wait")]
    pub ack_wait_secs: u64,

    /// Give up on a message after this many deliveries
    #[serde(default)]
    pub max_deliver: Option<u32>,

    /// Pause after an empty pull, in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Delay before redelivering an undecodable payload, in seconds
    #[serde(default = "default_raw_requeue_delay")]
    pub raw_requeue_delay_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            ack_wait_secs: default_ack_wait(),
            max_deliver: None,
            poll_interval_ms: default_poll_interval(),
            raw_requeue_delay_secs: default_raw_requeue_delay(),
        }
    }
}

impl QueueConfig {
    pub fn ack_wait(&self) -> Duration {
        Duration::from_secs(self.ack_wait_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn raw_requeue_delay(&self) -> Duration {
        Duration::from_secs(self.raw_requeue_delay_secs)
    }
}

/// Lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Bucket holding lock records
    #[serde(default = "default_lock_bucket")]
    pub bucket: String,

    /// Lock record lifetime in seconds
    #[serde(default = "default_lock_ttl")]
    pub ttl_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            bucket: default_lock_bucket(),
            ttl_secs: default_lock_ttl(),
        }
    }
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// One reconciled resource type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Type name, e.g. `WorkloadInstance`
    pub name: String,

    /// REST collection path, e.g. `/v0/workload-instances`
    pub api_path: String,

    /// Stream family; defaults to `{name}Stream`
    #[serde(default)]
    pub stream: Option<String>,

    /// Number of concurrent workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// URL the handler webhook is posted to
    pub hook_url: String,
}

impl ResourceConfig {
    pub fn object_type(&self) -> ObjectType {
        let stream = self
            .stream
            .clone()
            .unwrap_or_else(|| format!("{}Stream", self.name));
        ObjectType::new(self.name.clone(), self.api_path.clone(), stream)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_true() -> bool {
    true
}

fn default_api_endpoint() -> String {
    "http://127.0.0.1:1323".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_pool_size() -> u32 {
    10
}

fn default_connection_timeout() -> u64 {
    5
}

fn default_ack_wait() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    500
}

fn default_raw_requeue_delay() -> u64 {
    10
}

fn default_lock_bucket() -> String {
    "tideline-locks".to_string()
}

fn default_lock_ttl() -> u64 {
    20 * 60
}

fn default_workers() -> usize {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DaemonConfig {
    /// Load configuration from defaults, an optional file and `TIDELINE_*`
    /// environment variables
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        // Add default configuration
        builder = builder.add_source(config::Config::try_from(&DaemonConfig::default())?);

        // Add file configuration if provided
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        // Nested keys use a double underscore: TIDELINE_QUEUE__ACK_WAIT_SECS
        builder = builder.add_source(
            config::Environment::with_prefix("TIDELINE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Reject configurations the daemon cannot run
    pub fn validate(&self) -> DaemonResult<()> {
        if self.resources.is_empty() {
            return Err(DaemonError::Config("no resources configured".to_string()));
        }

        for resource in &self.resources {
            if resource.name.trim().is_empty() {
                return Err(DaemonError::Config("resource name is empty".to_string()));
            }
            if resource.workers == 0 {
                return Err(DaemonError::Config(format!(
                    "resource {} must have at least one worker",
                    resource.name
                )));
            }
            if resource.hook_url.trim().is_empty() {
                return Err(DaemonError::Config(format!(
                    "resource {} has no hook_url",
                    resource.name
                )));
            }
        }

        if self.lock.ttl_secs == 0 {
            return Err(DaemonError::Config("lock ttl must be positive".to_string()));
        }

        Ok(())
    }
}
