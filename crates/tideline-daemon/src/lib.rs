//! Tideline daemon library
//!
//! Hosts reconcilers for resource types declared in configuration:
//! - Backend wiring for the resource API, broker and lock store
//! - Webhook handlers for untyped resources
//! - A small control API for health, status and shutdown

pub mod api;
pub mod config;
pub mod error;
pub mod hooks;
pub mod server;
pub mod supervisor;

pub use config::DaemonConfig;
pub use error::{DaemonError, DaemonResult};
pub use hooks::{DynamicObject, HookHandler};
pub use server::Server;
pub use supervisor::{Backends, Supervisor};
