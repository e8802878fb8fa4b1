//! # Plugin Contract
//!
//! Every service implementation, gateway included, is a plugin: it declares
//! a descriptor, receives the shared resource bundle in `init`, registers
//! its endpoints and service record in `start`, and releases everything in
//! `stop`. Plugins never hold a microkernel handle; the [`PluginContext`]
//! passed into `init` is the entire capability surface they get.

use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::resources::Resources;
use crate::error::Result;
use crate::health::ProbeResult;

/// Immutable declaration of a plugin: identity, dependencies, and surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct PluginDescriptor {
    /// Unique name, also the service name it registers under.
    pub name: String,
    pub version: String,
    /// Names of plugins this one depends on. Start order follows the
    /// resulting DAG; stop order reverses it.
    pub dependencies: Vec<String>,
    /// Endpoint surface, `(method, path)` pairs, informational.
    pub endpoints: Vec<(String, String)>,
    /// Subject patterns this plugin subscribes to.
    pub subscriptions: Vec<String>,
}

impl PluginDescriptor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            dependencies: Vec::new(),
            endpoints: Vec::new(),
            subscriptions: Vec::new(),
        }
    }

    pub fn depends_on(mut self, names: &[&str]) -> Self {
        self.dependencies = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn with_dependencies(mut self, names: Vec<String>) -> Self {
        self.dependencies = names;
        self
    }

    pub fn with_endpoints(mut self, endpoints: &[(&str, &str)]) -> Self {
        self.endpoints = endpoints
            .iter()
            .map(|(m, p)| (m.to_string(), p.to_string()))
            .collect();
        self
    }

    pub fn subscribes(mut self, subjects: &[&str]) -> Self {
        self.subscriptions = subjects.iter().map(|s| s.to_string()).collect();
        self
    }
}

/// Lifecycle phase of a plugin inside its microkernel. Transitions are
/// monotonic except Started/Stopped, and any phase may fall to Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginPhase {
    Registered,
    Initialized,
    Started,
    Stopped,
    Failed,
}

/// What a plugin's `init` receives: the shared resources, its configuration
/// namespace, and the shutdown signal. Deliberately narrow; there is no way
/// back to the microkernel from here.
#[derive(Clone)]
pub struct PluginContext {
    pub resources: Arc<Resources>,
    /// The plugin's key into per-endpoint configuration overrides.
    pub namespace: String,
    /// Fires once when the process begins an orderly stop.
    pub shutdown: CancellationToken,
}

/// Tri-level health as reported by a plugin.
#[derive(Debug, Clone, Serialize)]
pub struct PluginHealth {
    /// The plugin's tasks are running.
    pub live: bool,
    /// The plugin can serve traffic.
    pub ready: bool,
    /// Optional deep probe that exercised dependencies.
    pub deep: Option<ProbeResult>,
}

impl PluginHealth {
    pub fn ready() -> Self {
        Self {
            live: true,
            ready: true,
            deep: None,
        }
    }

    pub fn not_ready(detail: impl Into<String>) -> Self {
        Self {
            live: true,
            ready: false,
            deep: Some(ProbeResult::unhealthy(detail)),
        }
    }
}

/// The lifecycle contract. The microkernel drives transitions; plugins never
/// call their own lifecycle methods.
#[async_trait::async_trait]
pub trait Plugin: Send + Sync {
    fn descriptor(&self) -> PluginDescriptor;

    /// Receive resources and prepare internal state. Must not accept
    /// traffic yet.
    async fn init(&self, ctx: PluginContext) -> Result<()>;

    /// Register endpoints, the service record, and subscriptions. Returns
    /// when ready to serve.
    async fn start(&self) -> Result<()>;

    /// Stop accepting work, deregister, drain in flight, release resources.
    /// Idempotent.
    async fn stop(&self) -> Result<()>;

    async fn health(&self) -> PluginHealth;
}
