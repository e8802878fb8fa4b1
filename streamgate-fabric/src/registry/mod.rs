//! # Service Registry and Discovery
//!
//! Plugins register one [`ServiceRecord`] per running instance and heartbeat
//! it; consumers discover healthy instances by service name or watch a
//! service for membership changes. Two backends satisfy the
//! [`ServiceRegistry`] contract: [`in_memory::InMemoryRegistry`] (monolith, a
//! local table) and [`http::HttpRegistry`] (microservices, an external
//! registry service reached over HTTP).
//!
//! A record is either present with a recent health update or absent. Records
//! whose heartbeat lapses beyond the staleness window stop being discoverable
//! and are swept out with a `Left` watch event.

pub mod http;
pub mod in_memory;

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The registry's view of one running instance of a named service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceRecord {
    /// Logical service name, e.g. `"upload"`.
    pub service: String,
    /// Stable instance identity, ideally surviving restarts.
    pub instance_id: String,
    /// Reachable address for the instance.
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub tags: Vec<String>,
    /// URL probed by the registry backend (or advertised for scrapers).
    pub health_url: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ServiceRecord {
    /// Base URL for RPC calls to this instance.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.address, self.port)
    }

    pub fn key(&self) -> (String, String) {
        (self.service.clone(), self.instance_id.clone())
    }
}

/// Result of a discovery query. `stale` is set when the backend was
/// unreachable and the records are the last known healthy set.
#[derive(Debug, Clone)]
pub struct Discovery {
    pub records: Vec<ServiceRecord>,
    pub stale: bool,
}

/// Membership change delivered on a watch stream.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// Initial full set, always the first event on a new watch.
    Snapshot(Vec<ServiceRecord>),
    Joined(ServiceRecord),
    Left { service: String, instance_id: String },
}

/// A watch stream. `recv` returning `None` means the stream was lost; the
/// consumer must re-list via `discover` and reconcile.
pub struct Watch {
    pub(crate) rx: mpsc::Receiver<WatchEvent>,
}

impl Watch {
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }

    /// Adapt the watch into a `Stream` for combinator-style consumers.
    pub fn into_stream(self) -> tokio_stream::wrappers::ReceiverStream<WatchEvent> {
        tokio_stream::wrappers::ReceiverStream::new(self.rx)
    }
}

/// Registration, discovery, and watch contract shared by the backends.
#[async_trait::async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Register or update a record. Idempotent by (service, instance_id):
    /// re-registering updates address and metadata without a window of
    /// absence.
    async fn register(&self, record: ServiceRecord) -> Result<()>;

    /// Remove a record. Idempotent; unknown ids are a no-op.
    async fn deregister(&self, service: &str, instance_id: &str) -> Result<()>;

    /// Refresh the health timestamp for a registered record.
    async fn heartbeat(&self, service: &str, instance_id: &str) -> Result<()>;

    /// Healthy instances of `service`, filtered by the staleness window.
    async fn discover(&self, service: &str) -> Result<Discovery>;

    /// Watch `service` for membership changes. Delivers a snapshot first.
    async fn watch(&self, service: &str) -> Result<Watch>;
}

/// Health bookkeeping shared by the backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Maximum heartbeat age for a record to stay discoverable.
    #[serde(with = "crate::duration_serde")]
    pub staleness: Duration,
    /// How often owners heartbeat their records.
    #[serde(with = "crate::duration_serde")]
    pub heartbeat_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            staleness: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

/// Heartbeat a record on `interval` until `cancel` fires. Spawned by the
/// owning plugin's `start`; failures are logged and retried on the next tick
/// (the registry's own retry machinery handles backend outages).
pub fn spawn_heartbeat(
    registry: Arc<dyn ServiceRegistry>,
    service: String,
    instance_id: String,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = registry.heartbeat(&service, &instance_id).await {
                        tracing::warn!(service = %service, instance = %instance_id, error = %e, "heartbeat failed");
                    }
                }
            }
        }
    })
}
