//! # Built-in Plugins
//!
//! The StreamGate service set: the API gateway, auth, and the seven
//! domain services (upload, streaming, metadata, cache, worker, monitor,
//! transcoder). Every one of them is an ordinary [`Plugin`]: the monolith
//! registers them all into one microkernel, a microservice process
//! registers exactly one. Domain work that belongs to external
//! collaborators (codec invocation, chain RPC, storage) sits behind traits
//! declared in the owning plugin module.

pub mod auth;
pub mod cache_service;
pub mod gateway;
pub mod metadata;
pub mod monitor;
pub mod streaming;
pub mod transcoder;
pub mod upload;
pub mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{Result, ServiceError};
use crate::kernel::plugin::{Plugin, PluginContext};
use streamgate_fabric::registry::spawn_heartbeat;

/// Shared lifecycle state every built-in plugin embeds: the injected
/// context, a readiness flag, and the register/deregister plumbing that is
/// identical across services.
///
/// Dependency edges are deployment wiring, not plugin identity: the
/// monolith factory sets them for co-resident start ordering, while a
/// single-service process leaves them empty and relies on discovery.
pub struct PluginBase {
    service: &'static str,
    dependencies: std::sync::Mutex<Vec<String>>,
    ctx: RwLock<Option<PluginContext>>,
    ready: AtomicBool,
}

impl PluginBase {
    pub fn new(service: &'static str) -> Self {
        Self {
            service,
            dependencies: std::sync::Mutex::new(Vec::new()),
            ctx: RwLock::new(None),
            ready: AtomicBool::new(false),
        }
    }

    pub fn service(&self) -> &'static str {
        self.service
    }

    pub fn set_dependencies(&self, deps: &[&str]) {
        *self.dependencies.lock().expect("deps lock poisoned") =
            deps.iter().map(|d| d.to_string()).collect();
    }

    pub fn dependencies(&self) -> Vec<String> {
        self.dependencies.lock().expect("deps lock poisoned").clone()
    }

    pub async fn store_ctx(&self, ctx: PluginContext) {
        *self.ctx.write().await = Some(ctx);
    }

    pub async fn ctx(&self) -> Result<PluginContext> {
        self.ctx
            .read()
            .await
            .clone()
            .ok_or_else(|| ServiceError::internal(format!("{} used before init", self.service)))
    }

    /// Register the service record with discovery and begin heartbeating.
    pub async fn join_fabric(&self) -> Result<()> {
        let ctx = self.ctx().await?;
        let record = ctx.resources.service_record(self.service);
        let instance_id = record.instance_id.clone();
        ctx.resources.registry.register(record).await?;
        spawn_heartbeat(
            ctx.resources.registry.clone(),
            self.service.to_string(),
            instance_id,
            ctx.resources.config.registry.health_interval,
            ctx.shutdown.child_token(),
        );
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Deregister and drop the endpoint surface. Idempotent.
    pub async fn leave_fabric(&self) -> Result<()> {
        if !self.ready.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let ctx = self.ctx().await?;
        let record = ctx.resources.service_record(self.service);
        ctx.resources
            .registry
            .deregister(self.service, &record.instance_id)
            .await?;
        ctx.resources.endpoints.deregister_service(self.service);
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

/// The full monolith plugin set with co-resident dependency edges.
pub fn monolith_set() -> Vec<Arc<dyn Plugin>> {
    let auth = auth::AuthPlugin::with_default_collaborators();
    let metadata = metadata::MetadataPlugin::in_memory();
    let cache = cache_service::CacheServicePlugin::new();
    let upload = upload::UploadPlugin::in_memory();
    upload.base().set_dependencies(&["auth", "metadata"]);
    let worker = worker::WorkerPlugin::new();
    let transcoder = transcoder::TranscoderPlugin::with_default_backend();
    transcoder.base().set_dependencies(&["upload", "worker"]);
    let streaming = streaming::StreamingPlugin::new();
    streaming.base().set_dependencies(&["metadata", "transcoder"]);
    let monitor = monitor::MonitorPlugin::new();
    let gateway = gateway::GatewayPlugin::with_default_routes();
    gateway.base().set_dependencies(&[
        "auth",
        "metadata",
        "cache",
        "upload",
        "transcoder",
        "streaming",
        "worker",
        "monitor",
    ]);
    vec![
        Arc::new(auth),
        Arc::new(metadata),
        Arc::new(cache),
        Arc::new(upload),
        Arc::new(worker),
        Arc::new(transcoder),
        Arc::new(streaming),
        Arc::new(monitor),
        Arc::new(gateway),
    ]
}

/// The plugin for one microservice process, by service name. No in-process
/// dependency edges: peers are reached through discovery.
pub fn service_plugin(name: &str) -> Option<Arc<dyn Plugin>> {
    let plugin: Arc<dyn Plugin> = match name {
        "auth" => Arc::new(auth::AuthPlugin::with_default_collaborators()),
        "metadata" => Arc::new(metadata::MetadataPlugin::in_memory()),
        "cache" => Arc::new(cache_service::CacheServicePlugin::new()),
        "upload" => Arc::new(upload::UploadPlugin::in_memory()),
        "transcoder" => Arc::new(transcoder::TranscoderPlugin::with_default_backend()),
        "streaming" => Arc::new(streaming::StreamingPlugin::new()),
        "worker" => Arc::new(worker::WorkerPlugin::new()),
        "monitor" => Arc::new(monitor::MonitorPlugin::new()),
        "api-gateway" => Arc::new(gateway::GatewayPlugin::with_default_routes()),
        _ => return None,
    };
    Some(plugin)
}
