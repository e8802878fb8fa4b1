//! # API Gateway Plugin
//!
//! Owns the external `/api/v1` surface. Each route names the target service
//! and endpoint; dispatch prefers the in-process endpoint table (monolith)
//! and falls back to the RPC pool (microservices). The gateway applies its
//! own outer pipeline before dispatching, and the target applies its own
//! inner pipeline; both layers are deliberate: the gateway enforces
//! external-facing limits, the service enforces service-level limits.
//!
//! Convention: the external path is `/api/v1` + the service-local path, so
//! `/api/v1/videos/{id}` reaches the metadata service's `/videos/{id}`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::PluginBase;
use crate::error::{Result, ServiceError};
use crate::kernel::plugin::{Plugin, PluginContext, PluginDescriptor, PluginHealth};
use crate::kernel::resources::Resources;
use crate::pipeline::{ApiRequest, ApiResponse, Endpoint, EndpointSpec, FnHandler};

pub const EXTERNAL_PREFIX: &str = "/api/v1";

/// One external route: method + service-local path, owned by a service
/// endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRoute {
    pub method: String,
    /// Service-local path template, e.g. `/videos/{id}`.
    pub inner_path: String,
    pub service: String,
    /// Target endpoint name, e.g. `metadata.video.get`.
    pub endpoint: String,
}

impl GatewayRoute {
    fn new(method: &str, inner_path: &str, service: &str, endpoint: &str) -> Self {
        Self {
            method: method.to_string(),
            inner_path: inner_path.to_string(),
            service: service.to_string(),
            endpoint: endpoint.to_string(),
        }
    }

    pub fn external_path(&self) -> String {
        format!("{EXTERNAL_PREFIX}{}", self.inner_path)
    }
}

/// Request envelope carried over the RPC transport when the target runs in
/// another process. The serving side rebuilds an [`ApiRequest`] from it.
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcEnvelope {
    pub method: String,
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub client_ip: String,
    pub api_key: Option<String>,
    pub wallet: Option<String>,
}

impl RpcEnvelope {
    pub fn from_request(req: &ApiRequest) -> Self {
        Self {
            method: req.method.clone(),
            path: req.path.clone(),
            query: req.query.clone(),
            body: req.body.clone(),
            client_ip: req.client_ip.clone(),
            api_key: req.api_key.clone(),
            wallet: req.wallet.clone(),
        }
    }

    pub fn into_request(self, cancel: tokio_util::sync::CancellationToken) -> ApiRequest {
        let mut req = ApiRequest::new(self.method, self.path);
        req.query = self.query;
        req.body = self.body;
        req.client_ip = self.client_ip;
        req.api_key = self.api_key;
        req.wallet = self.wallet;
        req.cancel = cancel;
        req
    }
}

/// Response envelope for RPC answers, preserving the inner status code.
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcReply {
    pub status: u16,
    pub body: Value,
}

pub struct GatewayPlugin {
    base: PluginBase,
    routes: Vec<GatewayRoute>,
}

impl GatewayPlugin {
    pub fn new(routes: Vec<GatewayRoute>) -> Self {
        Self {
            base: PluginBase::new("api-gateway"),
            routes,
        }
    }

    /// The built-in service surface.
    pub fn with_default_routes() -> Self {
        Self::new(vec![
            GatewayRoute::new("POST", "/auth/challenge", "auth", "auth.challenge"),
            GatewayRoute::new("POST", "/auth/verify", "auth", "auth.verify"),
            GatewayRoute::new("POST", "/auth/token/verify", "auth", "auth.token.verify"),
            GatewayRoute::new("POST", "/auth/nft/verify", "auth", "auth.nft.verify"),
            GatewayRoute::new("POST", "/uploads", "upload", "upload.create"),
            GatewayRoute::new("PUT", "/uploads/{id}/chunks/{index}", "upload", "upload.chunk"),
            GatewayRoute::new("POST", "/uploads/{id}/complete", "upload", "upload.complete"),
            GatewayRoute::new("GET", "/uploads/{id}", "upload", "upload.status"),
            GatewayRoute::new("GET", "/videos", "metadata", "metadata.video.list"),
            GatewayRoute::new("GET", "/videos/{id}", "metadata", "metadata.video.get"),
            GatewayRoute::new("PUT", "/videos/{id}", "metadata", "metadata.video.put"),
            GatewayRoute::new("GET", "/streams/{id}/manifest", "streaming", "streaming.manifest"),
            GatewayRoute::new("GET", "/transcodes/{id}", "transcoder", "transcoder.job.get"),
            GatewayRoute::new("POST", "/jobs", "worker", "worker.job.submit"),
            GatewayRoute::new("GET", "/jobs/{id}", "worker", "worker.job.get"),
            GatewayRoute::new("GET", "/monitor/alerts", "monitor", "monitor.alerts"),
            GatewayRoute::new("GET", "/cache/stats", "cache", "cache.stats"),
            GatewayRoute::new("POST", "/cache/invalidate", "cache", "cache.invalidate"),
        ])
    }

    pub fn base(&self) -> &PluginBase {
        &self.base
    }

    fn gateway_endpoint(&self, route: &GatewayRoute, resources: Arc<Resources>) -> Endpoint {
        let spec = EndpointSpec {
            name: format!("gateway.{}", route.endpoint),
            method: route.method.clone(),
            path: route.external_path(),
            cacheable: false,
            cache_ttl: None,
            fingerprint_body_fields: Vec::new(),
            invalidate_prefixes: Vec::new(),
            rules: Vec::new(),
            idempotent: route.method == "GET",
            timeout: None,
        };
        let route = route.clone();
        let handler = Arc::new(FnHandler(move |req: ApiRequest| {
            let resources = resources.clone();
            let route = route.clone();
            async move { dispatch(&resources, &route, req).await }
        }));
        Endpoint::new(spec, handler)
    }
}

/// Route one admitted external request to its target service.
async fn dispatch(
    resources: &Arc<Resources>,
    route: &GatewayRoute,
    req: ApiRequest,
) -> Result<ApiResponse> {
    // Rewrite the external path onto the service-local surface. The inner
    // hop is its own request: fresh id, child cancellation.
    let inner_path = req
        .path
        .strip_prefix(EXTERNAL_PREFIX)
        .unwrap_or(&req.path)
        .to_string();
    let mut inner_req = req.clone();
    inner_req.id = uuid::Uuid::new_v4();
    inner_req.path = inner_path;
    inner_req.cancel = req.cancel.child_token();

    // In-process target first: the monolith case, and same-process services
    // in mixed deployments.
    if let Some(bound) = resources.endpoints.get(&route.service, &route.endpoint) {
        let pipeline = resources.pipeline(&route.service);
        return pipeline.execute(&bound.endpoint, inner_req).await;
    }

    // Remote target through the pool. The reply envelope preserves the
    // inner status.
    let envelope = RpcEnvelope::from_request(&inner_req);
    let payload = serde_json::to_value(&envelope)
        .map_err(|e| ServiceError::internal(format!("envelope encode failed: {e}")))?;
    let reply = resources
        .rpc
        .call_unary(&route.service, &route.endpoint, payload, None)
        .await
        .map_err(ServiceError::from)?;
    let reply: RpcReply = serde_json::from_value(reply)
        .map_err(|e| ServiceError::Upstream {
            message: format!("malformed reply from {}: {e}", route.service),
        })?;
    Ok(ApiResponse {
        status: reply.status,
        body: reply.body,
    })
}

#[async_trait::async_trait]
impl Plugin for GatewayPlugin {
    fn descriptor(&self) -> PluginDescriptor {
        let endpoints: Vec<(String, String)> = self
            .routes
            .iter()
            .map(|r| (r.method.clone(), r.external_path()))
            .collect();
        let mut descriptor = PluginDescriptor::new("api-gateway")
            .with_dependencies(self.base.dependencies());
        descriptor.endpoints = endpoints;
        descriptor
    }

    async fn init(&self, ctx: PluginContext) -> Result<()> {
        self.base.store_ctx(ctx).await;
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let ctx = self.base.ctx().await?;
        for route in &self.routes {
            ctx.resources
                .endpoints
                .register("api-gateway", self.gateway_endpoint(route, ctx.resources.clone()));
        }
        self.base.join_fabric().await
    }

    async fn stop(&self) -> Result<()> {
        self.base.leave_fabric().await
    }

    async fn health(&self) -> PluginHealth {
        if self.base.is_ready() {
            PluginHealth::ready()
        } else {
            PluginHealth::not_ready("gateway not started")
        }
    }
}

/// Build the RPC reply for a pipeline outcome, used by the serving route.
pub fn reply_for(outcome: Result<ApiResponse>) -> (u16, Value) {
    match outcome {
        Ok(response) => (
            200,
            json!(RpcReply {
                status: response.status,
                body: response.body,
            }),
        ),
        Err(err) => (err.status().as_u16(), err.body()),
    }
}
