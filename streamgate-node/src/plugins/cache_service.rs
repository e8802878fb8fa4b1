//! Cache service plugin: read-only stats plus operator-triggered
//! invalidation over the shared response cache.

use serde_json::json;
use std::sync::Arc;

use super::PluginBase;
use crate::error::{Result, ServiceError};
use crate::kernel::plugin::{Plugin, PluginContext, PluginDescriptor, PluginHealth};
use crate::pipeline::validate::{FieldKind, FieldRule};
use crate::pipeline::{ApiRequest, ApiResponse, Endpoint, EndpointSpec, FnHandler};

pub struct CacheServicePlugin {
    base: PluginBase,
}

impl CacheServicePlugin {
    pub fn new() -> Self {
        Self {
            base: PluginBase::new("cache"),
        }
    }

    pub fn base(&self) -> &PluginBase {
        &self.base
    }
}

impl Default for CacheServicePlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Plugin for CacheServicePlugin {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor::new("cache")
            .with_endpoints(&[("GET", "/cache/stats"), ("POST", "/cache/invalidate")])
            .with_dependencies(self.base.dependencies())
    }

    async fn init(&self, ctx: PluginContext) -> Result<()> {
        self.base.store_ctx(ctx).await;
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let ctx = self.base.ctx().await?;

        let cache = ctx.resources.cache.clone();
        ctx.resources.endpoints.register(
            "cache",
            Endpoint::new(
                EndpointSpec::get("cache.stats", "/cache/stats"),
                Arc::new(FnHandler(move |_req: ApiRequest| {
                    let cache = cache.clone();
                    async move { Ok(ApiResponse::ok(json!(cache.stats()))) }
                })),
            ),
        );

        let cache = ctx.resources.cache.clone();
        ctx.resources.endpoints.register(
            "cache",
            Endpoint::new(
                EndpointSpec::post("cache.invalidate", "/cache/invalidate").rules(vec![
                    FieldRule::required_body("prefix", FieldKind::Str { min: 1, max: 512 }),
                ]),
                Arc::new(FnHandler(move |req: ApiRequest| {
                    let cache = cache.clone();
                    async move {
                        let prefix = req
                            .body
                            .as_ref()
                            .and_then(|b| b.get("prefix"))
                            .and_then(|v| v.as_str())
                            .ok_or_else(|| ServiceError::invalid_input("missing prefix"))?;
                        cache.invalidate_prefix(prefix).await;
                        Ok(ApiResponse::ok(json!({"invalidated": prefix})))
                    }
                })),
            ),
        );

        self.base.join_fabric().await
    }

    async fn stop(&self) -> Result<()> {
        self.base.leave_fabric().await
    }

    async fn health(&self) -> PluginHealth {
        if self.base.is_ready() {
            PluginHealth::ready()
        } else {
            PluginHealth::not_ready("cache service not started")
        }
    }
}
