//! Monitor plugin: read-only surface over alert states and the metric
//! snapshot, for dashboards that want JSON rather than the scrape format.

use serde_json::json;
use std::sync::Arc;

use super::PluginBase;
use crate::error::Result;
use crate::kernel::plugin::{Plugin, PluginContext, PluginDescriptor, PluginHealth};
use crate::pipeline::{ApiRequest, ApiResponse, Endpoint, EndpointSpec, FnHandler};

pub struct MonitorPlugin {
    base: PluginBase,
}

impl MonitorPlugin {
    pub fn new() -> Self {
        Self {
            base: PluginBase::new("monitor"),
        }
    }

    pub fn base(&self) -> &PluginBase {
        &self.base
    }
}

impl Default for MonitorPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Plugin for MonitorPlugin {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor::new("monitor")
            .with_endpoints(&[("GET", "/monitor/alerts"), ("GET", "/monitor/metrics")])
            .with_dependencies(self.base.dependencies())
    }

    async fn init(&self, ctx: PluginContext) -> Result<()> {
        self.base.store_ctx(ctx).await;
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let ctx = self.base.ctx().await?;

        let alerts = ctx.resources.alerts.clone();
        ctx.resources.endpoints.register(
            "monitor",
            Endpoint::new(
                EndpointSpec::get("monitor.alerts", "/monitor/alerts"),
                Arc::new(FnHandler(move |_req: ApiRequest| {
                    let alerts = alerts.clone();
                    async move {
                        let states: Vec<_> = alerts
                            .states()
                            .into_iter()
                            .map(|(name, state)| json!({"rule": name, "state": state}))
                            .collect();
                        Ok(ApiResponse::ok(json!({"alerts": states})))
                    }
                })),
            ),
        );

        let metrics = ctx.resources.metrics.clone();
        ctx.resources.endpoints.register(
            "monitor",
            Endpoint::new(
                EndpointSpec::get("monitor.metrics", "/monitor/metrics"),
                Arc::new(FnHandler(move |_req: ApiRequest| {
                    let metrics = metrics.clone();
                    async move { Ok(ApiResponse::ok(json!({"series": metrics.snapshot()}))) }
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
            PluginHealth::not_ready("monitor not started")
        }
    }
}
