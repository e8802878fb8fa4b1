//! Streaming plugin: serves playback manifests. Segment generation is an
//! external collaborator behind [`PlaylistSource`]; manifests are cacheable
//! and invalidated when a transcode completes.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use super::PluginBase;
use crate::error::{Result, ServiceError};
use crate::kernel::plugin::{Plugin, PluginContext, PluginDescriptor, PluginHealth};
use crate::pipeline::fingerprint::endpoint_prefix;
use crate::pipeline::{ApiRequest, ApiResponse, Endpoint, EndpointSpec, FnHandler};

/// External collaborator that renders a playback manifest for a video.
#[async_trait::async_trait]
pub trait PlaylistSource: Send + Sync {
    async fn manifest(&self, video_id: &str) -> Result<Value>;
}

/// Default source: a fixed rendition ladder pointing at the CDN path
/// layout. Deployments swap in the HLS/DASH packager's source.
pub struct LadderSource;

#[async_trait::async_trait]
impl PlaylistSource for LadderSource {
    async fn manifest(&self, video_id: &str) -> Result<Value> {
        Ok(json!({
            "video_id": video_id,
            "renditions": [
                {"name": "1080p", "bandwidth": 5_000_000, "uri": format!("/segments/{video_id}/1080p.m3u8")},
                {"name": "720p", "bandwidth": 2_800_000, "uri": format!("/segments/{video_id}/720p.m3u8")},
                {"name": "480p", "bandwidth": 1_200_000, "uri": format!("/segments/{video_id}/480p.m3u8")},
            ],
        }))
    }
}

pub struct StreamingPlugin {
    base: PluginBase,
    source: Arc<dyn PlaylistSource>,
}

impl StreamingPlugin {
    pub fn with_source(source: Arc<dyn PlaylistSource>) -> Self {
        Self {
            base: PluginBase::new("streaming"),
            source,
        }
    }

    pub fn new() -> Self {
        Self::with_source(Arc::new(LadderSource))
    }

    pub fn base(&self) -> &PluginBase {
        &self.base
    }
}

impl Default for StreamingPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Plugin for StreamingPlugin {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor::new("streaming")
            .with_endpoints(&[("GET", "/streams/{id}/manifest")])
            .subscribes(&["transcode.completed"])
            .with_dependencies(self.base.dependencies())
    }

    async fn init(&self, ctx: PluginContext) -> Result<()> {
        self.base.store_ctx(ctx).await;
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let ctx = self.base.ctx().await?;

        let source = self.source.clone();
        ctx.resources.endpoints.register(
            "streaming",
            Endpoint::new(
                EndpointSpec::get("streaming.manifest", "/streams/{id}/manifest")
                    .cacheable(Duration::from_secs(5)),
                Arc::new(FnHandler(move |req: ApiRequest| {
                    let source = source.clone();
                    async move {
                        let id = req
                            .path_param("/streams/{id}/manifest", "id")
                            .ok_or_else(|| ServiceError::invalid_input("missing stream id"))?;
                        let manifest = source.manifest(&id).await?;
                        Ok(ApiResponse::ok(manifest))
                    }
                })),
            ),
        );

        // A fresh transcode changes the rendition set; cached manifests for
        // the video are stale from that point.
        let cache = ctx.resources.cache.clone();
        let subscription = ctx.resources.bus.subscribe("transcode.completed").await?;
        tokio::spawn(subscription.consume(move |_event| {
            let cache = cache.clone();
            async move {
                cache
                    .invalidate_prefix(&endpoint_prefix("streaming", "streaming.manifest"))
                    .await;
            }
        }));

        self.base.join_fabric().await
    }

    async fn stop(&self) -> Result<()> {
        self.base.leave_fabric().await
    }

    async fn health(&self) -> PluginHealth {
        if self.base.is_ready() {
            PluginHealth::ready()
        } else {
            PluginHealth::not_ready("streaming not started")
        }
    }
}
