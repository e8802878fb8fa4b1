//! Metadata plugin: video records behind a pluggable [`MetadataStore`].
//! Reads are cacheable; writes declare the prefixes they invalidate and the
//! pipeline wipes them on success. `transcode.completed` events update the
//! stored transcode status.

use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use super::PluginBase;
use crate::error::{Result, ServiceError};
use crate::kernel::plugin::{Plugin, PluginContext, PluginDescriptor, PluginHealth};
use crate::pipeline::validate::{FieldKind, FieldRule};
use crate::pipeline::{ApiRequest, ApiResponse, Endpoint, EndpointSpec, FnHandler};

/// External collaborator: the record store (SQL in production; the default
/// is in-memory).
#[async_trait::async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Value>>;
    async fn put(&self, id: &str, record: Value) -> Result<()>;
    async fn list(&self) -> Result<Vec<Value>>;
}

pub struct MemoryMetadataStore {
    records: DashMap<String, Value>,
}

#[async_trait::async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn get(&self, id: &str) -> Result<Option<Value>> {
        Ok(self.records.get(id).map(|r| r.value().clone()))
    }

    async fn put(&self, id: &str, record: Value) -> Result<()> {
        self.records.insert(id.to_string(), record);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Value>> {
        let mut out: Vec<Value> = self.records.iter().map(|r| r.value().clone()).collect();
        out.sort_by_key(|v| v.get("id").and_then(|i| i.as_str()).map(|s| s.to_string()));
        Ok(out)
    }
}

pub struct MetadataPlugin {
    base: PluginBase,
    store: Arc<dyn MetadataStore>,
}

impl MetadataPlugin {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self {
            base: PluginBase::new("metadata"),
            store,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryMetadataStore {
            records: DashMap::new(),
        }))
    }

    pub fn base(&self) -> &PluginBase {
        &self.base
    }
}

#[async_trait::async_trait]
impl Plugin for MetadataPlugin {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor::new("metadata")
            .with_endpoints(&[
                ("GET", "/videos"),
                ("GET", "/videos/{id}"),
                ("PUT", "/videos/{id}"),
            ])
            .subscribes(&["transcode.completed"])
            .with_dependencies(self.base.dependencies())
    }

    async fn init(&self, ctx: PluginContext) -> Result<()> {
        self.base.store_ctx(ctx).await;
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let ctx = self.base.ctx().await?;
        let endpoints = &ctx.resources.endpoints;

        let store = self.store.clone();
        endpoints.register(
            "metadata",
            Endpoint::new(
                EndpointSpec::get("metadata.video.list", "/videos")
                    .cacheable(Duration::from_secs(10)),
                Arc::new(FnHandler(move |_req: ApiRequest| {
                    let store = store.clone();
                    async move {
                        let videos = store.list().await?;
                        Ok(ApiResponse::ok(json!({"videos": videos})))
                    }
                })),
            ),
        );

        let store = self.store.clone();
        endpoints.register(
            "metadata",
            Endpoint::new(
                EndpointSpec::get("metadata.video.get", "/videos/{id}")
                    .cacheable(Duration::from_secs(30)),
                Arc::new(FnHandler(move |req: ApiRequest| {
                    let store = store.clone();
                    async move {
                        let id = req
                            .path_param("/videos/{id}", "id")
                            .ok_or_else(|| ServiceError::invalid_input("missing video id"))?;
                        let record = store.get(&id).await?.ok_or(ServiceError::NotFound {
                            resource: format!("video {id}"),
                        })?;
                        Ok(ApiResponse::ok(record))
                    }
                })),
            ),
        );

        let store = self.store.clone();
        endpoints.register(
            "metadata",
            Endpoint::new(
                EndpointSpec::put("metadata.video.put", "/videos/{id}")
                    .rules(vec![FieldRule::required_body(
                        "title",
                        FieldKind::Str { min: 1, max: 512 },
                    )])
                    .invalidates("metadata", "metadata.video.get")
                    .invalidates("metadata", "metadata.video.list"),
                Arc::new(FnHandler(move |req: ApiRequest| {
                    let store = store.clone();
                    async move {
                        let id = req
                            .path_param("/videos/{id}", "id")
                            .ok_or_else(|| ServiceError::invalid_input("missing video id"))?;
                        let mut record = req.body.clone().unwrap_or_else(|| json!({}));
                        record["id"] = json!(id);
                        store.put(&id, record.clone()).await?;
                        Ok(ApiResponse::ok(record))
                    }
                })),
            ),
        );

        // Transcode completions mark the video ready for streaming.
        let store = self.store.clone();
        let cache = ctx.resources.cache.clone();
        let subscription = ctx.resources.bus.subscribe("transcode.completed").await?;
        tokio::spawn(subscription.consume(move |event| {
            let store = store.clone();
            let cache = cache.clone();
            async move {
                let Ok(payload) = event.payload_json::<Value>() else {
                    return;
                };
                let Some(video_id) = payload.get("video_id").and_then(|v| v.as_str()) else {
                    return;
                };
                let mut record = match store.get(video_id).await {
                    Ok(Some(record)) => record,
                    _ => json!({"id": video_id}),
                };
                record["transcode_status"] = json!("completed");
                if let Err(e) = store.put(video_id, record).await {
                    tracing::warn!(video = video_id, error = %e, "transcode status update failed");
                }
                cache
                    .invalidate_prefix(&crate::pipeline::fingerprint::endpoint_prefix(
                        "metadata",
                        "metadata.video.get",
                    ))
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
            PluginHealth::not_ready("metadata not started")
        }
    }
}
