//! Upload plugin: chunked ingest sessions. Chunk persistence is an external
//! collaborator behind [`ChunkStore`]; this plugin owns session state, the
//! endpoint surface, and the `upload.completed` event.

use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use super::PluginBase;
use crate::error::{Result, ServiceError};
use crate::kernel::plugin::{Plugin, PluginContext, PluginDescriptor, PluginHealth};
use crate::pipeline::validate::{FieldKind, FieldRule};
use crate::pipeline::{ApiRequest, ApiResponse, Endpoint, EndpointSpec, FnHandler};
use streamgate_fabric::bus::publish_json;

pub const SUBJECT_UPLOAD_COMPLETED: &str = "upload.completed";

/// External collaborator that persists chunk payloads.
#[async_trait::async_trait]
pub trait ChunkStore: Send + Sync {
    async fn put_chunk(&self, upload_id: &str, index: u64, bytes: Vec<u8>) -> Result<()>;
    /// Seal the upload; returns total bytes stored.
    async fn seal(&self, upload_id: &str) -> Result<u64>;
    async fn discard(&self, upload_id: &str) -> Result<()>;
}

/// Default store keeping chunks in process memory; deployments swap in an
/// object-store backed implementation.
pub struct MemoryChunkStore {
    chunks: DashMap<String, Vec<(u64, Vec<u8>)>>,
}

#[async_trait::async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn put_chunk(&self, upload_id: &str, index: u64, bytes: Vec<u8>) -> Result<()> {
        self.chunks
            .entry(upload_id.to_string())
            .or_default()
            .push((index, bytes));
        Ok(())
    }

    async fn seal(&self, upload_id: &str) -> Result<u64> {
        let mut chunks = self
            .chunks
            .get_mut(upload_id)
            .ok_or_else(|| ServiceError::NotFound {
                resource: format!("upload {upload_id}"),
            })?;
        chunks.sort_by_key(|(index, _)| *index);
        Ok(chunks.iter().map(|(_, b)| b.len() as u64).sum())
    }

    async fn discard(&self, upload_id: &str) -> Result<()> {
        self.chunks.remove(upload_id);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
enum SessionState {
    Receiving,
    Completed,
}

struct Session {
    wallet: Option<String>,
    filename: String,
    state: SessionState,
    chunks: u64,
    bytes: u64,
}

pub struct UploadPlugin {
    base: PluginBase,
    store: Arc<dyn ChunkStore>,
    sessions: Arc<DashMap<String, Session>>,
}

impl UploadPlugin {
    pub fn new(store: Arc<dyn ChunkStore>) -> Self {
        Self {
            base: PluginBase::new("upload"),
            store,
            sessions: Arc::new(DashMap::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryChunkStore {
            chunks: DashMap::new(),
        }))
    }

    pub fn base(&self) -> &PluginBase {
        &self.base
    }
}

#[async_trait::async_trait]
impl Plugin for UploadPlugin {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor::new("upload")
            .with_endpoints(&[
                ("POST", "/uploads"),
                ("PUT", "/uploads/{id}/chunks/{index}"),
                ("POST", "/uploads/{id}/complete"),
                ("GET", "/uploads/{id}"),
            ])
            .with_dependencies(self.base.dependencies())
    }

    async fn init(&self, ctx: PluginContext) -> Result<()> {
        self.base.store_ctx(ctx).await;
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let ctx = self.base.ctx().await?;
        let endpoints = &ctx.resources.endpoints;

        let sessions = self.sessions.clone();
        endpoints.register(
            "upload",
            Endpoint::new(
                EndpointSpec::post("upload.create", "/uploads").rules(vec![
                    FieldRule::required_body("filename", FieldKind::Str { min: 1, max: 512 }),
                ]),
                Arc::new(FnHandler(move |req: ApiRequest| {
                    let sessions = sessions.clone();
                    async move {
                        let filename = req
                            .body
                            .as_ref()
                            .and_then(|b| b.get("filename"))
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string();
                        let id = Uuid::new_v4().to_string();
                        sessions.insert(
                            id.clone(),
                            Session {
                                wallet: req.wallet.clone(),
                                filename,
                                state: SessionState::Receiving,
                                chunks: 0,
                                bytes: 0,
                            },
                        );
                        Ok(ApiResponse::created(json!({"upload_id": id})))
                    }
                })),
            ),
        );

        let sessions = self.sessions.clone();
        let store = self.store.clone();
        endpoints.register(
            "upload",
            Endpoint::new(
                EndpointSpec::put("upload.chunk", "/uploads/{id}/chunks/{index}"),
                Arc::new(FnHandler(move |req: ApiRequest| {
                    let sessions = sessions.clone();
                    let store = store.clone();
                    async move {
                        let id = req
                            .path_param("/uploads/{id}/chunks/{index}", "id")
                            .ok_or_else(|| ServiceError::invalid_input("missing upload id"))?;
                        let index: u64 = req
                            .path_param("/uploads/{id}/chunks/{index}", "index")
                            .and_then(|s| s.parse().ok())
                            .ok_or_else(|| ServiceError::invalid_input("bad chunk index"))?;
                        // Chunk payloads ride the JSON transport as a string
                        // field.
                        let bytes = req
                            .body
                            .as_ref()
                            .and_then(|b| b.get("data"))
                            .and_then(|v| v.as_str())
                            .map(|s| s.as_bytes().to_vec())
                            .unwrap_or_default();
                        {
                            let mut session =
                                sessions.get_mut(&id).ok_or_else(|| ServiceError::NotFound {
                                    resource: format!("upload {id}"),
                                })?;
                            if session.state != SessionState::Receiving {
                                return Err(ServiceError::Conflict {
                                    message: "upload already completed".to_string(),
                                });
                            }
                            session.chunks += 1;
                            session.bytes += bytes.len() as u64;
                        }
                        store.put_chunk(&id, index, bytes).await?;
                        Ok(ApiResponse::ok(json!({"upload_id": id, "chunk": index})))
                    }
                })),
            ),
        );

        let sessions = self.sessions.clone();
        let store = self.store.clone();
        let bus = ctx.resources.bus.clone();
        endpoints.register(
            "upload",
            Endpoint::new(
                EndpointSpec::post("upload.complete", "/uploads/{id}/complete"),
                Arc::new(FnHandler(move |req: ApiRequest| {
                    let sessions = sessions.clone();
                    let store = store.clone();
                    let bus = bus.clone();
                    async move {
                        let id = req
                            .path_param("/uploads/{id}/complete", "id")
                            .ok_or_else(|| ServiceError::invalid_input("missing upload id"))?;
                        let bytes = store.seal(&id).await?;
                        let wallet = {
                            let mut session =
                                sessions.get_mut(&id).ok_or_else(|| ServiceError::NotFound {
                                    resource: format!("upload {id}"),
                                })?;
                            session.state = SessionState::Completed;
                            session.bytes = bytes;
                            session.wallet.clone()
                        };
                        // Fire-and-forget: the transcoder picks this up.
                        if let Err(e) = publish_json(
                            bus.as_ref(),
                            SUBJECT_UPLOAD_COMPLETED,
                            &json!({"upload_id": id, "bytes": bytes, "wallet": wallet}),
                        )
                        .await
                        {
                            tracing::warn!(upload = %id, error = %e, "upload.completed publish failed");
                        }
                        Ok(ApiResponse::ok(json!({"upload_id": id, "bytes": bytes})))
                    }
                })),
            ),
        );

        let sessions = self.sessions.clone();
        endpoints.register(
            "upload",
            Endpoint::new(
                EndpointSpec::get("upload.status", "/uploads/{id}"),
                Arc::new(FnHandler(move |req: ApiRequest| {
                    let sessions = sessions.clone();
                    async move {
                        let id = req
                            .path_param("/uploads/{id}", "id")
                            .ok_or_else(|| ServiceError::invalid_input("missing upload id"))?;
                        let session = sessions.get(&id).ok_or_else(|| ServiceError::NotFound {
                            resource: format!("upload {id}"),
                        })?;
                        Ok(ApiResponse::ok(json!({
                            "upload_id": id,
                            "filename": session.filename,
                            "state": session.state,
                            "chunks": session.chunks,
                            "bytes": session.bytes,
                        })))
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
            PluginHealth::not_ready("upload not started")
        }
    }
}
