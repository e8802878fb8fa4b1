//! Transcoder plugin: tracks transcode jobs and hands the codec work to an
//! external backend behind [`TranscodeBackend`]. Jobs are created from
//! `upload.completed` events; completions publish `transcode.completed`.

use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use super::PluginBase;
use crate::error::{Result, ServiceError};
use crate::kernel::plugin::{Plugin, PluginContext, PluginDescriptor, PluginHealth};
use crate::pipeline::{ApiRequest, ApiResponse, Endpoint, EndpointSpec, FnHandler};
use streamgate_fabric::bus::publish_json;

pub const SUBJECT_TRANSCODE_COMPLETED: &str = "transcode.completed";

#[derive(Debug, Clone, serde::Serialize)]
pub struct TranscodeJob {
    pub id: String,
    pub upload_id: String,
    pub video_id: String,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

/// External collaborator that does the codec work. `submit` returns once
/// the job is accepted; completion is reported through the returned status.
#[async_trait::async_trait]
pub trait TranscodeBackend: Send + Sync {
    async fn submit(&self, job: &TranscodeJob) -> Result<JobStatus>;
}

/// Default backend: accepts every job and reports it complete. Deployments
/// wire the real transcoder here.
pub struct AcceptingBackend;

#[async_trait::async_trait]
impl TranscodeBackend for AcceptingBackend {
    async fn submit(&self, _job: &TranscodeJob) -> Result<JobStatus> {
        Ok(JobStatus::Completed)
    }
}

pub struct TranscoderPlugin {
    base: PluginBase,
    backend: Arc<dyn TranscodeBackend>,
    jobs: Arc<DashMap<String, TranscodeJob>>,
}

impl TranscoderPlugin {
    pub fn new(backend: Arc<dyn TranscodeBackend>) -> Self {
        Self {
            base: PluginBase::new("transcoder"),
            backend,
            jobs: Arc::new(DashMap::new()),
        }
    }

    pub fn with_default_backend() -> Self {
        Self::new(Arc::new(AcceptingBackend))
    }

    pub fn base(&self) -> &PluginBase {
        &self.base
    }
}

#[async_trait::async_trait]
impl Plugin for TranscoderPlugin {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor::new("transcoder")
            .with_endpoints(&[("GET", "/transcodes/{id}")])
            .subscribes(&["upload.completed"])
            .with_dependencies(self.base.dependencies())
    }

    async fn init(&self, ctx: PluginContext) -> Result<()> {
        self.base.store_ctx(ctx).await;
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let ctx = self.base.ctx().await?;

        let jobs = self.jobs.clone();
        ctx.resources.endpoints.register(
            "transcoder",
            Endpoint::new(
                EndpointSpec::get("transcoder.job.get", "/transcodes/{id}"),
                Arc::new(FnHandler(move |req: ApiRequest| {
                    let jobs = jobs.clone();
                    async move {
                        let id = req
                            .path_param("/transcodes/{id}", "id")
                            .ok_or_else(|| ServiceError::invalid_input("missing job id"))?;
                        let job = jobs.get(&id).ok_or_else(|| ServiceError::NotFound {
                            resource: format!("transcode job {id}"),
                        })?;
                        Ok(ApiResponse::ok(json!(job.value().clone())))
                    }
                })),
            ),
        );

        // Completed uploads become transcode jobs.
        let jobs = self.jobs.clone();
        let backend = self.backend.clone();
        let bus = ctx.resources.bus.clone();
        let subscription = ctx.resources.bus.subscribe("upload.completed").await?;
        tokio::spawn(subscription.consume(move |event| {
            let jobs = jobs.clone();
            let backend = backend.clone();
            let bus = bus.clone();
            async move {
                let Ok(payload) = event.payload_json::<Value>() else {
                    return;
                };
                let Some(upload_id) = payload.get("upload_id").and_then(|v| v.as_str()) else {
                    return;
                };
                let mut job = TranscodeJob {
                    id: Uuid::new_v4().to_string(),
                    upload_id: upload_id.to_string(),
                    video_id: upload_id.to_string(),
                    status: JobStatus::Queued,
                };
                jobs.insert(job.id.clone(), job.clone());

                match backend.submit(&job).await {
                    Ok(status) => {
                        job.status = status;
                        jobs.insert(job.id.clone(), job.clone());
                        if status == JobStatus::Completed {
                            let announce = json!({
                                "job_id": job.id,
                                "video_id": job.video_id,
                            });
                            if let Err(e) =
                                publish_json(bus.as_ref(), SUBJECT_TRANSCODE_COMPLETED, &announce)
                                    .await
                            {
                                tracing::warn!(job = %job.id, error = %e, "transcode.completed publish failed");
                            }
                        }
                    }
                    Err(e) => {
                        job.status = JobStatus::Failed;
                        jobs.insert(job.id.clone(), job.clone());
                        tracing::error!(job = %job.id, error = %e, "transcode submit failed");
                    }
                }
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
            PluginHealth::not_ready("transcoder not started")
        }
    }
}
