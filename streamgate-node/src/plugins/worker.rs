//! Worker plugin: a small in-process job queue with a single consumer
//! task. Jobs are opaque `{kind, payload}` pairs; execution is delegated to
//! a [`JobExecutor`] so deployments can plug in real work.

use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use super::PluginBase;
use crate::error::{Result, ServiceError};
use crate::kernel::plugin::{Plugin, PluginContext, PluginDescriptor, PluginHealth};
use crate::pipeline::validate::{FieldKind, FieldRule};
use crate::pipeline::{ApiRequest, ApiResponse, Endpoint, EndpointSpec, FnHandler};
use streamgate_fabric::queue::BoundedQueue;

const JOB_QUEUE_CAPACITY: usize = 4096;

#[derive(Debug, Clone, serde::Serialize)]
pub struct Job {
    pub id: String,
    pub kind: String,
    pub payload: Value,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

/// Executes one job. The default executor completes everything.
#[async_trait::async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &Job) -> Result<()>;
}

pub struct NoopExecutor;

#[async_trait::async_trait]
impl JobExecutor for NoopExecutor {
    async fn execute(&self, _job: &Job) -> Result<()> {
        Ok(())
    }
}

pub struct WorkerPlugin {
    base: PluginBase,
    executor: Arc<dyn JobExecutor>,
    queue: BoundedQueue<String>,
    jobs: Arc<DashMap<String, Job>>,
}

impl WorkerPlugin {
    pub fn with_executor(executor: Arc<dyn JobExecutor>) -> Self {
        Self {
            base: PluginBase::new("worker"),
            executor,
            queue: BoundedQueue::new(JOB_QUEUE_CAPACITY),
            jobs: Arc::new(DashMap::new()),
        }
    }

    pub fn new() -> Self {
        Self::with_executor(Arc::new(NoopExecutor))
    }

    pub fn base(&self) -> &PluginBase {
        &self.base
    }
}

impl Default for WorkerPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Plugin for WorkerPlugin {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor::new("worker")
            .with_endpoints(&[("POST", "/jobs"), ("GET", "/jobs/{id}")])
            .with_dependencies(self.base.dependencies())
    }

    async fn init(&self, ctx: PluginContext) -> Result<()> {
        self.base.store_ctx(ctx).await;
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let ctx = self.base.ctx().await?;

        let jobs = self.jobs.clone();
        let queue = self.queue.clone();
        ctx.resources.endpoints.register(
            "worker",
            Endpoint::new(
                EndpointSpec::post("worker.job.submit", "/jobs").rules(vec![
                    FieldRule::required_body("kind", FieldKind::Str { min: 1, max: 128 }),
                ]),
                Arc::new(FnHandler(move |req: ApiRequest| {
                    let jobs = jobs.clone();
                    let queue = queue.clone();
                    async move {
                        let kind = req
                            .body
                            .as_ref()
                            .and_then(|b| b.get("kind"))
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string();
                        let payload = req
                            .body
                            .as_ref()
                            .and_then(|b| b.get("payload"))
                            .cloned()
                            .unwrap_or(Value::Null);
                        let job = Job {
                            id: Uuid::new_v4().to_string(),
                            kind,
                            payload,
                            status: JobStatus::Queued,
                        };
                        jobs.insert(job.id.clone(), job.clone());
                        queue.push(job.id.clone());
                        Ok(ApiResponse::created(json!({"job_id": job.id})))
                    }
                })),
            ),
        );

        let jobs = self.jobs.clone();
        ctx.resources.endpoints.register(
            "worker",
            Endpoint::new(
                EndpointSpec::get("worker.job.get", "/jobs/{id}"),
                Arc::new(FnHandler(move |req: ApiRequest| {
                    let jobs = jobs.clone();
                    async move {
                        let id = req
                            .path_param("/jobs/{id}", "id")
                            .ok_or_else(|| ServiceError::invalid_input("missing job id"))?;
                        let job = jobs.get(&id).ok_or_else(|| ServiceError::NotFound {
                            resource: format!("job {id}"),
                        })?;
                        Ok(ApiResponse::ok(json!(job.value().clone())))
                    }
                })),
            ),
        );

        // Single consumer task; one job in flight at a time.
        let jobs = self.jobs.clone();
        let queue = self.queue.clone();
        let executor = self.executor.clone();
        let cancel = ctx.shutdown.child_token();
        tokio::spawn(async move {
            loop {
                let job_id = tokio::select! {
                    _ = cancel.cancelled() => break,
                    id = queue.recv() => match id {
                        Some(id) => id,
                        None => break,
                    },
                };
                let Some(mut entry) = jobs.get_mut(&job_id) else {
                    continue;
                };
                entry.status = JobStatus::Running;
                let job = entry.clone();
                drop(entry);

                let status = match executor.execute(&job).await {
                    Ok(()) => JobStatus::Done,
                    Err(e) => {
                        tracing::warn!(job = %job.id, kind = %job.kind, error = %e, "job failed");
                        JobStatus::Failed
                    }
                };
                if let Some(mut entry) = jobs.get_mut(&job_id) {
                    entry.status = status;
                }
            }
        });

        self.base.join_fabric().await
    }

    async fn stop(&self) -> Result<()> {
        self.base.leave_fabric().await
    }

    async fn health(&self) -> PluginHealth {
        if self.base.is_ready() {
            PluginHealth::ready()
        } else {
            PluginHealth::not_ready("worker not started")
        }
    }
}
