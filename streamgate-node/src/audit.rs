//! # Audit Log
//!
//! Append-only record of every inbound request: actor, action, resource,
//! result, detail. Recording never blocks the request path: records land in
//! a bounded buffer and a sink task writes them out. When the buffer is
//! full the oldest record is dropped and counted (or, with `drop_on_full`
//! disabled, the newest).
//!
//! Sinks are pluggable: stdout JSON lines, an append-only file, or an
//! external collector reached over HTTP.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use streamgate_fabric::queue::BoundedQueue;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{AuditConfig, AuditSinkConfig};

/// Enumerated outcome of a request. Every audit record carries exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditResult {
    Success,
    Denied,
    Error,
    RateLimited,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Client identity as resolved by the pipeline (IP, API key, wallet).
    pub actor: String,
    /// What was attempted, e.g. `"upload.create"`.
    pub action: String,
    /// What it was attempted on, e.g. the request path.
    pub resource: String,
    pub result: AuditResult,
    #[serde(default)]
    pub detail: HashMap<String, String>,
}

impl AuditRecord {
    pub fn new(
        actor: impl Into<String>,
        action: impl Into<String>,
        resource: impl Into<String>,
        result: AuditResult,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            actor: actor.into(),
            action: action.into(),
            resource: resource.into(),
            result,
            detail: HashMap::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.detail.insert(key.into(), value.into());
        self
    }
}

/// Where records end up. Write failures are the sink's problem to report;
/// the request path never sees them.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    async fn write(&self, records: &[AuditRecord]) -> std::io::Result<()>;
}

pub struct AuditLog {
    queue: BoundedQueue<AuditRecord>,
    capacity: usize,
    drop_on_full: bool,
    recorded: AtomicU64,
    /// Drops taken on the record path in drop-newest mode; overflow drops in
    /// drop-oldest mode are counted by the queue itself.
    extra_drops: AtomicU64,
}

impl AuditLog {
    /// Build the log and spawn its sink task. The task drains the buffer
    /// until `cancel` fires, then flushes what remains.
    pub fn new(config: &AuditConfig, cancel: CancellationToken) -> Arc<Self> {
        let sink = build_sink(&config.sink);
        Self::with_sink(config, sink, cancel)
    }

    pub fn with_sink(
        config: &AuditConfig,
        sink: Arc<dyn AuditSink>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let log = Arc::new(Self {
            queue: BoundedQueue::new(config.buffer_size),
            capacity: config.buffer_size,
            drop_on_full: config.drop_on_full,
            recorded: AtomicU64::new(0),
            extra_drops: AtomicU64::new(0),
        });
        let queue = log.queue.clone();
        tokio::spawn(async move {
            loop {
                let record = tokio::select! {
                    _ = cancel.cancelled() => break,
                    record = queue.recv() => match record {
                        Some(record) => record,
                        None => return,
                    },
                };
                write_batch(&*sink, vec![record]).await;
            }
            // Shutdown flush.
            let remaining = queue.drain();
            if !remaining.is_empty() {
                write_batch(&*sink, remaining).await;
            }
        });
        log
    }

    /// Append a record. Never blocks and never fails from the caller's view.
    pub fn record(&self, record: AuditRecord) {
        self.recorded.fetch_add(1, Ordering::Relaxed);
        if !self.drop_on_full && self.queue.len() >= self.capacity {
            // Drop-newest mode: count the loss and keep the buffer as is.
            self.extra_drops.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.queue.push(record);
    }

    /// Records accepted since startup (including ones later dropped).
    pub fn recorded(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }

    /// Records lost to buffer overflow.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped() + self.extra_drops.load(Ordering::Relaxed)
    }
}

async fn write_batch(sink: &dyn AuditSink, records: Vec<AuditRecord>) {
    if let Err(e) = sink.write(&records).await {
        tracing::warn!(error = %e, count = records.len(), "audit sink write failed");
    }
}

fn build_sink(config: &AuditSinkConfig) -> Arc<dyn AuditSink> {
    match config {
        AuditSinkConfig::Stdout => Arc::new(StdoutSink),
        AuditSinkConfig::File(path) => Arc::new(FileSink { path: path.clone() }),
        AuditSinkConfig::External(url) => Arc::new(ExternalSink {
            url: url.clone(),
            client: reqwest::Client::new(),
        }),
    }
}

/// JSON lines on stdout.
pub struct StdoutSink;

#[async_trait::async_trait]
impl AuditSink for StdoutSink {
    async fn write(&self, records: &[AuditRecord]) -> std::io::Result<()> {
        use tokio::io::AsyncWriteExt;
        let mut out = tokio::io::stdout();
        for record in records {
            let line = serde_json::to_vec(record)?;
            out.write_all(&line).await?;
            out.write_all(b"\n").await?;
        }
        out.flush().await
    }
}

/// Append-only JSON lines file.
pub struct FileSink {
    path: String,
}

#[async_trait::async_trait]
impl AuditSink for FileSink {
    async fn write(&self, records: &[AuditRecord]) -> std::io::Result<()> {
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        for record in records {
            let line = serde_json::to_vec(record)?;
            file.write_all(&line).await?;
            file.write_all(b"\n").await?;
        }
        file.flush().await
    }
}

/// POSTs batches to an external collector.
pub struct ExternalSink {
    url: String,
    client: reqwest::Client,
}

#[async_trait::async_trait]
impl AuditSink for ExternalSink {
    async fn write(&self, records: &[AuditRecord]) -> std::io::Result<()> {
        self.client
            .post(&self.url)
            .json(records)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(std::io::Error::other)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    struct CapturingSink {
        records: Mutex<Vec<AuditRecord>>,
    }

    #[async_trait::async_trait]
    impl AuditSink for CapturingSink {
        async fn write(&self, records: &[AuditRecord]) -> std::io::Result<()> {
            self.records.lock().unwrap().extend_from_slice(records);
            Ok(())
        }
    }

    fn config(buffer: usize) -> AuditConfig {
        AuditConfig {
            buffer_size: buffer,
            sink: AuditSinkConfig::Stdout,
            drop_on_full: true,
        }
    }

    #[tokio::test]
    async fn records_reach_the_sink() {
        let sink = Arc::new(CapturingSink {
            records: Mutex::new(Vec::new()),
        });
        let log = AuditLog::with_sink(&config(16), sink.clone(), CancellationToken::new());

        log.record(AuditRecord::new(
            "1.2.3.4",
            "upload.create",
            "/api/v1/uploads",
            AuditResult::Success,
        ));
        tokio::time::timeout(Duration::from_secs(1), async {
            while sink.records.lock().unwrap().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("sink received the record");

        let written = sink.records.lock().unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].result, AuditResult::Success);
    }

    #[tokio::test]
    async fn every_result_value_serializes_to_enumerated_form() {
        for (result, expected) in [
            (AuditResult::Success, "success"),
            (AuditResult::Denied, "denied"),
            (AuditResult::Error, "error"),
            (AuditResult::RateLimited, "rate-limited"),
        ] {
            let json = serde_json::to_value(result).unwrap();
            assert_eq!(json, expected);
        }
    }

    #[tokio::test]
    async fn overflow_drops_and_counts_without_blocking() {
        // A sink that never completes keeps everything buffered.
        struct StuckSink;
        #[async_trait::async_trait]
        impl AuditSink for StuckSink {
            async fn write(&self, _records: &[AuditRecord]) -> std::io::Result<()> {
                futures::future::pending::<()>().await;
                Ok(())
            }
        }

        let log = AuditLog::with_sink(&config(4), Arc::new(StuckSink), CancellationToken::new());
        for i in 0..20 {
            log.record(AuditRecord::new(
                "actor",
                format!("action.{i}"),
                "/r",
                AuditResult::Success,
            ));
        }
        assert_eq!(log.recorded(), 20);
        assert!(log.dropped() > 0);
    }
}
