//! # Event Bus
//!
//! Fire-and-forget pub/sub over dot-separated subjects. Two interchangeable
//! implementations satisfy the [`EventBus`] contract:
//!
//! - [`in_proc::InProcBus`] for the monolith: delivery through per-subscriber
//!   bounded queues, FIFO per subscriber, no cross-subscriber ordering.
//! - [`broker::BrokerBus`] for microservices: NATS-backed, asynchronous
//!   publish, automatic reconnect with exponential backoff and resubscribe.
//!
//! Payloads are opaque bytes to the core. Delivery is at-most-once from the
//! core's perspective; a broker may upgrade that on its own.

pub mod broker;
pub mod in_proc;

use crate::error::{FabricError, Result};
use crate::queue::BoundedQueue;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A published event as seen by subscribers.
#[derive(Debug, Clone)]
pub struct Event {
    /// Dot-separated subject the event was published on.
    pub subject: String,
    /// Opaque payload bytes, typically a serialized message.
    pub payload: Vec<u8>,
    /// Publish timestamp, monotonic per publisher.
    pub published_at: DateTime<Utc>,
    /// Monotonic sequence number assigned by the publishing bus handle.
    pub seq: u64,
    /// Identity of the publishing process or plugin.
    pub publisher: String,
}

impl Event {
    /// Deserialize the payload as JSON into `T`.
    pub fn payload_json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| FabricError::Bus(format!("payload decode failed on {}: {e}", self.subject)))
    }
}

/// Pub/sub contract shared by the in-process and broker variants.
#[async_trait::async_trait]
pub trait EventBus: Send + Sync {
    /// Publish `payload` on `subject`. Errors are returned, never retried
    /// here; the caller decides whether a lost event matters.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()>;

    /// Subscribe to a subject pattern. Exact segments and `*` single-level
    /// wildcards are supported (`upload.*` matches `upload.completed` but not
    /// `upload.chunk.stored`).
    async fn subscribe(&self, pattern: &str) -> Result<Subscription>;

    /// Events published through this handle so far.
    fn published(&self) -> u64;

    /// Publish failures observed so far.
    fn publish_errors(&self) -> u64;
}

/// Convenience: serialize `payload` as JSON and publish it.
pub async fn publish_json<T: serde::Serialize>(
    bus: &dyn EventBus,
    subject: &str,
    payload: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec(payload)
        .map_err(|e| FabricError::Bus(format!("payload encode failed for {subject}: {e}")))?;
    bus.publish(subject, bytes).await
}

/// A live subscription. Dropping it (or cancelling its token) releases the
/// underlying registration; for the broker variant the NATS subscription is
/// torn down by the pump task.
pub struct Subscription {
    pub(crate) pattern: String,
    pub(crate) queue: BoundedQueue<Event>,
    pub(crate) cancel: CancellationToken,
}

impl Subscription {
    /// Receive the next event, FIFO for this subscriber. Returns `None` when
    /// the subscription has been closed and drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.queue.recv().await
    }

    /// The pattern this subscription was created with.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Events discarded because this subscriber fell behind.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// Consume the subscription with `handler`, isolating handler panics: a
    /// panicking handler is logged and the subscription stays live. Returns
    /// when the subscription closes or `cancel` fires.
    pub async fn consume<F, Fut>(mut self, handler: F)
    where
        F: Fn(Event) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        use futures::FutureExt;
        let cancel = self.cancel.clone();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let subject = event.subject.clone();
            // Panic isolation per handler invocation; the subscription itself
            // is never torn down by a bad handler.
            if let Err(panic) = std::panic::AssertUnwindSafe(handler(event))
                .catch_unwind()
                .await
            {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic".to_string());
                tracing::error!(subject = %subject, panic = %detail, "event handler panicked");
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Match a dot-separated subject against a pattern with `*` single-level
/// wildcards. Both sides are compared segment by segment; lengths must agree.
pub(crate) fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');
    loop {
        match (pat.next(), sub.next()) {
            (None, None) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            _ => return false,
        }
    }
}

/// Shared publish counters; each bus variant embeds one.
#[derive(Default)]
pub(crate) struct PublishStats {
    pub published: AtomicU64,
    pub errors: AtomicU64,
    pub seq: AtomicU64,
}

impl PublishStats {
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }
}

pub(crate) type SharedStats = Arc<PublishStats>;
