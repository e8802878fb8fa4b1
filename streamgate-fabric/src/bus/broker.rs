//! NATS-backed event bus for microservice deployments.
//!
//! Publish is asynchronous; subscriptions are durable for the process
//! lifetime. The initial connection retries with exponential backoff (base
//! 1s, cap 30s, jitter ±20%), and the client resubscribes every active
//! subject after a reconnect. Event metadata (publisher, sequence, publish
//! time) rides in message headers so payloads stay opaque.

use super::{Event, EventBus, PublishStats, SharedStats, Subscription};
use crate::error::{FabricError, Result};
use crate::queue::BoundedQueue;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const HEADER_PUBLISHER: &str = "sg-publisher";
const HEADER_SEQ: &str = "sg-seq";
const HEADER_PUBLISHED_AT: &str = "sg-published-at";

const DEFAULT_SUBSCRIBER_QUEUE: usize = 1024;

/// Reconnect backoff tuning for the broker connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// First retry delay.
    #[serde(with = "crate::duration_serde")]
    pub base: Duration,
    /// Delay ceiling.
    #[serde(with = "crate::duration_serde")]
    pub cap: Duration,
    /// Fractional jitter applied to each delay, e.g. `0.2` for ±20%.
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl ReconnectConfig {
    /// Delay before retry `attempt` (zero-based), jittered.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.as_secs_f64() * 2f64.powi(attempt.min(16) as i32);
        let capped = exp.min(self.cap.as_secs_f64());
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = if jitter == 0.0 {
            1.0
        } else {
            rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter)
        };
        Duration::from_secs_f64((capped * factor).max(0.0))
    }
}

/// Microservices-mode bus backed by a NATS connection.
pub struct BrokerBus {
    publisher: String,
    client: async_nats::Client,
    queue_capacity: usize,
    stats: SharedStats,
}

impl BrokerBus {
    /// Connect to `url`, retrying with backoff until the broker answers or
    /// `max_attempts` is exhausted. The underlying client keeps reconnecting
    /// (and resubscribing active subjects) for the life of the process.
    pub async fn connect(
        url: &str,
        publisher: impl Into<String>,
        reconnect: ReconnectConfig,
        max_attempts: u32,
    ) -> Result<Self> {
        let publisher = publisher.into();
        let mut attempt = 0u32;
        let client = loop {
            let options = async_nats::ConnectOptions::new()
                .name(publisher.clone())
                .retry_on_initial_connect();
            match options.connect(url).await {
                Ok(client) => {
                    if attempt > 0 {
                        tracing::info!(url, attempts = attempt + 1, "broker connection established");
                    } else {
                        tracing::info!(url, "broker connected");
                    }
                    break client;
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        return Err(FabricError::Bus(format!(
                            "broker unreachable at {url} after {attempt} attempts: {e}"
                        )));
                    }
                    let delay = reconnect.delay(attempt - 1);
                    tracing::warn!(url, attempt, ?delay, error = %e, "broker connect failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        };
        Ok(Self {
            publisher,
            client,
            queue_capacity: DEFAULT_SUBSCRIBER_QUEUE,
            stats: Arc::new(PublishStats::default()),
        })
    }

    fn headers(&self, seq: u64, published_at: DateTime<Utc>) -> async_nats::HeaderMap {
        let mut headers = async_nats::HeaderMap::new();
        headers.insert(HEADER_PUBLISHER, self.publisher.as_str());
        headers.insert(HEADER_SEQ, seq.to_string().as_str());
        headers.insert(HEADER_PUBLISHED_AT, published_at.to_rfc3339().as_str());
        headers
    }
}

fn event_from_message(message: async_nats::Message) -> Event {
    let header = |name: &str| -> Option<String> {
        message
            .headers
            .as_ref()
            .and_then(|h| h.get(name))
            .map(|v| v.as_str().to_string())
    };
    Event {
        subject: message.subject.to_string(),
        payload: message.payload.to_vec(),
        published_at: header(HEADER_PUBLISHED_AT)
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now),
        seq: header(HEADER_SEQ).and_then(|s| s.parse().ok()).unwrap_or(0),
        publisher: header(HEADER_PUBLISHER).unwrap_or_default(),
    }
}

#[async_trait::async_trait]
impl EventBus for BrokerBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        let seq = self.stats.next_seq();
        let headers = self.headers(seq, Utc::now());
        match self
            .client
            .publish_with_headers(subject.to_string(), headers, payload.into())
            .await
        {
            Ok(()) => {
                self.stats.published.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                Err(FabricError::Bus(format!("publish to {subject} failed: {e}")))
            }
        }
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription> {
        let mut nats_sub = self
            .client
            .subscribe(pattern.to_string())
            .await
            .map_err(|e| FabricError::Bus(format!("subscribe to {pattern} failed: {e}")))?;

        let queue = BoundedQueue::new(self.queue_capacity);
        let cancel = CancellationToken::new();

        // Pump broker messages into the subscriber's bounded queue so the
        // Subscription behaves identically to the in-process variant.
        let pump_queue = queue.clone();
        let pump_cancel = cancel.clone();
        let pump_pattern = pattern.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump_cancel.cancelled() => break,
                    message = nats_sub.next() => match message {
                        Some(message) => pump_queue.push(event_from_message(message)),
                        None => break,
                    },
                }
            }
            pump_queue.close();
            drop(nats_sub);
            tracing::debug!(pattern = %pump_pattern, "broker subscription closed");
        });

        Ok(Subscription {
            pattern: pattern.to_string(),
            queue,
            cancel,
        })
    }

    fn published(&self) -> u64 {
        self.stats.published.load(Ordering::Relaxed)
    }

    fn publish_errors(&self) -> u64 {
        self.stats.errors.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let cfg = ReconnectConfig {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter: 0.0,
        };
        assert_eq!(cfg.delay(0), Duration::from_secs(1));
        assert_eq!(cfg.delay(2), Duration::from_secs(4));
        assert_eq!(cfg.delay(10), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_band() {
        let cfg = ReconnectConfig {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(30),
            jitter: 0.2,
        };
        for _ in 0..100 {
            let d = cfg.delay(0).as_secs_f64();
            assert!((1.6..=2.4).contains(&d), "delay {d} outside jitter band");
        }
    }
}
