//! In-process event bus for monolith deployments.
//!
//! Subscribers hold per-subscriber bounded queues; publishing copies the
//! event into every matching queue and never blocks on a slow consumer.
//! Overflow drops the subscriber's oldest event and counts it. Ordering is
//! FIFO per (subject, subscriber); nothing is guaranteed across subscribers.

use super::{subject_matches, Event, EventBus, PublishStats, SharedStats, Subscription};
use crate::error::Result;
use crate::queue::BoundedQueue;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const DEFAULT_SUBSCRIBER_QUEUE: usize = 1024;

struct SubEntry {
    pattern: String,
    queue: BoundedQueue<Event>,
    cancel: CancellationToken,
}

/// Monolith-mode bus: a subscriber table in shared memory.
pub struct InProcBus {
    publisher: String,
    queue_capacity: usize,
    subscribers: DashMap<Uuid, SubEntry>,
    stats: SharedStats,
}

impl InProcBus {
    pub fn new(publisher: impl Into<String>) -> Self {
        Self::with_queue_capacity(publisher, DEFAULT_SUBSCRIBER_QUEUE)
    }

    pub fn with_queue_capacity(publisher: impl Into<String>, queue_capacity: usize) -> Self {
        Self {
            publisher: publisher.into(),
            queue_capacity: queue_capacity.max(1),
            subscribers: DashMap::new(),
            stats: Arc::new(PublishStats::default()),
        }
    }

    /// Events discarded across all subscribers because their queues were full.
    pub fn dropped(&self) -> u64 {
        self.subscribers.iter().map(|e| e.queue.dropped()).sum()
    }

    fn sweep_cancelled(&self) {
        self.subscribers.retain(|_, entry| {
            if entry.cancel.is_cancelled() {
                entry.queue.close();
                false
            } else {
                true
            }
        });
    }
}

#[async_trait::async_trait]
impl EventBus for InProcBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        self.sweep_cancelled();
        let event = Event {
            subject: subject.to_string(),
            payload,
            published_at: Utc::now(),
            seq: self.stats.next_seq(),
            publisher: self.publisher.clone(),
        };
        for entry in self.subscribers.iter() {
            if subject_matches(&entry.pattern, subject) {
                entry.queue.push(event.clone());
            }
        }
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription> {
        let queue = BoundedQueue::new(self.queue_capacity);
        let cancel = CancellationToken::new();
        self.subscribers.insert(
            Uuid::new_v4(),
            SubEntry {
                pattern: pattern.to_string(),
                queue: queue.clone(),
                cancel: cancel.clone(),
            },
        );
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
    use crate::bus::publish_json;

    #[tokio::test]
    async fn delivers_in_publish_order_per_subscriber() {
        let bus = InProcBus::new("test");
        let mut sub = bus.subscribe("jobs.created").await.unwrap();
        for i in 0..10u32 {
            bus.publish("jobs.created", i.to_be_bytes().to_vec())
                .await
                .unwrap();
        }
        for i in 0..10u32 {
            let event = sub.recv().await.unwrap();
            assert_eq!(event.payload, i.to_be_bytes().to_vec());
        }
    }

    #[tokio::test]
    async fn wildcard_subscription_sees_matching_subjects_only() {
        let bus = InProcBus::new("test");
        let mut sub = bus.subscribe("upload.*").await.unwrap();
        bus.publish("upload.completed", b"a".to_vec()).await.unwrap();
        bus.publish("transcode.completed", b"b".to_vec())
            .await
            .unwrap();
        bus.publish("upload.failed", b"c".to_vec()).await.unwrap();

        assert_eq!(sub.recv().await.unwrap().subject, "upload.completed");
        assert_eq!(sub.recv().await.unwrap().subject, "upload.failed");
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest() {
        let bus = InProcBus::with_queue_capacity("test", 2);
        let mut sub = bus.subscribe("a.b").await.unwrap();
        for i in 0..4u8 {
            bus.publish("a.b", vec![i]).await.unwrap();
        }
        assert_eq!(sub.dropped(), 2);
        assert_eq!(sub.recv().await.unwrap().payload, vec![2]);
        assert_eq!(sub.recv().await.unwrap().payload, vec![3]);
    }

    #[tokio::test]
    async fn dropped_subscription_stops_receiving() {
        let bus = InProcBus::new("test");
        let sub = bus.subscribe("x.y").await.unwrap();
        drop(sub);
        bus.publish("x.y", b"gone".to_vec()).await.unwrap();
        assert_eq!(bus.subscribers.len(), 0);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_unsubscribe() {
        let bus = Arc::new(InProcBus::new("test"));
        let sub = bus.subscribe("p.q").await.unwrap();

        let seen = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let seen2 = seen.clone();
        let consumer = tokio::spawn(sub.consume(move |event| {
            let seen = seen2.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                if event.payload == b"boom" {
                    panic!("handler exploded");
                }
            }
        }));

        bus.publish("p.q", b"boom".to_vec()).await.unwrap();
        bus.publish("p.q", b"fine".to_vec()).await.unwrap();

        // Both events must reach the handler despite the first panicking.
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while seen.load(Ordering::SeqCst) < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("handler kept consuming after panic");
        consumer.abort();
    }

    #[tokio::test]
    async fn json_payload_round_trip() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Job {
            id: u32,
        }
        let bus = InProcBus::new("test");
        let mut sub = bus.subscribe("jobs.*").await.unwrap();
        publish_json(&bus, "jobs.created", &Job { id: 42 }).await.unwrap();
        let event = sub.recv().await.unwrap();
        assert_eq!(event.payload_json::<Job>().unwrap(), Job { id: 42 });
    }
}
