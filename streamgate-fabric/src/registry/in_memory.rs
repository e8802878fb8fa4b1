//! Local registry backend for monolith deployments.
//!
//! A shared table keyed by (service, instance). Heartbeats refresh a
//! timestamp; a sweep task removes records whose heartbeat lapsed beyond the
//! staleness window and notifies watchers with `Left` events.

use super::{Discovery, RegistryConfig, ServiceRecord, ServiceRegistry, Watch, WatchEvent};
use crate::error::Result;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const WATCH_CHANNEL_CAPACITY: usize = 64;

struct Held {
    record: ServiceRecord,
    last_health: Instant,
}

struct Watcher {
    service: String,
    tx: mpsc::Sender<WatchEvent>,
}

pub struct InMemoryRegistry {
    config: RegistryConfig,
    records: DashMap<(String, String), Held>,
    watchers: DashMap<Uuid, Watcher>,
}

impl InMemoryRegistry {
    /// Create the registry and spawn its staleness sweeper. The sweeper stops
    /// when `cancel` fires.
    pub fn new(config: RegistryConfig, cancel: CancellationToken) -> std::sync::Arc<Self> {
        let registry = std::sync::Arc::new(Self {
            config,
            records: DashMap::new(),
            watchers: DashMap::new(),
        });
        let sweeper = registry.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweeper.config.staleness / 2);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => sweeper.sweep_stale(),
                }
            }
        });
        registry
    }

    fn sweep_stale(&self) {
        let staleness = self.config.staleness;
        let mut lapsed = Vec::new();
        self.records.retain(|key, held| {
            if held.last_health.elapsed() > staleness {
                lapsed.push(key.clone());
                false
            } else {
                true
            }
        });
        for (service, instance_id) in lapsed {
            tracing::warn!(service = %service, instance = %instance_id, "record lapsed past staleness window");
            self.notify(WatchEvent::Left {
                service,
                instance_id,
            });
        }
    }

    fn notify(&self, event: WatchEvent) {
        let service = match &event {
            WatchEvent::Joined(record) => record.service.clone(),
            WatchEvent::Left { service, .. } => service.clone(),
            WatchEvent::Snapshot(_) => return,
        };
        // A watcher whose channel is full or closed has lost the stream; it
        // is removed and must re-list to reconcile.
        self.watchers.retain(|_, watcher| {
            if watcher.service != service {
                return true;
            }
            watcher.tx.try_send(event.clone()).is_ok()
        });
    }

    fn fresh_records(&self, service: &str) -> Vec<ServiceRecord> {
        let staleness = self.config.staleness;
        self.records
            .iter()
            .filter(|entry| {
                entry.key().0 == service && entry.value().last_health.elapsed() <= staleness
            })
            .map(|entry| entry.value().record.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl ServiceRegistry for InMemoryRegistry {
    async fn register(&self, record: ServiceRecord) -> Result<()> {
        let key = record.key();
        let is_update = self.records.contains_key(&key);
        self.records.insert(
            key,
            Held {
                record: record.clone(),
                last_health: Instant::now(),
            },
        );
        if !is_update {
            tracing::info!(service = %record.service, instance = %record.instance_id, "service registered");
        }
        self.notify(WatchEvent::Joined(record));
        Ok(())
    }

    async fn deregister(&self, service: &str, instance_id: &str) -> Result<()> {
        let removed = self
            .records
            .remove(&(service.to_string(), instance_id.to_string()));
        if removed.is_some() {
            tracing::info!(service, instance = instance_id, "service deregistered");
            self.notify(WatchEvent::Left {
                service: service.to_string(),
                instance_id: instance_id.to_string(),
            });
        }
        Ok(())
    }

    async fn heartbeat(&self, service: &str, instance_id: &str) -> Result<()> {
        if let Some(mut held) = self
            .records
            .get_mut(&(service.to_string(), instance_id.to_string()))
        {
            held.last_health = Instant::now();
        }
        Ok(())
    }

    async fn discover(&self, service: &str) -> Result<Discovery> {
        Ok(Discovery {
            records: self.fresh_records(service),
            stale: false,
        })
    }

    async fn watch(&self, service: &str) -> Result<Watch> {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let snapshot = WatchEvent::Snapshot(self.fresh_records(service));
        // The snapshot always fits a fresh channel.
        let _ = tx.try_send(snapshot);
        self.watchers.insert(
            Uuid::new_v4(),
            Watcher {
                service: service.to_string(),
                tx,
            },
        );
        Ok(Watch { rx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(service: &str, id: &str, port: u16) -> ServiceRecord {
        ServiceRecord {
            service: service.to_string(),
            instance_id: id.to_string(),
            address: "127.0.0.1".to_string(),
            port,
            tags: vec![],
            health_url: format!("http://127.0.0.1:{port}/health/live"),
            metadata: Default::default(),
        }
    }

    fn registry(staleness: Duration) -> std::sync::Arc<InMemoryRegistry> {
        InMemoryRegistry::new(
            RegistryConfig {
                staleness,
                heartbeat_interval: staleness / 3,
            },
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn register_then_deregister_leaves_discover_empty() {
        let reg = registry(Duration::from_secs(30));
        reg.register(record("upload", "u1", 9001)).await.unwrap();
        assert_eq!(reg.discover("upload").await.unwrap().records.len(), 1);

        reg.deregister("upload", "u1").await.unwrap();
        assert!(reg.discover("upload").await.unwrap().records.is_empty());
    }

    #[tokio::test]
    async fn reregistration_updates_without_absence() {
        let reg = registry(Duration::from_secs(30));
        reg.register(record("upload", "u1", 9001)).await.unwrap();
        reg.register(record("upload", "u1", 9002)).await.unwrap();

        let found = reg.discover("upload").await.unwrap().records;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].port, 9002);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_records_are_not_discoverable() {
        let reg = registry(Duration::from_secs(5));
        reg.register(record("upload", "u1", 9001)).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(reg.discover("upload").await.unwrap().records.is_empty());
    }

    #[tokio::test]
    async fn heartbeat_keeps_record_fresh() {
        let reg = registry(Duration::from_millis(50));
        reg.register(record("meta", "m1", 9100)).await.unwrap();
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            reg.heartbeat("meta", "m1").await.unwrap();
        }
        assert_eq!(reg.discover("meta").await.unwrap().records.len(), 1);
    }

    #[tokio::test]
    async fn watch_delivers_snapshot_then_deltas() {
        let reg = registry(Duration::from_secs(30));
        reg.register(record("stream", "s1", 9200)).await.unwrap();

        let mut watch = reg.watch("stream").await.unwrap();
        match watch.recv().await.unwrap() {
            WatchEvent::Snapshot(records) => assert_eq!(records.len(), 1),
            other => panic!("expected snapshot, got {other:?}"),
        }

        reg.register(record("stream", "s2", 9201)).await.unwrap();
        match watch.recv().await.unwrap() {
            WatchEvent::Joined(r) => assert_eq!(r.instance_id, "s2"),
            other => panic!("expected join, got {other:?}"),
        }

        reg.deregister("stream", "s1").await.unwrap();
        match watch.recv().await.unwrap() {
            WatchEvent::Left { instance_id, .. } => assert_eq!(instance_id, "s1"),
            other => panic!("expected leave, got {other:?}"),
        }
    }
}
