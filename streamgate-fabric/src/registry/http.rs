//! External registry backend for microservice deployments.
//!
//! Talks to a registry service over HTTP with the minimal capability
//! surface: put-with-health, delete, query-by-name-filter-by-health, and
//! long-poll watch-by-name. Outages are absorbed here so callers never see a
//! sleep-and-retry loop: failed calls retry with exponential backoff,
//! `discover` serves the last known healthy set flagged stale, and
//! registrations that cannot reach the backend queue until it returns.

use super::{Discovery, ServiceRecord, ServiceRegistry, Watch, WatchEvent};
use crate::bus::broker::ReconnectConfig;
use crate::error::{FabricError, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

const WATCH_CHANNEL_CAPACITY: usize = 64;
const LONG_POLL_WAIT: Duration = Duration::from_secs(30);
const CALL_ATTEMPTS: u32 = 3;

#[derive(Debug, Deserialize)]
struct WatchPage {
    index: u64,
    records: Vec<ServiceRecord>,
}

pub struct HttpRegistry {
    base_url: String,
    client: reqwest::Client,
    backoff: ReconnectConfig,
    /// Last successfully fetched healthy set per service.
    last_known: RwLock<HashMap<String, Vec<ServiceRecord>>>,
    /// Registrations waiting for the backend to come back.
    pending: Arc<Mutex<VecDeque<ServiceRecord>>>,
    cancel: CancellationToken,
}

impl HttpRegistry {
    pub fn new(base_url: impl Into<String>, backoff: ReconnectConfig, cancel: CancellationToken) -> Arc<Self> {
        let registry = Arc::new(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(LONG_POLL_WAIT + Duration::from_secs(10))
                .build()
                .expect("reqwest client construction is infallible with static options"),
            backoff,
            last_known: RwLock::new(HashMap::new()),
            pending: Arc::new(Mutex::new(VecDeque::new())),
            cancel,
        });
        registry.clone().spawn_pending_flusher();
        registry
    }

    fn record_url(&self, service: &str, instance_id: &str) -> String {
        format!("{}/v1/services/{service}/{instance_id}", self.base_url)
    }

    async fn call_with_retry<F, Fut, T>(&self, what: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, reqwest::Error>>,
    {
        let mut attempt = 0u32;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    if attempt >= CALL_ATTEMPTS {
                        return Err(FabricError::Registry(format!("{what} failed: {e}")));
                    }
                    let delay = self.backoff.delay(attempt - 1);
                    tracing::warn!(what, attempt, ?delay, error = %e, "registry call failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Background task that drains queued registrations once the backend
    /// answers again.
    fn spawn_pending_flusher(self: Arc<Self>) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                let delay = self.backoff.delay(attempt);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                let next = { self.pending.lock().await.pop_front() };
                let Some(record) = next else {
                    attempt = 0;
                    continue;
                };
                match self.put_record(&record).await {
                    Ok(()) => {
                        attempt = 0;
                        tracing::info!(service = %record.service, instance = %record.instance_id, "queued registration flushed");
                    }
                    Err(_) => {
                        attempt = (attempt + 1).min(16);
                        self.pending.lock().await.push_front(record);
                    }
                }
            }
        });
    }

    async fn put_record(&self, record: &ServiceRecord) -> Result<()> {
        let url = self.record_url(&record.service, &record.instance_id);
        let response = self
            .client
            .put(&url)
            .json(record)
            .send()
            .await
            .map_err(|e| FabricError::Registry(format!("put {url} failed: {e}")))?;
        if !response.status().is_success() {
            return Err(FabricError::Registry(format!(
                "put {url} returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn fetch_healthy(&self, service: &str) -> Result<Vec<ServiceRecord>> {
        let url = format!("{}/v1/services/{service}?healthy=true", self.base_url);
        let client = self.client.clone();
        let records: Vec<ServiceRecord> = self
            .call_with_retry("discover", || {
                let client = client.clone();
                let url = url.clone();
                async move {
                    client
                        .get(&url)
                        .send()
                        .await?
                        .error_for_status()?
                        .json()
                        .await
                }
            })
            .await?;
        self.last_known
            .write()
            .await
            .insert(service.to_string(), records.clone());
        Ok(records)
    }
}

#[async_trait::async_trait]
impl ServiceRegistry for HttpRegistry {
    async fn register(&self, record: ServiceRecord) -> Result<()> {
        match self.put_record(&record).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(service = %record.service, instance = %record.instance_id, error = %e,
                    "registry unreachable, queueing registration");
                self.pending.lock().await.push_back(record);
                Ok(())
            }
        }
    }

    async fn deregister(&self, service: &str, instance_id: &str) -> Result<()> {
        let url = self.record_url(service, instance_id);
        // Also drop any queued registration for the same instance so a late
        // flush cannot resurrect a deregistered record.
        self.pending
            .lock()
            .await
            .retain(|r| !(r.service == service && r.instance_id == instance_id));
        let client = self.client.clone();
        self.call_with_retry("deregister", || {
            let client = client.clone();
            let url = url.clone();
            async move { client.delete(&url).send().await?.error_for_status() }
        })
        .await?;
        Ok(())
    }

    async fn heartbeat(&self, service: &str, instance_id: &str) -> Result<()> {
        let url = format!("{}/heartbeat", self.record_url(service, instance_id));
        let client = self.client.clone();
        self.call_with_retry("heartbeat", || {
            let client = client.clone();
            let url = url.clone();
            async move { client.put(&url).send().await?.error_for_status() }
        })
        .await?;
        Ok(())
    }

    async fn discover(&self, service: &str) -> Result<Discovery> {
        match self.fetch_healthy(service).await {
            Ok(records) => Ok(Discovery {
                records,
                stale: false,
            }),
            Err(e) => {
                let cached = self.last_known.read().await.get(service).cloned();
                match cached {
                    Some(records) => {
                        tracing::warn!(service, error = %e, "registry unreachable, serving stale set");
                        Ok(Discovery {
                            records,
                            stale: true,
                        })
                    }
                    None => Err(e),
                }
            }
        }
    }

    async fn watch(&self, service: &str) -> Result<Watch> {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);

        let initial = self.fetch_healthy(service).await.unwrap_or_default();
        let _ = tx.try_send(WatchEvent::Snapshot(initial.clone()));

        let client = self.client.clone();
        let backoff = self.backoff.clone();
        let cancel = self.cancel.clone();
        let watch_url = format!("{}/v1/services/{service}/watch", self.base_url);
        let service = service.to_string();

        // Long-poll loop: each page carries an index cursor and the full
        // healthy set; deltas are computed locally. When the consumer goes
        // away or the backend misbehaves persistently, the channel closes and
        // the consumer re-lists.
        tokio::spawn(async move {
            let mut known: HashMap<String, ServiceRecord> = initial
                .into_iter()
                .map(|r| (r.instance_id.clone(), r))
                .collect();
            let mut index = 0u64;
            let mut attempt = 0u32;
            loop {
                if cancel.is_cancelled() || tx.is_closed() {
                    break;
                }
                let page = client
                    .get(&watch_url)
                    .query(&[
                        ("index", index.to_string()),
                        ("wait", format!("{}s", LONG_POLL_WAIT.as_secs())),
                    ])
                    .send()
                    .await
                    .and_then(|r| r.error_for_status());
                let page: WatchPage = match page {
                    Ok(response) => match response.json().await {
                        Ok(page) => page,
                        Err(e) => {
                            tracing::warn!(service = %service, error = %e, "watch page decode failed");
                            attempt += 1;
                            tokio::time::sleep(backoff.delay(attempt.min(16))).await;
                            continue;
                        }
                    },
                    Err(e) => {
                        tracing::warn!(service = %service, error = %e, "watch poll failed");
                        attempt += 1;
                        tokio::time::sleep(backoff.delay(attempt.min(16))).await;
                        continue;
                    }
                };
                attempt = 0;
                index = page.index;

                let fresh: HashMap<String, ServiceRecord> = page
                    .records
                    .into_iter()
                    .map(|r| (r.instance_id.clone(), r))
                    .collect();
                let fresh_ids: HashSet<&String> = fresh.keys().collect();

                let mut lost_consumer = false;
                for (id, record) in &fresh {
                    if known.get(id) != Some(record)
                        && tx.send(WatchEvent::Joined(record.clone())).await.is_err()
                    {
                        lost_consumer = true;
                        break;
                    }
                }
                if !lost_consumer {
                    for id in known.keys() {
                        if !fresh_ids.contains(id)
                            && tx
                                .send(WatchEvent::Left {
                                    service: service.clone(),
                                    instance_id: id.clone(),
                                })
                                .await
                                .is_err()
                        {
                            lost_consumer = true;
                            break;
                        }
                    }
                }
                if lost_consumer {
                    break;
                }
                known = fresh;
            }
        });

        Ok(Watch { rx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record(service: &str, id: &str) -> ServiceRecord {
        ServiceRecord {
            service: service.to_string(),
            instance_id: id.to_string(),
            address: "10.0.0.1".to_string(),
            port: 8080,
            tags: vec![],
            health_url: "http://10.0.0.1:8080/health/live".to_string(),
            metadata: Default::default(),
        }
    }

    fn fast_backoff() -> ReconnectConfig {
        ReconnectConfig {
            base: Duration::from_millis(5),
            cap: Duration::from_millis(20),
            jitter: 0.0,
        }
    }

    #[tokio::test]
    async fn register_puts_record_with_health() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/services/upload/u1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let reg = HttpRegistry::new(server.uri(), fast_backoff(), CancellationToken::new());
        reg.register(record("upload", "u1")).await.unwrap();
    }

    #[tokio::test]
    async fn discover_filters_by_health_and_caches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/services/upload"))
            .and(query_param("healthy", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vec![record("upload", "u1")]))
            .mount(&server)
            .await;

        let reg = HttpRegistry::new(server.uri(), fast_backoff(), CancellationToken::new());
        let found = reg.discover("upload").await.unwrap();
        assert!(!found.stale);
        assert_eq!(found.records.len(), 1);
    }

    #[tokio::test]
    async fn unreachable_backend_serves_stale_set() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/services/upload"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vec![record("upload", "u1")]))
            .expect(1)
            .mount(&server)
            .await;

        let reg = HttpRegistry::new(server.uri(), fast_backoff(), CancellationToken::new());
        reg.discover("upload").await.unwrap();

        // Backend goes away; the last known set is served, flagged stale.
        drop(server);
        let found = reg.discover("upload").await.unwrap();
        assert!(found.stale);
        assert_eq!(found.records[0].instance_id, "u1");
    }

    #[tokio::test]
    async fn failed_registration_is_queued_not_errored() {
        let reg = HttpRegistry::new(
            "http://127.0.0.1:1", // nothing listens here
            fast_backoff(),
            CancellationToken::new(),
        );
        reg.register(record("upload", "u1")).await.unwrap();
        assert_eq!(reg.pending.lock().await.len(), 1);
    }
}
