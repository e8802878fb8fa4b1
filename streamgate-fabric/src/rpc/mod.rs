//! # RPC Client Pool
//!
//! Cached connections to discovered service instances. Calls are JSON over
//! HTTP: `POST {instance}/rpc/{service}/{method}` with the request body,
//! answered by the target's own request pipeline. The pool:
//!
//! - opens a connection per (service, instance) lazily on first demand,
//! - picks among healthy instances round-robin or by least outstanding
//!   requests,
//! - evicts connections when the registry watch reports the instance gone,
//!   after consecutive call failures, or after an idle TTL,
//! - guards every instance with a circuit breaker (closed, open, half-open
//!   single probe),
//! - caps every call's deadline at the pool ceiling.
//!
//! Failures surface as [`FabricError`]: `NoInstances`, `CircuitOpen`,
//! `Timeout`, `Transport`, or `Remote` with the remote error code.

pub mod breaker;

use crate::error::{FabricError, Result};
use crate::registry::{ServiceRegistry, WatchEvent};
use breaker::{Admission, BreakerConfig, BreakerSnapshot, CircuitBreaker};
use dashmap::DashMap;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PickStrategy {
    RoundRobin,
    LeastOutstanding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcPoolConfig {
    /// Applied when the caller supplies no deadline.
    #[serde(with = "crate::duration_serde")]
    pub default_timeout: Duration,
    /// Hard ceiling over any caller-supplied deadline.
    #[serde(with = "crate::duration_serde")]
    pub max_timeout: Duration,
    pub picker: PickStrategy,
    pub breaker: BreakerConfig,
    /// Connections idle beyond this are closed.
    #[serde(with = "crate::duration_serde")]
    pub idle_ttl: Duration,
    /// Consecutive failures that evict a connection outright.
    pub failure_evict_threshold: u32,
}

impl Default for RpcPoolConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(10),
            max_timeout: Duration::from_secs(30),
            picker: PickStrategy::RoundRobin,
            breaker: BreakerConfig::default(),
            idle_ttl: Duration::from_secs(300),
            failure_evict_threshold: 5,
        }
    }
}

struct Conn {
    instance_id: String,
    base_url: String,
    breaker: CircuitBreaker,
    outstanding: AtomicUsize,
    consecutive_failures: AtomicU32,
    last_used: Mutex<Instant>,
}

impl Conn {
    fn touch(&self) {
        *self.last_used.lock().expect("last_used lock poisoned") = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .expect("last_used lock poisoned")
            .elapsed()
    }
}

struct ServiceConns {
    conns: DashMap<String, Arc<Conn>>,
    round_robin: AtomicUsize,
    watch_started: AtomicBool,
}

/// Connection pool over registry-discovered instances.
pub struct RpcClientPool {
    config: RpcPoolConfig,
    http: reqwest::Client,
    registry: Arc<dyn ServiceRegistry>,
    services: DashMap<String, Arc<ServiceConns>>,
    cancel: CancellationToken,
}

/// Decrements the outstanding counter when a call completes by any path.
struct OutstandingGuard(Arc<Conn>);

impl Drop for OutstandingGuard {
    fn drop(&mut self) {
        self.0.outstanding.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Deserialize)]
struct RemoteErrorBody {
    error: RemoteErrorDetail,
}

#[derive(Debug, Deserialize)]
struct RemoteErrorDetail {
    code: String,
    message: String,
}

impl RpcClientPool {
    pub fn new(
        config: RpcPoolConfig,
        registry: Arc<dyn ServiceRegistry>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            http: reqwest::Client::builder()
                .timeout(config.max_timeout)
                .build()
                .expect("reqwest client construction is infallible with static options"),
            config,
            registry,
            services: DashMap::new(),
            cancel,
        });
        pool.clone().spawn_idle_sweeper();
        pool
    }

    /// Call `service.method` with a JSON request, returning the JSON
    /// response. `deadline` is capped at the pool's `max_timeout`.
    pub async fn call_unary(
        &self,
        service: &str,
        method: &str,
        request: Value,
        deadline: Option<Duration>,
    ) -> Result<Value> {
        let timeout = self.effective_timeout(deadline);
        let conn = self.admit_instance(service).await?;
        let _guard = self.begin(&conn);

        let url = format!("{}/rpc/{service}/{method}", conn.base_url);
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            timeout,
            self.http.post(&url).timeout(timeout).json(&request).send(),
        )
        .await;

        match outcome {
            Err(_) => {
                self.record_failure(service, &conn).await;
                Err(FabricError::Timeout {
                    service: service.to_string(),
                    elapsed: started.elapsed(),
                })
            }
            Ok(Err(e)) => {
                self.record_failure(service, &conn).await;
                if e.is_timeout() {
                    Err(FabricError::Timeout {
                        service: service.to_string(),
                        elapsed: started.elapsed(),
                    })
                } else {
                    Err(FabricError::Transport {
                        service: service.to_string(),
                        message: e.to_string(),
                    })
                }
            }
            Ok(Ok(response)) => self.classify_response(service, &conn, response).await,
        }
    }

    /// Server-streaming call: newline-delimited JSON frames from the remote.
    pub async fn call_server_stream(
        &self,
        service: &str,
        method: &str,
        request: Value,
        deadline: Option<Duration>,
    ) -> Result<impl futures::Stream<Item = Result<Value>> + Send + Unpin> {
        let timeout = self.effective_timeout(deadline);
        let conn = self.admit_instance(service).await?;
        let guard = self.begin(&conn);

        let url = format!("{}/rpc/{service}/{method}", conn.base_url);
        let response = self
            .http
            .post(&url)
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                let service = service.to_string();
                if e.is_timeout() {
                    FabricError::Timeout {
                        service,
                        elapsed: timeout,
                    }
                } else {
                    FabricError::Transport {
                        service,
                        message: e.to_string(),
                    }
                }
            })?;

        if !response.status().is_success() {
            self.record_failure(service, &conn).await;
            return Err(FabricError::Remote {
                service: service.to_string(),
                code: response.status().as_str().to_string(),
                message: "stream open failed".to_string(),
            });
        }
        conn.breaker.on_success().await;
        conn.consecutive_failures.store(0, Ordering::Relaxed);

        let service_name = service.to_string();
        let stream = response.bytes_stream();
        let framed = async_stream::stream! {
            // Guard lives as long as the stream so outstanding-count tracking
            // covers the whole exchange.
            let _guard = guard;
            let mut buffer: Vec<u8> = Vec::new();
            futures::pin_mut!(stream);
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        buffer.extend_from_slice(&bytes);
                        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                            let line: Vec<u8> = buffer.drain(..=pos).collect();
                            let line = &line[..line.len() - 1];
                            if line.is_empty() {
                                continue;
                            }
                            match serde_json::from_slice::<Value>(line) {
                                Ok(value) => yield Ok(value),
                                Err(e) => yield Err(FabricError::Transport {
                                    service: service_name.clone(),
                                    message: format!("bad stream frame: {e}"),
                                }),
                            }
                        }
                    }
                    Err(e) => {
                        yield Err(FabricError::Transport {
                            service: service_name.clone(),
                            message: e.to_string(),
                        });
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(framed))
    }

    /// Breaker snapshots for the admin surface, keyed by service/instance.
    pub async fn breaker_snapshots(&self) -> Vec<(String, String, BreakerSnapshot)> {
        let mut out = Vec::new();
        for service in self.services.iter() {
            for conn in service.conns.iter() {
                out.push((
                    service.key().clone(),
                    conn.instance_id.clone(),
                    conn.breaker.snapshot().await,
                ));
            }
        }
        out
    }

    fn effective_timeout(&self, deadline: Option<Duration>) -> Duration {
        deadline
            .unwrap_or(self.config.default_timeout)
            .min(self.config.max_timeout)
    }

    fn begin(&self, conn: &Arc<Conn>) -> OutstandingGuard {
        conn.outstanding.fetch_add(1, Ordering::Relaxed);
        conn.touch();
        OutstandingGuard(conn.clone())
    }

    async fn classify_response(
        &self,
        service: &str,
        conn: &Arc<Conn>,
        response: reqwest::Response,
    ) -> Result<Value> {
        let status = response.status();
        if status.is_success() {
            conn.breaker.on_success().await;
            conn.consecutive_failures.store(0, Ordering::Relaxed);
            return response
                .json::<Value>()
                .await
                .map_err(|e| FabricError::Transport {
                    service: service.to_string(),
                    message: format!("response decode failed: {e}"),
                });
        }

        // Server-side faults count against the instance; application-level
        // 4xx answers are the caller's problem, not the instance's.
        if status.is_server_error() {
            self.record_failure(service, conn).await;
        } else {
            conn.breaker.on_success().await;
        }

        let (code, message) = match response.json::<RemoteErrorBody>().await {
            Ok(body) => (body.error.code, body.error.message),
            Err(_) => (status.as_str().to_string(), status.to_string()),
        };
        Err(FabricError::Remote {
            service: service.to_string(),
            code,
            message,
        })
    }

    async fn record_failure(&self, service: &str, conn: &Arc<Conn>) {
        conn.breaker.on_failure().await;
        let failures = conn.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.config.failure_evict_threshold {
            if let Some(svc) = self.services.get(service) {
                svc.conns.remove(&conn.instance_id);
                tracing::warn!(
                    service,
                    instance = %conn.instance_id,
                    failures,
                    "connection evicted after consecutive failures"
                );
            }
        }
    }

    /// Refresh the connection set for `service` from discovery and pick an
    /// instance whose breaker admits the call.
    async fn admit_instance(&self, service: &str) -> Result<Arc<Conn>> {
        let svc = self.ensure_service(service).await?;

        let conns: Vec<Arc<Conn>> = svc.conns.iter().map(|e| e.value().clone()).collect();
        if conns.is_empty() {
            return Err(FabricError::NoInstances {
                service: service.to_string(),
            });
        }

        let ordered: Vec<Arc<Conn>> = match self.config.picker {
            PickStrategy::RoundRobin => {
                let start = svc.round_robin.fetch_add(1, Ordering::Relaxed) % conns.len();
                conns
                    .iter()
                    .cycle()
                    .skip(start)
                    .take(conns.len())
                    .cloned()
                    .collect()
            }
            PickStrategy::LeastOutstanding => {
                let mut sorted = conns.clone();
                sorted.sort_by_key(|c| c.outstanding.load(Ordering::Relaxed));
                sorted
            }
        };

        let mut min_retry: Option<Duration> = None;
        let mut refused_instance = String::new();
        for conn in ordered {
            match conn.breaker.admit().await {
                Admission::Admitted | Admission::Probe => return Ok(conn),
                Admission::Refused(retry_after) => {
                    if min_retry.map_or(true, |d| retry_after < d) {
                        min_retry = Some(retry_after);
                        refused_instance = conn.instance_id.clone();
                    }
                }
            }
        }
        Err(FabricError::CircuitOpen {
            service: service.to_string(),
            instance: refused_instance,
            retry_after: min_retry.unwrap_or(self.config.breaker.open_duration),
        })
    }

    async fn ensure_service(&self, service: &str) -> Result<Arc<ServiceConns>> {
        let svc = self
            .services
            .entry(service.to_string())
            .or_insert_with(|| {
                Arc::new(ServiceConns {
                    conns: DashMap::new(),
                    round_robin: AtomicUsize::new(0),
                    watch_started: AtomicBool::new(false),
                })
            })
            .clone();

        let discovery = self.registry.discover(service).await?;
        for record in &discovery.records {
            svc.conns
                .entry(record.instance_id.clone())
                .or_insert_with(|| {
                    Arc::new(Conn {
                        instance_id: record.instance_id.clone(),
                        base_url: record.base_url(),
                        breaker: CircuitBreaker::new(self.config.breaker.clone()),
                        outstanding: AtomicUsize::new(0),
                        consecutive_failures: AtomicU32::new(0),
                        last_used: Mutex::new(Instant::now()),
                    })
                });
        }
        // Instances discovery no longer reports are dropped unless the set
        // is stale, in which case the cached connections are all we have.
        if !discovery.stale {
            let live: std::collections::HashSet<&str> = discovery
                .records
                .iter()
                .map(|r| r.instance_id.as_str())
                .collect();
            svc.conns.retain(|id, _| live.contains(id.as_str()));
        }

        if !svc.watch_started.swap(true, Ordering::SeqCst) {
            self.spawn_watch(service.to_string(), svc.clone());
        }
        Ok(svc)
    }

    /// Watch the registry for departures and drop their connections
    /// immediately instead of waiting for call failures.
    fn spawn_watch(&self, service: String, svc: Arc<ServiceConns>) {
        let registry = self.registry.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let mut watch = match registry.watch(&service).await {
                    Ok(watch) => watch,
                    Err(e) => {
                        tracing::warn!(service = %service, error = %e, "pool watch unavailable");
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
                        }
                    }
                };
                loop {
                    let event = tokio::select! {
                        _ = cancel.cancelled() => return,
                        event = watch.recv() => event,
                    };
                    match event {
                        Some(WatchEvent::Left { instance_id, .. }) => {
                            if svc.conns.remove(&instance_id).is_some() {
                                tracing::info!(service = %service, instance = %instance_id, "connection closed on deregistration");
                            }
                        }
                        Some(_) => {}
                        // Stream lost: re-list happens on the next call's
                        // discover; just re-watch.
                        None => break,
                    }
                }
            }
        });
    }

    fn spawn_idle_sweeper(self: Arc<Self>) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.idle_ttl.max(Duration::from_secs(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        for svc in self.services.iter() {
                            svc.conns.retain(|_, conn| {
                                conn.outstanding.load(Ordering::Relaxed) > 0
                                    || conn.idle_for() <= self.config.idle_ttl
                            });
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::in_memory::InMemoryRegistry;
    use crate::registry::{RegistryConfig, ServiceRecord};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn pool_with_instance(
        server: &MockServer,
        config: RpcPoolConfig,
    ) -> (Arc<RpcClientPool>, Arc<InMemoryRegistry>) {
        let registry = InMemoryRegistry::new(RegistryConfig::default(), CancellationToken::new());
        let address = server.address();
        registry
            .register(ServiceRecord {
                service: "metadata".to_string(),
                instance_id: "m1".to_string(),
                address: address.ip().to_string(),
                port: address.port(),
                tags: vec![],
                health_url: format!("{}/health/live", server.uri()),
                metadata: Default::default(),
            })
            .await
            .unwrap();
        let pool = RpcClientPool::new(config, registry.clone(), CancellationToken::new());
        (pool, registry)
    }

    #[tokio::test]
    async fn unary_call_round_trips_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc/metadata/video.get"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"title": "intro"})))
            .mount(&server)
            .await;

        let (pool, _registry) = pool_with_instance(&server, RpcPoolConfig::default()).await;
        let response = pool
            .call_unary("metadata", "video.get", json!({"id": "v1"}), None)
            .await
            .unwrap();
        assert_eq!(response["title"], "intro");
    }

    #[tokio::test]
    async fn missing_service_is_no_instances() {
        let registry = InMemoryRegistry::new(RegistryConfig::default(), CancellationToken::new());
        let pool = RpcClientPool::new(RpcPoolConfig::default(), registry, CancellationToken::new());
        let err = pool
            .call_unary("nowhere", "x", json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FabricError::NoInstances { .. }));
    }

    #[tokio::test]
    async fn remote_error_body_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc/metadata/video.get"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": {"code": "not_found", "message": "no such video"}
            })))
            .mount(&server)
            .await;

        let (pool, _registry) = pool_with_instance(&server, RpcPoolConfig::default()).await;
        let err = pool
            .call_unary("metadata", "video.get", json!({"id": "nope"}), None)
            .await
            .unwrap_err();
        match err {
            FabricError::Remote { code, .. } => assert_eq!(code, "not_found"),
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn breaker_opens_after_threshold_and_skips_network() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc/metadata/video.get"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let config = RpcPoolConfig {
            breaker: BreakerConfig {
                failure_threshold: 3,
                window: Duration::from_secs(10),
                open_duration: Duration::from_secs(60),
            },
            failure_evict_threshold: 100,
            ..RpcPoolConfig::default()
        };
        let (pool, _registry) = pool_with_instance(&server, config).await;

        for _ in 0..3 {
            let err = pool
                .call_unary("metadata", "video.get", json!({}), None)
                .await
                .unwrap_err();
            assert!(matches!(err, FabricError::Remote { .. }));
        }

        // Call 4: refused without a network attempt (the mock's expect(3)
        // would fail the test otherwise), and fast.
        let started = Instant::now();
        let err = pool
            .call_unary("metadata", "video.get", json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FabricError::CircuitOpen { .. }));
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn server_stream_frames_newline_delimited_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc/metadata/video.watch"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("{\"seq\":1}\n{\"seq\":2}\n{\"seq\":3}\n", "application/x-ndjson"),
            )
            .mount(&server)
            .await;

        let (pool, _registry) = pool_with_instance(&server, RpcPoolConfig::default()).await;
        let mut stream = pool
            .call_server_stream("metadata", "video.watch", json!({}), None)
            .await
            .unwrap();
        let mut seqs = Vec::new();
        while let Some(frame) = stream.next().await {
            seqs.push(frame.unwrap()["seq"].as_u64().unwrap());
        }
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn deregistration_evicts_connection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let (pool, registry) = pool_with_instance(&server, RpcPoolConfig::default()).await;
        pool.call_unary("metadata", "video.get", json!({}), None)
            .await
            .unwrap();

        registry.deregister("metadata", "m1").await.unwrap();
        let err = pool
            .call_unary("metadata", "video.get", json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FabricError::NoInstances { .. }));
    }
}
