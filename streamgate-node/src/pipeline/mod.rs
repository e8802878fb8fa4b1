//! # Request Pipeline
//!
//! The fixed per-endpoint composition every plugin shares, outer to inner:
//!
//! 1. **Admit**: token-bucket check keyed by the configured client
//!    identity. Denials return immediately with a retry-after hint.
//! 2. **Validate**: declared field rules; failures never reach the handler.
//! 3. **Fingerprint + cache lookup**: deterministic key over the
//!    request-shaping inputs; a fresh hit short-circuits the handler.
//! 4. **Business handler**: with timeout, cancellation, and panic capture.
//! 5. **Cache store**: for cacheable endpoints, after the handler returns.
//! 6. **Invalidate**: mutating endpoints name the prefixes they invalidate;
//!    the pipeline honors the declaration unconditionally on success.
//! 7. **Observe**: latency histogram, outcome counter, and exactly one
//!    audit record per request, whatever the exit path.

pub mod fingerprint;
pub mod validate;

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audit::{AuditLog, AuditRecord, AuditResult};
use crate::cache::{CachedValue, ResponseCache};
use crate::config::{NodeConfig, RateIdentifier};
use crate::error::{Result, ServiceError};
use crate::metrics::{labels, MetricRegistry, CACHE_HITS, CACHE_MISSES, RATE_LIMIT_DENIALS, REQUEST_COUNT, REQUEST_LATENCY_SECONDS};
use crate::rate_limit::RateLimiter;
use validate::FieldRule;

/// A request as seen by handlers, already decoded from the transport.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub id: Uuid,
    pub method: String,
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub client_ip: String,
    pub api_key: Option<String>,
    pub wallet: Option<String>,
    /// Tripped when the client goes away, the deadline elapses, or the
    /// process is stopping. Handlers doing I/O must respect it.
    pub cancel: CancellationToken,
}

impl ApiRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            method: method.into(),
            path: path.into(),
            query: BTreeMap::new(),
            body: None,
            client_ip: "127.0.0.1".to_string(),
            api_key: None,
            wallet: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_query(mut self, key: &str, value: &str) -> Self {
        self.query.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_client_ip(mut self, ip: &str) -> Self {
        self.client_ip = ip.to_string();
        self
    }

    /// The admission identity under the configured scheme. Falls back to
    /// client IP when the configured credential is absent.
    pub fn identity(&self, scheme: RateIdentifier) -> &str {
        match scheme {
            RateIdentifier::ClientIp => &self.client_ip,
            RateIdentifier::ApiKey => self.api_key.as_deref().unwrap_or(&self.client_ip),
            RateIdentifier::Wallet => self.wallet.as_deref().unwrap_or(&self.client_ip),
        }
    }

    /// Path parameter extracted by position against the endpoint's path
    /// template, e.g. `{id}`.
    pub fn path_param(&self, template: &str, name: &str) -> Option<String> {
        let placeholder = format!("{{{name}}}");
        let mut actual = self.path.trim_matches('/').split('/');
        for part in template.trim_matches('/').split('/') {
            let segment = actual.next()?;
            if part == placeholder {
                return Some(segment.to_string());
            }
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn created(body: Value) -> Self {
        Self { status: 201, body }
    }
}

/// A plugin's business handler for one endpoint.
#[async_trait::async_trait]
pub trait EndpointHandler: Send + Sync {
    async fn handle(&self, req: &ApiRequest) -> Result<ApiResponse>;
}

/// Closure adapter, the usual way plugins declare handlers.
pub struct FnHandler<F>(pub F);

#[async_trait::async_trait]
impl<F, Fut> EndpointHandler for FnHandler<F>
where
    F: Fn(ApiRequest) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<ApiResponse>> + Send,
{
    async fn handle(&self, req: &ApiRequest) -> Result<ApiResponse> {
        (self.0)(req.clone()).await
    }
}

/// Everything the pipeline needs to know about an endpoint, declared by the
/// owning plugin at registration.
#[derive(Debug, Clone)]
pub struct EndpointSpec {
    /// Stable dotted name, also the RPC method: `"metadata.video.get"`.
    pub name: String,
    pub method: String,
    /// Route template in axum syntax: `"/api/v1/videos/{id}"`.
    pub path: String,
    pub cacheable: bool,
    /// Overrides the configured default TTL when set.
    pub cache_ttl: Option<Duration>,
    /// Body fields that shape the response and belong in the fingerprint.
    pub fingerprint_body_fields: Vec<String>,
    /// Cache prefixes wiped after a successful mutation.
    pub invalidate_prefixes: Vec<String>,
    pub rules: Vec<FieldRule>,
    /// Idempotent endpoints may retry a transient upstream failure once
    /// within the remaining deadline.
    pub idempotent: bool,
    pub timeout: Option<Duration>,
}

impl EndpointSpec {
    pub fn get(name: &str, path: &str) -> Self {
        Self::bare(name, "GET", path, true)
    }

    pub fn post(name: &str, path: &str) -> Self {
        Self::bare(name, "POST", path, false)
    }

    pub fn put(name: &str, path: &str) -> Self {
        Self::bare(name, "PUT", path, false)
    }

    pub fn delete(name: &str, path: &str) -> Self {
        Self::bare(name, "DELETE", path, false)
    }

    fn bare(name: &str, method: &str, path: &str, idempotent: bool) -> Self {
        Self {
            name: name.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            cacheable: false,
            cache_ttl: None,
            fingerprint_body_fields: Vec::new(),
            invalidate_prefixes: Vec::new(),
            rules: Vec::new(),
            idempotent,
            timeout: None,
        }
    }

    pub fn cacheable(mut self, ttl: Duration) -> Self {
        self.cacheable = true;
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn rules(mut self, rules: Vec<FieldRule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn invalidates(mut self, service: &str, endpoint: &str) -> Self {
        self.invalidate_prefixes
            .push(fingerprint::endpoint_prefix(service, endpoint));
        self
    }

    pub fn fingerprint_fields(mut self, fields: &[&str]) -> Self {
        self.fingerprint_body_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// An endpoint bound to its handler.
#[derive(Clone)]
pub struct Endpoint {
    pub spec: EndpointSpec,
    pub handler: Arc<dyn EndpointHandler>,
}

impl Endpoint {
    pub fn new(spec: EndpointSpec, handler: Arc<dyn EndpointHandler>) -> Self {
        Self { spec, handler }
    }
}

/// The shared stage composition. One pipeline per service; the gateway has
/// its own outer one in front of whichever service it dispatches to.
pub struct Pipeline {
    service: String,
    config: Arc<NodeConfig>,
    metrics: Arc<MetricRegistry>,
    default_limiter: Arc<RateLimiter>,
    /// Endpoints with rate overrides get their own bucket tables.
    endpoint_limiters: dashmap::DashMap<String, Arc<RateLimiter>>,
    cache: Arc<ResponseCache>,
    audit: Arc<AuditLog>,
}

impl Pipeline {
    pub fn new(
        service: impl Into<String>,
        config: Arc<NodeConfig>,
        metrics: Arc<MetricRegistry>,
        default_limiter: Arc<RateLimiter>,
        cache: Arc<ResponseCache>,
        audit: Arc<AuditLog>,
    ) -> Arc<Self> {
        Arc::new(Self {
            service: service.into(),
            config,
            metrics,
            default_limiter,
            endpoint_limiters: dashmap::DashMap::new(),
            cache,
            audit,
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Run `req` through the full stage composition for `endpoint`.
    pub async fn execute(&self, endpoint: &Endpoint, req: ApiRequest) -> Result<ApiResponse> {
        let started = Instant::now();
        let spec = &endpoint.spec;
        let identity = req.identity(self.config.rate_limit.identifier).to_string();

        // Admit. Buckets are per (endpoint, identity): the gateway's outer
        // pipeline and a service's inner pipeline throttle independently.
        let bucket = format!("{}:{identity}", spec.name);
        let decision = self.limiter_for(&spec.name).allow(&bucket);
        if !decision.admitted {
            let _ = self.metrics.incr_counter(
                RATE_LIMIT_DENIALS,
                labels([("endpoint", &spec.name)]),
                1.0,
            );
            let err = ServiceError::RateLimited {
                retry_after: decision.retry_after,
            };
            self.observe(spec, &req, &identity, started, Err(&err), None);
            return Err(err);
        }

        // Validate.
        if let Err(err) = validate::validate(&spec.rules, &req.query, req.body.as_ref()) {
            self.observe(spec, &req, &identity, started, Err(&err), None);
            return Err(err);
        }

        // Fingerprint + cache lookup. Configuration can flip an endpoint's
        // declared cacheability either way.
        let cacheable = self
            .config
            .endpoints
            .get(&spec.name)
            .and_then(|o| o.cacheable)
            .unwrap_or(spec.cacheable);
        let cache_key = cacheable.then(|| self.fingerprint(spec, &req));
        if let Some(key) = &cache_key {
            if let Some(hit) = self.cache.get(key).await {
                let _ = self.metrics.incr_counter(
                    CACHE_HITS,
                    labels([("endpoint", &spec.name)]),
                    1.0,
                );
                match serde_json::from_slice::<Value>(&hit.value.bytes) {
                    Ok(body) => {
                        let response = ApiResponse::ok(body);
                        self.observe(spec, &req, &identity, started, Ok(&response), Some(true));
                        return Ok(response);
                    }
                    Err(e) => {
                        // An undecodable entry is treated as a miss and
                        // dropped; the handler recomputes it.
                        tracing::warn!(key = %key, error = %e, "cached response undecodable, evicting");
                        self.cache.invalidate(key).await;
                    }
                }
            } else {
                let _ = self.metrics.incr_counter(
                    CACHE_MISSES,
                    labels([("endpoint", &spec.name)]),
                    1.0,
                );
            }
        }

        // Handler, with timeout, cancellation, panic capture, and a single
        // retry for idempotent endpoints on transient upstream failures.
        let budget = self.timeout_for(spec);
        let mut outcome = self.invoke_handler(endpoint, &req, budget, started).await;
        if let Err(err) = &outcome {
            let remaining = budget.saturating_sub(started.elapsed());
            if spec.idempotent && err.is_retryable() && remaining > Duration::ZERO {
                tracing::debug!(endpoint = %spec.name, error = %err, "retrying idempotent endpoint");
                outcome = self.invoke_handler(endpoint, &req, remaining, started).await;
            }
        }

        match outcome {
            Ok(response) => {
                // Cache store happens after handler return, before observe.
                if let Some(key) = &cache_key {
                    if response.status < 300 {
                        let ttl = spec.cache_ttl.unwrap_or(self.config.cache.default_ttl);
                        let ttl = self
                            .config
                            .endpoints
                            .get(&spec.name)
                            .and_then(|o| o.cache_ttl)
                            .unwrap_or(ttl);
                        if let Ok(bytes) = serde_json::to_vec(&response.body) {
                            self.cache.put(key, CachedValue::json(bytes), ttl).await;
                        }
                    }
                }
                // Declared invalidations fire only on successful mutations.
                if response.status < 300 {
                    for prefix in &spec.invalidate_prefixes {
                        self.cache.invalidate_prefix(prefix).await;
                    }
                }
                self.observe(
                    spec,
                    &req,
                    &identity,
                    started,
                    Ok(&response),
                    cache_key.as_ref().map(|_| false),
                );
                Ok(response)
            }
            Err(err) => {
                self.observe(spec, &req, &identity, started, Err(&err), None);
                Err(err)
            }
        }
    }

    async fn invoke_handler(
        &self,
        endpoint: &Endpoint,
        req: &ApiRequest,
        budget: Duration,
        started: Instant,
    ) -> Result<ApiResponse> {
        use futures::FutureExt;

        let work = std::panic::AssertUnwindSafe(endpoint.handler.handle(req)).catch_unwind();
        match tokio::time::timeout(budget, work).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic".to_string());
                tracing::error!(
                    endpoint = %endpoint.spec.name,
                    request = %req.id,
                    panic = %detail,
                    "handler panicked"
                );
                Err(ServiceError::internal(format!(
                    "handler panic in {}",
                    endpoint.spec.name
                )))
            }
            Err(_) => {
                // Deadline elapsed: trip the request's cancellation signal so
                // in-flight downstream work unwinds promptly.
                req.cancel.cancel();
                tracing::warn!(
                    endpoint = %endpoint.spec.name,
                    request = %req.id,
                    elapsed = ?started.elapsed(),
                    "handler deadline elapsed"
                );
                Err(ServiceError::Timeout)
            }
        }
    }

    /// Metrics and the request's single audit record. Every exit path of
    /// `execute` funnels through here exactly once.
    fn observe(
        &self,
        spec: &EndpointSpec,
        req: &ApiRequest,
        identity: &str,
        started: Instant,
        outcome: std::result::Result<&ApiResponse, &ServiceError>,
        cache_hit: Option<bool>,
    ) {
        let outcome_label = match outcome {
            Ok(_) => "success",
            Err(err) => err.code(),
        };
        let _ = self.metrics.incr_counter(
            REQUEST_COUNT,
            labels([
                ("endpoint", &spec.name),
                ("method", &spec.method),
                ("outcome", outcome_label),
            ]),
            1.0,
        );
        let _ = self.metrics.observe_histogram(
            REQUEST_LATENCY_SECONDS,
            labels([("endpoint", &spec.name), ("method", &spec.method)]),
            started.elapsed().as_secs_f64(),
        );

        let result = match outcome {
            Ok(_) => AuditResult::Success,
            Err(err) => err.audit_result(),
        };
        let mut record = AuditRecord::new(identity, &spec.name, &req.path, result)
            .with_detail("request_id", req.id.to_string());
        if let Some(hit) = cache_hit {
            record = record.with_detail("cache", if hit { "hit" } else { "miss" });
        }
        if let Err(err) = outcome {
            record = record.with_detail("error", err.code());
        }
        self.audit.record(record);
    }

    fn fingerprint(&self, spec: &EndpointSpec, req: &ApiRequest) -> String {
        let empty = Value::Null;
        let body_fields: Vec<(&str, &Value)> = spec
            .fingerprint_body_fields
            .iter()
            .map(|field| {
                let value = req
                    .body
                    .as_ref()
                    .and_then(|b| b.get(field))
                    .unwrap_or(&empty);
                (field.as_str(), value)
            })
            .collect();
        fingerprint::cache_key(
            &self.service,
            &spec.name,
            &spec.method,
            &req.path,
            &req.query,
            &body_fields,
        )
    }

    fn limiter_for(&self, endpoint: &str) -> Arc<RateLimiter> {
        if !self.config.endpoints.contains_key(endpoint) {
            return self.default_limiter.clone();
        }
        self.endpoint_limiters
            .entry(endpoint.to_string())
            .or_insert_with(|| {
                let (capacity, refill) = self.config.rate_limit_for(endpoint);
                Arc::new(RateLimiter::new(
                    capacity,
                    refill,
                    self.config.rate_limit.idle_eviction,
                ))
            })
            .clone()
    }

    fn timeout_for(&self, spec: &EndpointSpec) -> Duration {
        self.config
            .endpoints
            .get(&spec.name)
            .and_then(|o| o.timeout)
            .or(spec.timeout)
            .unwrap_or(self.config.server.request_timeout)
    }
}
