//! Request-pipeline scenario tests: cache round-trips, rate-limit
//! boundaries, audit exhaustiveness, validation, timeouts, and panic
//! capture.

use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use streamgate_node::audit::{AuditLog, AuditRecord, AuditResult, AuditSink};
use streamgate_node::cache::ResponseCache;
use streamgate_node::config::{AuditConfig, NodeConfig};
use streamgate_node::error::ServiceError;
use streamgate_node::metrics::MetricRegistry;
use streamgate_node::pipeline::validate::{FieldKind, FieldRule, FieldSource};
use streamgate_node::pipeline::{
    ApiRequest, ApiResponse, Endpoint, EndpointSpec, FnHandler, Pipeline,
};
use streamgate_node::rate_limit::RateLimiter;

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

struct Harness {
    pipeline: Arc<Pipeline>,
    metrics: Arc<MetricRegistry>,
    audit: Arc<AuditLog>,
    sink: Arc<CapturingSink>,
}

fn harness(mutate: impl FnOnce(&mut NodeConfig)) -> Harness {
    let mut config = NodeConfig::default();
    mutate(&mut config);
    let config = Arc::new(config);

    let metrics = Arc::new(MetricRegistry::new(config.metrics.histogram_buckets.clone()));
    let limiter = Arc::new(RateLimiter::new(
        config.rate_limit.capacity,
        config.rate_limit.refill_per_sec,
        config.rate_limit.idle_eviction,
    ));
    let cache = Arc::new(ResponseCache::new(
        config.cache.max_entries,
        config.cache.max_bytes,
        None,
    ));
    let sink = Arc::new(CapturingSink {
        records: Mutex::new(Vec::new()),
    });
    let audit = AuditLog::with_sink(
        &AuditConfig::default(),
        sink.clone(),
        CancellationToken::new(),
    );
    let pipeline = Pipeline::new(
        "echo",
        config,
        metrics.clone(),
        limiter,
        cache,
        audit.clone(),
    );
    Harness {
        pipeline,
        metrics,
        audit,
        sink,
    }
}

/// An endpoint answering `GET /echo?x=N` with the value and a nonce that
/// changes on every actual handler invocation.
fn echo_endpoint(ttl: Duration) -> (Endpoint, Arc<AtomicU32>) {
    let invocations = Arc::new(AtomicU32::new(0));
    let counter = invocations.clone();
    let spec = if ttl.is_zero() {
        EndpointSpec::get("echo.get", "/echo")
    } else {
        EndpointSpec::get("echo.get", "/echo").cacheable(ttl)
    };
    let endpoint = Endpoint::new(
        spec,
        Arc::new(FnHandler(move |req: ApiRequest| {
            let counter = counter.clone();
            async move {
                let n: i64 = req
                    .query
                    .get("x")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                let ts = counter.fetch_add(1, Ordering::SeqCst);
                Ok(ApiResponse::ok(json!({"n": n, "ts": ts})))
            }
        })),
    );
    (endpoint, invocations)
}

async fn drain_audit(harness: &Harness, expected: usize) -> Vec<AuditRecord> {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if harness.sink.records.lock().unwrap().len() >= expected {
                break;
            }
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("audit records arrived");
    harness.sink.records.lock().unwrap().clone()
}

fn counter_sum(metrics: &MetricRegistry, name: &str) -> f64 {
    metrics.scalar_sum(name).unwrap_or(0.0)
}

#[tokio::test]
async fn cache_round_trip_serves_identical_response() {
    let harness = harness(|_| {});
    let (endpoint, invocations) = echo_endpoint(Duration::from_secs(5));

    let first = harness
        .pipeline
        .execute(&endpoint, ApiRequest::new("GET", "/echo").with_query("x", "7"))
        .await
        .unwrap();
    let second = harness
        .pipeline
        .execute(&endpoint, ApiRequest::new("GET", "/echo").with_query("x", "7"))
        .await
        .unwrap();

    // Identical body, one handler invocation: the second response came from
    // the cache.
    assert_eq!(first, second);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    assert_eq!(counter_sum(&harness.metrics, "request_count"), 2.0);
    assert_eq!(counter_sum(&harness.metrics, "cache_hits"), 1.0);
    assert_eq!(counter_sum(&harness.metrics, "cache_misses"), 1.0);

    let records = drain_audit(&harness, 2).await;
    assert!(records.iter().all(|r| r.result == AuditResult::Success));
    assert_eq!(records[1].detail.get("cache").map(String::as_str), Some("hit"));
}

#[tokio::test]
async fn different_query_misses_the_cache() {
    let harness = harness(|_| {});
    let (endpoint, invocations) = echo_endpoint(Duration::from_secs(5));

    harness
        .pipeline
        .execute(&endpoint, ApiRequest::new("GET", "/echo").with_query("x", "7"))
        .await
        .unwrap();
    harness
        .pipeline
        .execute(&endpoint, ApiRequest::new("GET", "/echo").with_query("x", "8"))
        .await
        .unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn rate_limit_boundary_denies_with_retry_after() {
    let harness = harness(|config| {
        config.rate_limit.capacity = 3;
        config.rate_limit.refill_per_sec = 1.0;
    });
    let (endpoint, _invocations) = echo_endpoint(Duration::ZERO);

    let mut admitted = 0;
    let mut denied = Vec::new();
    for _ in 0..5 {
        let req = ApiRequest::new("GET", "/echo").with_client_ip("10.1.1.1");
        match harness.pipeline.execute(&endpoint, req).await {
            Ok(_) => admitted += 1,
            Err(err) => denied.push(err),
        }
    }

    assert_eq!(admitted, 3);
    assert_eq!(denied.len(), 2);
    for err in &denied {
        match err {
            ServiceError::RateLimited { retry_after } => {
                assert!(*retry_after <= Duration::from_secs(1));
                assert!(*retry_after > Duration::ZERO);
            }
            other => panic!("expected rate limited, got {other:?}"),
        }
    }

    assert_eq!(counter_sum(&harness.metrics, "rate_limit_denials"), 2.0);
    let records = drain_audit(&harness, 5).await;
    let rate_limited = records
        .iter()
        .filter(|r| r.result == AuditResult::RateLimited)
        .count();
    assert_eq!(rate_limited, 2);
}

#[tokio::test]
async fn other_clients_are_not_throttled_together() {
    let harness = harness(|config| {
        config.rate_limit.capacity = 1;
        config.rate_limit.refill_per_sec = 0.1;
    });
    let (endpoint, _invocations) = echo_endpoint(Duration::ZERO);

    for i in 0..4 {
        let req = ApiRequest::new("GET", "/echo").with_client_ip(&format!("10.0.0.{i}"));
        harness.pipeline.execute(&endpoint, req).await.unwrap();
    }
}

#[tokio::test]
async fn validation_failure_never_reaches_the_handler() {
    let harness = harness(|_| {});
    let (mut endpoint, invocations) = echo_endpoint(Duration::ZERO);
    endpoint.spec.rules = vec![FieldRule::new(
        "x",
        FieldSource::Query,
        true,
        FieldKind::Int { min: 0, max: 100 },
    )];

    let err = harness
        .pipeline
        .execute(
            &endpoint,
            ApiRequest::new("GET", "/echo").with_query("x", "over9000"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidInput { .. }));
    assert_eq!(invocations.load(Ordering::SeqCst), 0);

    let records = drain_audit(&harness, 1).await;
    assert_eq!(records[0].result, AuditResult::Denied);
}

#[tokio::test]
async fn panicking_handler_becomes_internal_error() {
    let harness = harness(|_| {});
    let endpoint = Endpoint::new(
        EndpointSpec::get("boom.get", "/boom"),
        Arc::new(FnHandler(|_req: ApiRequest| async move {
            panic!("handler exploded");
            #[allow(unreachable_code)]
            Ok(ApiResponse::ok(json!({})))
        })),
    );

    let err = harness
        .pipeline
        .execute(&endpoint, ApiRequest::new("GET", "/boom"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Internal { .. }));

    let records = drain_audit(&harness, 1).await;
    assert_eq!(records[0].result, AuditResult::Error);
}

#[tokio::test]
async fn slow_handler_times_out_and_trips_cancellation() {
    let harness = harness(|_| {});
    let endpoint = Endpoint::new(
        EndpointSpec::get("slow.get", "/slow").timeout(Duration::from_millis(50)),
        Arc::new(FnHandler(|req: ApiRequest| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            let _ = req;
            Ok(ApiResponse::ok(json!({})))
        })),
    );

    let req = ApiRequest::new("GET", "/slow");
    let cancel = req.cancel.clone();
    let err = harness.pipeline.execute(&endpoint, req).await.unwrap_err();
    assert!(matches!(err, ServiceError::Timeout));
    assert!(cancel.is_cancelled());
}

#[tokio::test]
async fn successful_mutation_invalidates_declared_prefixes() {
    let harness = harness(|_| {});
    let (get_endpoint, invocations) = echo_endpoint(Duration::from_secs(60));
    let put_endpoint = Endpoint::new(
        EndpointSpec::put("echo.put", "/echo").invalidates("echo", "echo.get"),
        Arc::new(FnHandler(|_req: ApiRequest| async move {
            Ok(ApiResponse::ok(json!({"updated": true})))
        })),
    );

    let req = || ApiRequest::new("GET", "/echo").with_query("x", "1");
    harness.pipeline.execute(&get_endpoint, req()).await.unwrap();
    harness.pipeline.execute(&get_endpoint, req()).await.unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 1, "second get was cached");

    harness
        .pipeline
        .execute(&put_endpoint, ApiRequest::new("PUT", "/echo"))
        .await
        .unwrap();

    harness.pipeline.execute(&get_endpoint, req()).await.unwrap();
    assert_eq!(
        invocations.load(Ordering::SeqCst),
        2,
        "mutation invalidated the cached entry"
    );
}

#[tokio::test]
async fn audit_exhaustiveness_over_mixed_traffic() {
    let harness = harness(|config| {
        config.rate_limit.capacity = 200;
        config.rate_limit.refill_per_sec = 1000.0;
        config.audit.buffer_size = 4096;
    });
    let (echo, _invocations) = echo_endpoint(Duration::ZERO);

    let mut validated = echo.clone();
    validated.spec = EndpointSpec::get("strict.get", "/strict").rules(vec![FieldRule::new(
        "x",
        FieldSource::Query,
        true,
        FieldKind::Int { min: 0, max: 10 },
    )]);

    let not_found = Endpoint::new(
        EndpointSpec::get("missing.get", "/missing"),
        Arc::new(FnHandler(|_req: ApiRequest| async move {
            Err::<ApiResponse, _>(ServiceError::NotFound {
                resource: "nothing here".to_string(),
            })
        })),
    );
    let panicking = Endpoint::new(
        EndpointSpec::get("boom.get", "/boom"),
        Arc::new(FnHandler(|_req: ApiRequest| async move {
            panic!("kaboom");
            #[allow(unreachable_code)]
            Ok(ApiResponse::ok(json!({})))
        })),
    );

    let total = 100;
    let mut expected: HashMap<AuditResult, usize> = HashMap::new();
    for i in 0..total {
        match i % 4 {
            0 => {
                let req = ApiRequest::new("GET", "/echo").with_query("x", "1");
                harness.pipeline.execute(&echo, req).await.unwrap();
                *expected.entry(AuditResult::Success).or_default() += 1;
            }
            1 => {
                let req = ApiRequest::new("GET", "/strict");
                harness.pipeline.execute(&validated, req).await.unwrap_err();
                *expected.entry(AuditResult::Denied).or_default() += 1;
            }
            2 => {
                let req = ApiRequest::new("GET", "/missing");
                harness.pipeline.execute(&not_found, req).await.unwrap_err();
                *expected.entry(AuditResult::Error).or_default() += 1;
            }
            _ => {
                let req = ApiRequest::new("GET", "/boom");
                harness.pipeline.execute(&panicking, req).await.unwrap_err();
                *expected.entry(AuditResult::Error).or_default() += 1;
            }
        }
    }

    assert_eq!(harness.audit.recorded(), total as u64);
    assert_eq!(harness.audit.dropped(), 0);
    let records = drain_audit(&harness, total).await;
    assert_eq!(records.len(), total);

    let mut observed: HashMap<AuditResult, usize> = HashMap::new();
    for record in &records {
        *observed.entry(record.result).or_default() += 1;
    }
    assert_eq!(observed, expected);

    // Every record carries a request id and they are all distinct.
    let ids: std::collections::HashSet<&String> = records
        .iter()
        .map(|r| r.detail.get("request_id").expect("request id present"))
        .collect();
    assert_eq!(ids.len(), total);
}
