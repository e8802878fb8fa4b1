use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;

use streamgate_node::metrics::{labels, MetricRegistry};
use streamgate_node::pipeline::fingerprint;
use streamgate_node::rate_limit::RateLimiter;

fn bench_rate_limiter(c: &mut Criterion) {
    let limiter = RateLimiter::new(1_000_000, 1_000_000.0, Duration::from_secs(600));
    c.bench_function("rate_limiter_allow_hot_bucket", |b| {
        b.iter(|| black_box(limiter.allow("bench-client")));
    });

    let limiter = RateLimiter::new(100, 50.0, Duration::from_secs(600));
    let mut i = 0u64;
    c.bench_function("rate_limiter_allow_cold_buckets", |b| {
        b.iter(|| {
            i += 1;
            black_box(limiter.allow(&format!("client-{i}")));
        });
    });
}

fn bench_metrics(c: &mut Criterion) {
    let registry = MetricRegistry::new(vec![0.005, 0.025, 0.1, 0.5, 1.0, 5.0]);
    let series = labels([("endpoint", "/echo"), ("method", "GET")]);
    c.bench_function("counter_increment", |b| {
        b.iter(|| registry.incr_counter("request_count", series.clone(), 1.0));
    });
    c.bench_function("histogram_observe", |b| {
        b.iter(|| registry.observe_histogram("request_latency_seconds", series.clone(), 0.042));
    });

    for _ in 0..500 {
        let _ = registry.incr_counter(
            "request_count",
            labels([("endpoint", &format!("/e{}", rand_suffix()))]),
            1.0,
        );
    }
    c.bench_function("scrape_text_500_series", |b| {
        b.iter(|| black_box(registry.scrape_text()));
    });
}

fn bench_fingerprint(c: &mut Criterion) {
    let query: BTreeMap<String, String> = [("x", "7"), ("page", "2"), ("sort", "desc")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let body = json!({"title": "launch teaser", "tags": ["a", "b"], "meta": {"z": 1, "a": 2}});
    c.bench_function("request_fingerprint", |b| {
        b.iter(|| {
            black_box(fingerprint::cache_key(
                "metadata",
                "metadata.video.get",
                "GET",
                "/videos/v1",
                &query,
                &[("doc", &body)],
            ))
        });
    });
}

fn rand_suffix() -> u32 {
    use std::sync::atomic::{AtomicU32, Ordering};
    static NEXT: AtomicU32 = AtomicU32::new(0);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

criterion_group!(benches, bench_rate_limiter, bench_metrics, bench_fingerprint);
criterion_main!(benches);
