//! # Metric Registry
//!
//! Thread-safe counters, gauges, and histograms with pull-scrape text
//! exposition. Series identity is `(name, sorted labels)`; the first
//! observation of a name fixes its kind and later writes of a different kind
//! fail with a kind mismatch. Histograms use the fixed bucket boundaries
//! from configuration; P50/P95/P99 estimates are interpolated from bucket
//! counts at snapshot time.
//!
//! The registry is constructed once by the microkernel and injected into
//! every plugin; there is no process-global collector.
//!
//! Pipeline code records a small set of well-known names with `endpoint`,
//! `method`, and `outcome` labels rather than minting a metric name per
//! endpoint.

use dashmap::DashMap;
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::ServiceError;

pub const REQUEST_COUNT: &str = "request_count";
pub const REQUEST_LATENCY_SECONDS: &str = "request_latency_seconds";
pub const CACHE_HITS: &str = "cache_hits";
pub const CACHE_MISSES: &str = "cache_misses";
pub const RATE_LIMIT_DENIALS: &str = "rate_limit_denials";
pub const AUDIT_DROPS: &str = "audit_dropped_records";
pub const ALERT_NOTIFY_FAILURES: &str = "alert_notify_failures";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

/// Ordered label pairs. Sorted on construction so identical label sets
/// compare equal regardless of call-site ordering.
pub type Labels = Vec<(String, String)>;

pub fn labels<const N: usize>(pairs: [(&str, &str); N]) -> Labels {
    let mut labels: Labels = pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    labels.sort();
    labels
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SeriesKey {
    name: String,
    labels: Labels,
}

/// f64 cell updated by compare-and-swap on the bit pattern.
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Release);
    }

    fn add(&self, delta: f64) {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let next = (f64::from_bits(current) + delta).to_bits();
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

struct HistogramData {
    /// Count per configured bucket, plus the overflow bucket at the end.
    bucket_counts: Vec<u64>,
    sum: f64,
    count: u64,
}

enum Series {
    Counter(AtomicF64),
    Gauge(AtomicF64),
    // A histogram observation touches several cells; the mutex keeps the
    // update atomic for readers. Critical section is a few arithmetic ops.
    Histogram(Mutex<HistogramData>),
}

impl Series {
    fn kind(&self) -> MetricKind {
        match self {
            Series::Counter(_) => MetricKind::Counter,
            Series::Gauge(_) => MetricKind::Gauge,
            Series::Histogram(_) => MetricKind::Histogram,
        }
    }
}

/// Point-in-time value of one series.
#[derive(Debug, Clone, Serialize)]
pub struct MetricPoint {
    pub name: String,
    pub labels: Labels,
    pub kind: MetricKind,
    pub value: MetricValue,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum MetricValue {
    Scalar { value: f64 },
    Histogram(HistogramPoint),
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramPoint {
    /// (upper bound, cumulative count) per configured bucket.
    pub buckets: Vec<(f64, u64)>,
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

pub struct MetricRegistry {
    bucket_bounds: Vec<f64>,
    kinds: DashMap<String, MetricKind>,
    series: DashMap<SeriesKey, Series>,
}

impl MetricRegistry {
    /// `bucket_bounds` must be strictly increasing (validated at config
    /// load).
    pub fn new(bucket_bounds: Vec<f64>) -> Self {
        Self {
            bucket_bounds,
            kinds: DashMap::new(),
            series: DashMap::new(),
        }
    }

    pub fn incr_counter(
        &self,
        name: &str,
        labels: Labels,
        delta: f64,
    ) -> Result<(), ServiceError> {
        if delta < 0.0 {
            return Err(ServiceError::invalid_input(format!(
                "counter delta must be non-negative, got {delta} for {name}"
            )));
        }
        self.check_kind(name, MetricKind::Counter)?;
        let key = SeriesKey {
            name: name.to_string(),
            labels,
        };
        let entry = self
            .series
            .entry(key)
            .or_insert_with(|| Series::Counter(AtomicF64::new(0.0)));
        match entry.value() {
            Series::Counter(cell) => {
                cell.add(delta);
                Ok(())
            }
            _ => unreachable!("kind checked against the name table"),
        }
    }

    pub fn set_gauge(&self, name: &str, labels: Labels, value: f64) -> Result<(), ServiceError> {
        self.check_kind(name, MetricKind::Gauge)?;
        let key = SeriesKey {
            name: name.to_string(),
            labels,
        };
        let entry = self
            .series
            .entry(key)
            .or_insert_with(|| Series::Gauge(AtomicF64::new(0.0)));
        match entry.value() {
            Series::Gauge(cell) => {
                cell.set(value);
                Ok(())
            }
            _ => unreachable!("kind checked against the name table"),
        }
    }

    pub fn observe_histogram(
        &self,
        name: &str,
        labels: Labels,
        value: f64,
    ) -> Result<(), ServiceError> {
        self.check_kind(name, MetricKind::Histogram)?;
        let key = SeriesKey {
            name: name.to_string(),
            labels,
        };
        let bounds = self.bucket_bounds.len();
        let entry = self.series.entry(key).or_insert_with(|| {
            Series::Histogram(Mutex::new(HistogramData {
                bucket_counts: vec![0; bounds + 1],
                sum: 0.0,
                count: 0,
            }))
        });
        match entry.value() {
            Series::Histogram(data) => {
                let slot = self
                    .bucket_bounds
                    .iter()
                    .position(|bound| value <= *bound)
                    .unwrap_or(bounds);
                let mut data = data.lock().expect("histogram lock poisoned");
                data.bucket_counts[slot] += 1;
                data.sum += value;
                data.count += 1;
                Ok(())
            }
            _ => unreachable!("kind checked against the name table"),
        }
    }

    /// Consistent point-in-time copy. Per-series values are atomic;
    /// cross-series interleaving is allowed.
    pub fn snapshot(&self) -> Vec<MetricPoint> {
        let mut points: Vec<MetricPoint> = self
            .series
            .iter()
            .map(|entry| {
                let key = entry.key();
                let series = entry.value();
                let value = match series {
                    Series::Counter(cell) | Series::Gauge(cell) => {
                        MetricValue::Scalar { value: cell.get() }
                    }
                    Series::Histogram(data) => {
                        let data = data.lock().expect("histogram lock poisoned");
                        MetricValue::Histogram(self.histogram_point(&data))
                    }
                };
                MetricPoint {
                    name: key.name.clone(),
                    labels: key.labels.clone(),
                    kind: series.kind(),
                    value,
                }
            })
            .collect();
        points.sort_by(|a, b| (&a.name, &a.labels).cmp(&(&b.name, &b.labels)));
        points
    }

    /// Text exposition of the current snapshot: one `# TYPE` line per name,
    /// one line per labeled series, histograms as `_bucket`/`_sum`/`_count`.
    pub fn scrape_text(&self) -> String {
        let points = self.snapshot();
        let mut out = String::new();
        let mut last_name = "";
        for point in &points {
            if point.name != last_name {
                let kind = match point.kind {
                    MetricKind::Counter => "counter",
                    MetricKind::Gauge => "gauge",
                    MetricKind::Histogram => "histogram",
                };
                let _ = writeln!(out, "# TYPE {} {}", point.name, kind);
                last_name = &point.name;
            }
            match &point.value {
                MetricValue::Scalar { value } => {
                    let _ = writeln!(
                        out,
                        "{}{} {}",
                        point.name,
                        format_labels(&point.labels, None),
                        format_float(*value)
                    );
                }
                MetricValue::Histogram(hist) => {
                    // Bucket counts are already cumulative.
                    for (bound, count) in &hist.buckets {
                        let _ = writeln!(
                            out,
                            "{}_bucket{} {}",
                            point.name,
                            format_labels(&point.labels, Some(&format_float(*bound))),
                            count
                        );
                    }
                    let _ = writeln!(
                        out,
                        "{}_bucket{} {}",
                        point.name,
                        format_labels(&point.labels, Some("+Inf")),
                        hist.count
                    );
                    let _ = writeln!(
                        out,
                        "{}_sum{} {}",
                        point.name,
                        format_labels(&point.labels, None),
                        format_float(hist.sum)
                    );
                    let _ = writeln!(
                        out,
                        "{}_count{} {}",
                        point.name,
                        format_labels(&point.labels, None),
                        hist.count
                    );
                }
            }
        }
        out
    }

    /// Scalar value of a series, if present. Used by the alert engine.
    pub fn scalar_value(&self, name: &str, labels: &Labels) -> Option<f64> {
        let key = SeriesKey {
            name: name.to_string(),
            labels: labels.clone(),
        };
        self.series.get(&key).and_then(|entry| match entry.value() {
            Series::Counter(cell) | Series::Gauge(cell) => Some(cell.get()),
            Series::Histogram(_) => None,
        })
    }

    /// Sum of all scalar series with this name, across label sets.
    pub fn scalar_sum(&self, name: &str) -> Option<f64> {
        let mut sum = 0.0;
        let mut seen = false;
        for entry in self.series.iter() {
            if entry.key().name == name {
                if let Series::Counter(cell) | Series::Gauge(cell) = entry.value() {
                    sum += cell.get();
                    seen = true;
                }
            }
        }
        seen.then_some(sum)
    }

    fn check_kind(&self, name: &str, wanted: MetricKind) -> Result<(), ServiceError> {
        let existing = *self
            .kinds
            .entry(name.to_string())
            .or_insert(wanted)
            .value();
        if existing != wanted {
            return Err(ServiceError::KindMismatch {
                series: name.to_string(),
            });
        }
        Ok(())
    }

    fn histogram_point(&self, data: &HistogramData) -> HistogramPoint {
        let mut cumulative = 0u64;
        let buckets: Vec<(f64, u64)> = self
            .bucket_bounds
            .iter()
            .enumerate()
            .map(|(i, bound)| {
                cumulative += data.bucket_counts[i];
                (*bound, cumulative)
            })
            .collect();
        HistogramPoint {
            p50: percentile(&self.bucket_bounds, &data.bucket_counts, data.count, 0.50),
            p95: percentile(&self.bucket_bounds, &data.bucket_counts, data.count, 0.95),
            p99: percentile(&self.bucket_bounds, &data.bucket_counts, data.count, 0.99),
            buckets,
            count: data.count,
            sum: data.sum,
        }
    }
}

/// Linear interpolation within the bucket containing the target rank, the
/// standard estimate for fixed-boundary histograms.
fn percentile(bounds: &[f64], counts: &[u64], total: u64, q: f64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let rank = q * total as f64;
    let mut cumulative = 0u64;
    for (i, count) in counts.iter().enumerate() {
        let prev_cumulative = cumulative;
        cumulative += count;
        if (cumulative as f64) >= rank {
            let lower = if i == 0 { 0.0 } else { bounds[i - 1] };
            let upper = bounds.get(i).copied().unwrap_or(lower);
            if *count == 0 || upper <= lower {
                return upper;
            }
            let within = (rank - prev_cumulative as f64) / *count as f64;
            return lower + (upper - lower) * within;
        }
    }
    *bounds.last().unwrap_or(&0.0)
}

fn format_labels(labels: &Labels, le: Option<&str>) -> String {
    if labels.is_empty() && le.is_none() {
        return String::new();
    }
    let mut parts: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{}\"", v.replace('"', "\\\"")))
        .collect();
    if let Some(le) = le {
        parts.push(format!("le=\"{le}\""));
    }
    format!("{{{}}}", parts.join(","))
}

fn format_float(value: f64) -> String {
    if value == value.trunc() && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> MetricRegistry {
        MetricRegistry::new(vec![0.1, 0.5, 1.0])
    }

    #[test]
    fn counters_accumulate_and_stay_monotonic() {
        let reg = registry();
        let l = labels([("endpoint", "/echo")]);
        let mut last = 0.0;
        for _ in 0..10 {
            reg.incr_counter(REQUEST_COUNT, l.clone(), 1.0).unwrap();
            let now = reg.scalar_value(REQUEST_COUNT, &l).unwrap();
            assert!(now >= last);
            last = now;
        }
        assert_eq!(last, 10.0);
    }

    #[test]
    fn negative_counter_delta_is_rejected() {
        let reg = registry();
        assert!(reg
            .incr_counter(REQUEST_COUNT, labels([]), -1.0)
            .is_err());
    }

    #[test]
    fn kind_is_fixed_by_first_observation() {
        let reg = registry();
        reg.incr_counter("weird", labels([]), 1.0).unwrap();
        let err = reg.set_gauge("weird", labels([]), 3.0).unwrap_err();
        assert!(matches!(err, ServiceError::KindMismatch { .. }));
    }

    #[test]
    fn label_order_does_not_split_series() {
        let reg = registry();
        reg.incr_counter(
            REQUEST_COUNT,
            labels([("a", "1"), ("b", "2")]),
            1.0,
        )
        .unwrap();
        reg.incr_counter(
            REQUEST_COUNT,
            labels([("b", "2"), ("a", "1")]),
            1.0,
        )
        .unwrap();
        assert_eq!(reg.snapshot().len(), 1);
    }

    #[test]
    fn histogram_buckets_and_percentiles() {
        let reg = registry();
        let l = labels([("endpoint", "/echo")]);
        for value in [0.05, 0.05, 0.3, 0.7, 2.0] {
            reg.observe_histogram(REQUEST_LATENCY_SECONDS, l.clone(), value)
                .unwrap();
        }
        let snapshot = reg.snapshot();
        let MetricValue::Histogram(hist) = &snapshot[0].value else {
            panic!("expected histogram");
        };
        assert_eq!(hist.count, 5);
        assert_eq!(hist.buckets, vec![(0.1, 2), (0.5, 3), (1.0, 4)]);
        assert!((hist.sum - 3.1).abs() < 1e-9);
        assert!(hist.p50 > 0.1 && hist.p50 <= 0.5);
        assert!(hist.p99 >= 1.0);
    }

    #[test]
    fn scrape_emits_type_once_per_name() {
        let reg = registry();
        reg.incr_counter(REQUEST_COUNT, labels([("endpoint", "/a")]), 1.0)
            .unwrap();
        reg.incr_counter(REQUEST_COUNT, labels([("endpoint", "/b")]), 2.0)
            .unwrap();
        reg.observe_histogram(REQUEST_LATENCY_SECONDS, labels([]), 0.2)
            .unwrap();

        let text = reg.scrape_text();
        assert_eq!(text.matches("# TYPE request_count counter").count(), 1);
        assert!(text.contains("request_count{endpoint=\"/a\"} 1"));
        assert!(text.contains("request_count{endpoint=\"/b\"} 2"));
        assert!(text.contains("request_latency_seconds_bucket{le=\"+Inf\"} 1"));
        assert!(text.contains("request_latency_seconds_count 1"));
    }

    #[test]
    fn scrape_round_trips_scalar_tuples() {
        let reg = registry();
        reg.incr_counter(CACHE_HITS, labels([("endpoint", "/x")]), 3.0)
            .unwrap();
        reg.set_gauge("queue_depth", labels([]), 7.0).unwrap();

        let text = reg.scrape_text();
        // Re-ingest the scalar lines and compare against the snapshot.
        let mut parsed = Vec::new();
        for line in text.lines().filter(|l| !l.starts_with('#')) {
            let (series, value) = line.rsplit_once(' ').unwrap();
            parsed.push((series.to_string(), value.parse::<f64>().unwrap()));
        }
        assert!(parsed.contains(&("cache_hits{endpoint=\"/x\"}".to_string(), 3.0)));
        assert!(parsed.contains(&("queue_depth".to_string(), 7.0)));
    }
}
