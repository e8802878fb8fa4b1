//! # Health Checker
//!
//! Aggregates per-component probes into the live/ready/deep responses served
//! at `/health/live`, `/health/ready`, and `/health`. Probe results are
//! cached briefly so scrapers cannot cause probe storms. Overall status is
//! `healthy` when every probe passes, `degraded` when only non-critical
//! probes fail, and `unhealthy` when a critical probe fails.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Result of one probe invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub healthy: bool,
    pub detail: String,
}

impl ProbeResult {
    pub fn healthy(detail: impl Into<String>) -> Self {
        Self {
            healthy: true,
            detail: detail.into(),
        }
    }

    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            detail: detail.into(),
        }
    }
}

/// A cheap component probe. Deep probes may exercise dependencies; they are
/// still expected to finish quickly.
#[async_trait::async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> ProbeResult;
}

/// Closure-backed probe, the common registration form.
pub struct FnProbe<F>(pub F);

#[async_trait::async_trait]
impl<F, Fut> HealthProbe for FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: std::future::Future<Output = ProbeResult> + Send,
{
    async fn check(&self) -> ProbeResult {
        (self.0)().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeDetail {
    pub name: String,
    pub healthy: bool,
    pub critical: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: OverallStatus,
    pub version: String,
    pub checked_at: DateTime<Utc>,
    pub probes: Vec<ProbeDetail>,
}

struct ProbeEntry {
    probe: Arc<dyn HealthProbe>,
    critical: bool,
}

pub struct HealthChecker {
    version: String,
    probes: DashMap<String, ProbeEntry>,
    started: AtomicBool,
    cache_ttl: Duration,
    cache: RwLock<Option<(Instant, HealthReport)>>,
}

impl HealthChecker {
    pub fn new(version: impl Into<String>, cache_ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            version: version.into(),
            probes: DashMap::new(),
            started: AtomicBool::new(false),
            cache_ttl,
            cache: RwLock::new(None),
        })
    }

    /// Register a probe. Critical probe failures make the process unhealthy
    /// and not ready; non-critical failures only degrade it.
    pub fn register_probe(&self, name: impl Into<String>, critical: bool, probe: Arc<dyn HealthProbe>) {
        self.probes.insert(name.into(), ProbeEntry { probe, critical });
    }

    pub fn remove_probe(&self, name: &str) {
        self.probes.remove(name);
    }

    /// Flipped by the microkernel once startup completes.
    pub fn set_started(&self, started: bool) {
        self.started.store(started, Ordering::Release);
    }

    /// Liveness: the process is running. Always true when reachable.
    pub fn live(&self) -> bool {
        true
    }

    /// Readiness: startup complete and no critical probe failing.
    pub async fn ready(&self) -> bool {
        if !self.started.load(Ordering::Acquire) {
            return false;
        }
        let report = self.aggregate().await;
        report.status != OverallStatus::Unhealthy
    }

    /// Full aggregate with per-probe detail, cached for `cache_ttl`.
    pub async fn aggregate(&self) -> HealthReport {
        {
            let cache = self.cache.read().await;
            if let Some((at, report)) = cache.as_ref() {
                if at.elapsed() < self.cache_ttl {
                    return report.clone();
                }
            }
        }

        let mut details = Vec::with_capacity(self.probes.len());
        let entries: Vec<(String, Arc<dyn HealthProbe>, bool)> = self
            .probes
            .iter()
            .map(|e| (e.key().clone(), e.value().probe.clone(), e.value().critical))
            .collect();
        for (name, probe, critical) in entries {
            let result = probe.check().await;
            details.push(ProbeDetail {
                name,
                healthy: result.healthy,
                critical,
                detail: result.detail,
            });
        }
        details.sort_by(|a, b| a.name.cmp(&b.name));

        let status = if details.iter().any(|d| !d.healthy && d.critical) {
            OverallStatus::Unhealthy
        } else if details.iter().any(|d| !d.healthy) {
            OverallStatus::Degraded
        } else {
            OverallStatus::Healthy
        };
        let report = HealthReport {
            status,
            version: self.version.clone(),
            checked_at: Utc::now(),
            probes: details,
        };

        *self.cache.write().await = Some((Instant::now(), report.clone()));
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn fixed(healthy: bool) -> Arc<dyn HealthProbe> {
        Arc::new(FnProbe(move || async move {
            if healthy {
                ProbeResult::healthy("ok")
            } else {
                ProbeResult::unhealthy("down")
            }
        }))
    }

    #[tokio::test]
    async fn all_healthy_is_healthy() {
        let checker = HealthChecker::new("0.1.0", Duration::ZERO);
        checker.register_probe("cache", false, fixed(true));
        checker.register_probe("registry", true, fixed(true));
        assert_eq!(checker.aggregate().await.status, OverallStatus::Healthy);
    }

    #[tokio::test]
    async fn noncritical_failure_degrades() {
        let checker = HealthChecker::new("0.1.0", Duration::ZERO);
        checker.register_probe("cache", false, fixed(false));
        checker.register_probe("registry", true, fixed(true));
        assert_eq!(checker.aggregate().await.status, OverallStatus::Degraded);
    }

    #[tokio::test]
    async fn critical_failure_is_unhealthy_and_not_ready() {
        let checker = HealthChecker::new("0.1.0", Duration::ZERO);
        checker.set_started(true);
        checker.register_probe("registry", true, fixed(false));
        assert_eq!(checker.aggregate().await.status, OverallStatus::Unhealthy);
        assert!(!checker.ready().await);
    }

    #[tokio::test]
    async fn not_ready_before_startup_completes() {
        let checker = HealthChecker::new("0.1.0", Duration::ZERO);
        checker.register_probe("registry", true, fixed(true));
        assert!(!checker.ready().await);
        checker.set_started(true);
        assert!(checker.ready().await);
    }

    #[tokio::test]
    async fn cache_prevents_probe_storms() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let checker = HealthChecker::new("0.1.0", Duration::from_secs(60));
        checker.register_probe(
            "counted",
            false,
            Arc::new(FnProbe(move || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    ProbeResult::healthy("ok")
                }
            })),
        );
        for _ in 0..10 {
            checker.aggregate().await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
