//! # Configuration
//!
//! Hierarchical configuration for a StreamGate process: a TOML file plus
//! `STREAMGATE__`-prefixed environment overrides (`STREAMGATE__SERVER__PORT=9000`
//! overrides `[server] port`). The loaded snapshot is read-mostly; a reload
//! produces a new snapshot rather than mutating the old one in place.
//!
//! Durations are human-readable strings (`"250ms"`, `"30s"`, `"5m"`, `"1h"`).
//!
//! ## File example
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 8080
//!
//! [metrics]
//! histogram_buckets = [0.005, 0.025, 0.1, 0.5, 1.0, 5.0]
//!
//! [rate_limit]
//! capacity = 100
//! refill_per_sec = 50.0
//! identifier = "client_ip"
//!
//! [cache]
//! max_entries = 10000
//! max_bytes = 67108864
//! default_ttl = "30s"
//!
//! [audit]
//! buffer_size = 4096
//! sink = "stdout"
//!
//! [bus]
//! mode = "in_proc"
//!
//! [registry]
//! backend = "in_memory"
//! health_staleness = "30s"
//! health_interval = "10s"
//!
//! [rpc]
//! default_timeout = "10s"
//! max_timeout = "30s"
//! picker = "round_robin"
//!
//! [kernel]
//! stop_drain_deadline = "20s"
//!
//! [[alerts.rules]]
//! name = "high_error_rate"
//! metric = "request_count"
//! comparator = ">"
//! threshold = 100.0
//! severity = "warning"
//! channels = ["log"]
//! suppress_for = "5m"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use streamgate_fabric::bus::broker::ReconnectConfig;
use streamgate_fabric::duration_serde;
use streamgate_fabric::registry::RegistryConfig;
use streamgate_fabric::rpc::{PickStrategy, RpcPoolConfig};

use crate::alerts::AlertRuleConfig;

/// Complete configuration snapshot for one process.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NodeConfig {
    pub server: ServerConfig,
    pub metrics: MetricsConfig,
    pub rate_limit: RateLimitConfig,
    pub cache: CacheConfig,
    pub audit: AuditConfig,
    pub alerts: AlertsConfig,
    pub bus: BusConfig,
    pub registry: RegistrySectionConfig,
    pub rpc: RpcConfig,
    pub kernel: KernelConfig,
    pub auth: AuthConfig,
    /// Per-endpoint overrides keyed by endpoint name (e.g. `"metadata.video.get"`).
    pub endpoints: HashMap<String, EndpointOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Default endpoint timeout; endpoint specs may declare shorter ones.
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Ordered upper bounds for latency histograms, in seconds.
    pub histogram_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            histogram_buckets: vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
        }
    }
}

/// Identity the rate limiter keys buckets by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateIdentifier {
    ClientIp,
    ApiKey,
    Wallet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub refill_per_sec: f64,
    pub identifier: RateIdentifier,
    /// Buckets idle beyond this are evicted.
    #[serde(with = "duration_serde")]
    pub idle_eviction: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            refill_per_sec: 50.0,
            identifier: RateIdentifier::ClientIp,
            idle_eviction: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub max_bytes: usize,
    #[serde(with = "duration_serde")]
    pub default_ttl: Duration,
    /// Optional Redis tier shared across instances.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_bytes: 64 * 1024 * 1024,
            default_ttl: Duration::from_secs(30),
            redis_url: None,
        }
    }
}

/// Where audit records are written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind", content = "target")]
pub enum AuditSinkConfig {
    Stdout,
    File(String),
    External(String),
}

impl Default for AuditSinkConfig {
    fn default() -> Self {
        AuditSinkConfig::Stdout
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub buffer_size: usize,
    pub sink: AuditSinkConfig,
    /// When false the recorder still never blocks; it drops the new record
    /// instead of the oldest.
    pub drop_on_full: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            buffer_size: 4096,
            sink: AuditSinkConfig::Stdout,
            drop_on_full: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    #[serde(with = "duration_serde")]
    pub eval_interval: Duration,
    pub rules: Vec<AlertRuleConfig>,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            eval_interval: Duration::from_secs(15),
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusMode {
    InProc,
    Broker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub mode: BusMode,
    pub broker_url: String,
    pub reconnect: ReconnectConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            mode: BusMode::InProc,
            broker_url: "nats://127.0.0.1:4222".to_string(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryBackend {
    InMemory,
    External,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySectionConfig {
    pub backend: RegistryBackend,
    /// Base URL of the external registry service.
    pub url: String,
    #[serde(with = "duration_serde")]
    pub health_staleness: Duration,
    #[serde(with = "duration_serde")]
    pub health_interval: Duration,
}

impl Default for RegistrySectionConfig {
    fn default() -> Self {
        Self {
            backend: RegistryBackend::InMemory,
            url: "http://127.0.0.1:8500".to_string(),
            health_staleness: Duration::from_secs(30),
            health_interval: Duration::from_secs(10),
        }
    }
}

impl RegistrySectionConfig {
    pub fn fabric_config(&self) -> RegistryConfig {
        RegistryConfig {
            staleness: self.health_staleness,
            heartbeat_interval: self.health_interval,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    #[serde(with = "duration_serde")]
    pub default_timeout: Duration,
    #[serde(with = "duration_serde")]
    pub max_timeout: Duration,
    pub picker: PickStrategy,
    pub breaker: streamgate_fabric::rpc::breaker::BreakerConfig,
}

impl Default for RpcConfig {
    fn default() -> Self {
        let defaults = RpcPoolConfig::default();
        Self {
            default_timeout: defaults.default_timeout,
            max_timeout: defaults.max_timeout,
            picker: defaults.picker,
            breaker: defaults.breaker,
        }
    }
}

impl RpcConfig {
    pub fn pool_config(&self) -> RpcPoolConfig {
        RpcPoolConfig {
            default_timeout: self.default_timeout,
            max_timeout: self.max_timeout,
            picker: self.picker,
            breaker: self.breaker.clone(),
            ..RpcPoolConfig::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Total time the microkernel waits for plugins to stop before
    /// abandoning them.
    #[serde(with = "duration_serde")]
    pub stop_drain_deadline: Duration,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            stop_drain_deadline: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 signing secret for issued tokens.
    pub token_secret: String,
    pub issuer: String,
    pub audience: String,
    #[serde(with = "duration_serde")]
    pub token_ttl: Duration,
    #[serde(with = "duration_serde")]
    pub nonce_ttl: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_secret: String::new(),
            issuer: "streamgate".to_string(),
            audience: "streamgate-api".to_string(),
            token_ttl: Duration::from_secs(3600),
            nonce_ttl: Duration::from_secs(300),
        }
    }
}

/// Per-endpoint tuning applied over the endpoint's declared defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EndpointOverride {
    pub capacity: Option<u32>,
    pub refill_per_sec: Option<f64>,
    pub cacheable: Option<bool>,
    #[serde(with = "duration_serde::option")]
    pub cache_ttl: Option<Duration>,
    #[serde(with = "duration_serde::option")]
    pub timeout: Option<Duration>,
}

impl NodeConfig {
    /// Load a snapshot from an optional TOML file plus environment
    /// overrides. A missing file is fine when `path` is `None`; a named file
    /// that does not parse aborts boot.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let raw = builder
            .add_source(
                config::Environment::with_prefix("STREAMGATE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let loaded: NodeConfig = raw.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.metrics.histogram_buckets.is_empty() {
            anyhow::bail!("metrics.histogram_buckets cannot be empty");
        }
        if self
            .metrics
            .histogram_buckets
            .windows(2)
            .any(|w| w[0] >= w[1])
        {
            anyhow::bail!("metrics.histogram_buckets must be strictly increasing");
        }
        if self.rate_limit.capacity == 0 {
            anyhow::bail!("rate_limit.capacity must be at least 1");
        }
        if self.rate_limit.refill_per_sec <= 0.0 {
            anyhow::bail!("rate_limit.refill_per_sec must be positive");
        }
        if self.cache.max_entries == 0 || self.cache.max_bytes == 0 {
            anyhow::bail!("cache bounds must be nonzero");
        }
        if self.audit.buffer_size == 0 {
            anyhow::bail!("audit.buffer_size must be nonzero");
        }
        if self.rpc.default_timeout > self.rpc.max_timeout {
            anyhow::bail!("rpc.default_timeout cannot exceed rpc.max_timeout");
        }
        Ok(())
    }

    /// Effective rate-limit parameters for an endpoint name.
    pub fn rate_limit_for(&self, endpoint: &str) -> (u32, f64) {
        let over = self.endpoints.get(endpoint);
        (
            over.and_then(|o| o.capacity).unwrap_or(self.rate_limit.capacity),
            over.and_then(|o| o.refill_per_sec)
                .unwrap_or(self.rate_limit.refill_per_sec),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        NodeConfig::default().validate().unwrap();
    }

    #[test]
    fn loads_toml_file() {
        let mut file = tempfile();
        write!(
            file.1,
            r#"
            [server]
            port = 9999

            [rate_limit]
            capacity = 3
            refill_per_sec = 1.0
            identifier = "api_key"

            [cache]
            default_ttl = "5s"

            [bus]
            mode = "broker"
            broker_url = "nats://broker:4222"

            [[alerts.rules]]
            name = "errors"
            metric = "request_count"
            comparator = ">"
            threshold = 10.0
            severity = "critical"
            channels = ["log"]
            suppress_for = "1m"
            "#
        )
        .unwrap();

        let loaded = NodeConfig::load(Some(&file.0)).unwrap();
        assert_eq!(loaded.server.port, 9999);
        assert_eq!(loaded.rate_limit.capacity, 3);
        assert_eq!(loaded.rate_limit.identifier, RateIdentifier::ApiKey);
        assert_eq!(loaded.cache.default_ttl, Duration::from_secs(5));
        assert_eq!(loaded.bus.mode, BusMode::Broker);
        assert_eq!(loaded.alerts.rules.len(), 1);
    }

    #[test]
    fn snapshot_round_trips_through_toml() {
        let mut cfg = NodeConfig::default();
        cfg.server.port = 4242;
        cfg.cache.default_ttl = Duration::from_secs(90);
        let rendered = toml::to_string(&cfg).unwrap();
        let reloaded: NodeConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(reloaded.server.port, 4242);
        assert_eq!(reloaded.cache.default_ttl, Duration::from_secs(90));
    }

    #[test]
    fn rejects_unsorted_buckets() {
        let mut cfg = NodeConfig::default();
        cfg.metrics.histogram_buckets = vec![1.0, 0.5];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn endpoint_override_wins() {
        let mut cfg = NodeConfig::default();
        cfg.endpoints.insert(
            "upload.create".to_string(),
            EndpointOverride {
                capacity: Some(5),
                ..Default::default()
            },
        );
        assert_eq!(cfg.rate_limit_for("upload.create").0, 5);
        assert_eq!(
            cfg.rate_limit_for("other").0,
            RateLimitConfig::default().capacity
        );
    }

    fn tempfile() -> (std::path::PathBuf, std::fs::File) {
        let path = std::env::temp_dir().join(format!("sg-config-{}.toml", uuid::Uuid::new_v4()));
        let file = std::fs::File::create(&path).unwrap();
        (path, file)
    }
}
