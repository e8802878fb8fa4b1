//! # Shared Resource Bundle
//!
//! The microkernel constructs one bundle per process and injects the same
//! instance into every plugin's `init`. Monolith and microservices wirings
//! produce the same type with different backends behind the bus and
//! registry traits; plugin code cannot observe which one it got.
//!
//! The bundle is read-only to plugins: they use the references, never
//! replace them.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use streamgate_fabric::bus::broker::BrokerBus;
use streamgate_fabric::bus::in_proc::InProcBus;
use streamgate_fabric::bus::EventBus;
use streamgate_fabric::registry::http::HttpRegistry;
use streamgate_fabric::registry::in_memory::InMemoryRegistry;
use streamgate_fabric::registry::{ServiceRecord, ServiceRegistry};
use streamgate_fabric::rpc::RpcClientPool;

use crate::alerts::AlertEngine;
use crate::audit::AuditLog;
use crate::cache::ResponseCache;
use crate::config::{BusMode, NodeConfig, RegistryBackend};
use crate::error::ServiceError;
use crate::health::HealthChecker;
use crate::metrics::MetricRegistry;
use crate::pipeline::{Endpoint, Pipeline};
use crate::rate_limit::RateLimiter;

const BROKER_CONNECT_ATTEMPTS: u32 = 10;
const HEALTH_CACHE_TTL: Duration = Duration::from_secs(2);

/// An endpoint bound into the process-wide dispatch table.
#[derive(Clone)]
pub struct BoundEndpoint {
    pub service: String,
    pub endpoint: Endpoint,
}

/// Dispatch table mapping (service, endpoint name) to handlers. The HTTP
/// server builds its router from it; the gateway uses it for in-process
/// dispatch; the RPC serving route resolves methods through it.
#[derive(Default)]
pub struct EndpointTable {
    inner: dashmap::DashMap<(String, String), Arc<BoundEndpoint>>,
}

impl EndpointTable {
    pub fn register(&self, service: &str, endpoint: Endpoint) {
        self.inner.insert(
            (service.to_string(), endpoint.spec.name.clone()),
            Arc::new(BoundEndpoint {
                service: service.to_string(),
                endpoint,
            }),
        );
    }

    pub fn get(&self, service: &str, name: &str) -> Option<Arc<BoundEndpoint>> {
        self.inner
            .get(&(service.to_string(), name.to_string()))
            .map(|e| e.value().clone())
    }

    pub fn all(&self) -> Vec<Arc<BoundEndpoint>> {
        let mut out: Vec<Arc<BoundEndpoint>> =
            self.inner.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| {
            (&a.service, &a.endpoint.spec.name).cmp(&(&b.service, &b.endpoint.spec.name))
        });
        out
    }

    pub fn deregister_service(&self, service: &str) {
        self.inner.retain(|(s, _), _| s != service);
    }
}

/// The C1–C8 bundle plus the process-level plumbing plugins share.
pub struct Resources {
    pub config: Arc<NodeConfig>,
    pub metrics: Arc<MetricRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
    pub cache: Arc<ResponseCache>,
    pub audit: Arc<AuditLog>,
    pub alerts: Arc<AlertEngine>,
    pub health: Arc<HealthChecker>,
    pub bus: Arc<dyn EventBus>,
    pub registry: Arc<dyn ServiceRegistry>,
    pub rpc: Arc<RpcClientPool>,
    pub endpoints: Arc<EndpointTable>,
    /// Stable identity of this process, reused in service records.
    pub instance_id: String,
    /// Fires once on orderly shutdown.
    pub shutdown: CancellationToken,
    pipelines: dashmap::DashMap<String, Arc<Pipeline>>,
}

impl Resources {
    /// Monolith wiring: in-process bus, local registry.
    pub async fn monolith(config: Arc<NodeConfig>) -> Result<Arc<Self>, ServiceError> {
        let shutdown = CancellationToken::new();
        let instance_id = Self::instance_id();
        let bus: Arc<dyn EventBus> = Arc::new(InProcBus::new(instance_id.clone()));
        let registry: Arc<dyn ServiceRegistry> = InMemoryRegistry::new(
            config.registry.fabric_config(),
            shutdown.child_token(),
        );
        Self::assemble(config, bus, registry, instance_id, shutdown)
    }

    /// Microservices wiring: broker bus, external registry.
    pub async fn microservices(config: Arc<NodeConfig>) -> Result<Arc<Self>, ServiceError> {
        let shutdown = CancellationToken::new();
        let instance_id = Self::instance_id();
        let bus: Arc<dyn EventBus> = match config.bus.mode {
            BusMode::Broker => Arc::new(
                BrokerBus::connect(
                    &config.bus.broker_url,
                    instance_id.clone(),
                    config.bus.reconnect.clone(),
                    BROKER_CONNECT_ATTEMPTS,
                )
                .await
                .map_err(|e| ServiceError::StartupFailure {
                    plugin: "bus".to_string(),
                    message: e.to_string(),
                })?,
            ),
            BusMode::InProc => Arc::new(InProcBus::new(instance_id.clone())),
        };
        let registry: Arc<dyn ServiceRegistry> = match config.registry.backend {
            RegistryBackend::External => HttpRegistry::new(
                config.registry.url.clone(),
                config.bus.reconnect.clone(),
                shutdown.child_token(),
            ),
            RegistryBackend::InMemory => InMemoryRegistry::new(
                config.registry.fabric_config(),
                shutdown.child_token(),
            ),
        };
        Self::assemble(config, bus, registry, instance_id, shutdown)
    }

    fn assemble(
        config: Arc<NodeConfig>,
        bus: Arc<dyn EventBus>,
        registry: Arc<dyn ServiceRegistry>,
        instance_id: String,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>, ServiceError> {
        let metrics = Arc::new(MetricRegistry::new(config.metrics.histogram_buckets.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limit.capacity,
            config.rate_limit.refill_per_sec,
            config.rate_limit.idle_eviction,
        ));
        let cache = Arc::new(ResponseCache::new(
            config.cache.max_entries,
            config.cache.max_bytes,
            config.cache.redis_url.as_deref(),
        ));
        let audit = AuditLog::new(&config.audit, shutdown.child_token());
        let alerts = AlertEngine::new(config.alerts.rules.clone(), metrics.clone());
        alerts.spawn(config.alerts.eval_interval, shutdown.child_token());
        let health = HealthChecker::new(env!("CARGO_PKG_VERSION"), HEALTH_CACHE_TTL);
        let rpc = RpcClientPool::new(
            config.rpc.pool_config(),
            registry.clone(),
            shutdown.child_token(),
        );

        Ok(Arc::new(Self {
            config,
            metrics,
            rate_limiter,
            cache,
            audit,
            alerts,
            health,
            bus,
            registry,
            rpc,
            endpoints: Arc::new(EndpointTable::default()),
            instance_id,
            shutdown,
            pipelines: dashmap::DashMap::new(),
        }))
    }

    /// The pipeline instance for a service, created on first use so every
    /// plugin in the process shares one per service name.
    pub fn pipeline(&self, service: &str) -> Arc<Pipeline> {
        self.pipelines
            .entry(service.to_string())
            .or_insert_with(|| {
                Pipeline::new(
                    service,
                    self.config.clone(),
                    self.metrics.clone(),
                    self.rate_limiter.clone(),
                    self.cache.clone(),
                    self.audit.clone(),
                )
            })
            .clone()
    }

    /// The service record a plugin registers for itself.
    pub fn service_record(&self, service: &str) -> ServiceRecord {
        ServiceRecord {
            service: service.to_string(),
            instance_id: format!("{service}-{}", self.instance_id),
            address: self.config.server.host.clone(),
            port: self.config.server.port,
            tags: Vec::new(),
            health_url: format!(
                "http://{}:{}/health/live",
                self.config.server.host, self.config.server.port
            ),
            metadata: Default::default(),
        }
    }

    fn instance_id() -> String {
        // Stable across restarts when the environment provides one (set by
        // the deployment); random otherwise.
        std::env::var("STREAMGATE_INSTANCE_ID")
            .unwrap_or_else(|_| Uuid::new_v4().to_string())
    }
}
