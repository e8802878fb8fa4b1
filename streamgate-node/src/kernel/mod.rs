//! # Microkernel
//!
//! Hosts the plugin set for one process. Registration is only open before
//! start. Startup computes the dependency DAG (cycles are refused before
//! anything initializes), runs `init` then `start` in topological order, and
//! rolls back already-started plugins in reverse order if anything fails.
//! Shutdown stops plugins in reverse order under a shared drain deadline; a
//! plugin that overruns is abandoned, logged, and reported so the process
//! can exit nonzero.
//!
//! The same kernel runs the monolith (all plugins in one process) and a
//! single-service process; the difference is which plugins are registered
//! and which [`Resources`] wiring they receive.

pub mod plugin;
pub mod resources;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Result, ServiceError};
use crate::health::{FnProbe, ProbeResult};
use plugin::{Plugin, PluginContext, PluginDescriptor, PluginPhase};
use resources::Resources;

const RATE_BUCKET_SWEEP: Duration = Duration::from_secs(60);

struct Entry {
    plugin: Arc<dyn Plugin>,
    descriptor: PluginDescriptor,
    phase: Mutex<PluginPhase>,
}

impl Entry {
    fn set_phase(&self, phase: PluginPhase) {
        *self.phase.lock().expect("phase lock poisoned") = phase;
    }

    fn phase(&self) -> PluginPhase {
        *self.phase.lock().expect("phase lock poisoned")
    }
}

pub struct Microkernel {
    resources: Arc<Resources>,
    entries: Mutex<Vec<Arc<Entry>>>,
    started: AtomicBool,
}

impl Microkernel {
    pub fn new(resources: Arc<Resources>) -> Self {
        Self {
            resources,
            entries: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn resources(&self) -> Arc<Resources> {
        self.resources.clone()
    }

    /// Register a plugin. Rejected once the kernel has started and on
    /// duplicate names.
    pub fn register(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        if self.started.load(Ordering::Acquire) {
            return Err(ServiceError::StartupFailure {
                plugin: plugin.descriptor().name,
                message: "registration after start".to_string(),
            });
        }
        let descriptor = plugin.descriptor();
        let mut entries = self.entries.lock().expect("entries lock poisoned");
        if entries.iter().any(|e| e.descriptor.name == descriptor.name) {
            return Err(ServiceError::Conflict {
                message: format!("plugin '{}' already registered", descriptor.name),
            });
        }
        tracing::debug!(plugin = %descriptor.name, "plugin registered");
        entries.push(Arc::new(Entry {
            plugin,
            descriptor,
            phase: Mutex::new(PluginPhase::Registered),
        }));
        Ok(())
    }

    /// Initialize and start every registered plugin in dependency order.
    /// On failure, everything already started is stopped in reverse order
    /// before the error is returned.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ServiceError::Conflict {
                message: "kernel already started".to_string(),
            });
        }

        let ordered = self.topological_order()?;

        for entry in &ordered {
            let ctx = PluginContext {
                resources: self.resources.clone(),
                namespace: entry.descriptor.name.clone(),
                shutdown: self.resources.shutdown.child_token(),
            };
            if let Err(e) = entry.plugin.init(ctx).await {
                entry.set_phase(PluginPhase::Failed);
                tracing::error!(plugin = %entry.descriptor.name, error = %e, "plugin init failed");
                return Err(ServiceError::StartupFailure {
                    plugin: entry.descriptor.name.clone(),
                    message: e.to_string(),
                });
            }
            entry.set_phase(PluginPhase::Initialized);
            tracing::debug!(plugin = %entry.descriptor.name, "plugin initialized");
        }

        let mut running: Vec<Arc<Entry>> = Vec::new();
        for entry in &ordered {
            match entry.plugin.start().await {
                Ok(()) => {
                    entry.set_phase(PluginPhase::Started);
                    tracing::info!(plugin = %entry.descriptor.name, "plugin started");
                    running.push(entry.clone());
                }
                Err(e) => {
                    entry.set_phase(PluginPhase::Failed);
                    tracing::error!(plugin = %entry.descriptor.name, error = %e, "plugin start failed, rolling back");
                    self.stop_entries(&running).await;
                    return Err(ServiceError::StartupFailure {
                        plugin: entry.descriptor.name.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        for entry in &ordered {
            self.register_health_probe(entry);
        }
        self.spawn_maintenance();
        self.resources.health.set_started(true);
        tracing::info!(plugins = ordered.len(), "microkernel started");
        Ok(())
    }

    /// Orderly shutdown: reverse dependency order under the configured drain
    /// deadline. Returns an error naming the plugins that failed to stop
    /// cleanly; the process still exits, nonzero.
    pub async fn stop(&self) -> Result<()> {
        if !self.started.load(Ordering::Acquire) {
            return Ok(());
        }
        self.resources.health.set_started(false);
        self.resources.shutdown.cancel();

        let ordered = match self.topological_order() {
            Ok(ordered) => ordered,
            // Ordering was validated at start; fall back to registration
            // order if the set somehow changed.
            Err(_) => self.entries.lock().expect("entries lock poisoned").clone(),
        };
        let to_stop: Vec<Arc<Entry>> = ordered
            .into_iter()
            .filter(|e| e.phase() == PluginPhase::Started)
            .collect();

        let failed = self.stop_with_deadline(&to_stop).await;
        if failed.is_empty() {
            tracing::info!("microkernel stopped cleanly");
            Ok(())
        } else {
            Err(ServiceError::internal(format!(
                "plugins failed to stop cleanly: {}",
                failed.join(", ")
            )))
        }
    }

    /// Current descriptor and phase per plugin, for the admin surface.
    pub fn plugin_states(&self) -> Vec<(PluginDescriptor, PluginPhase)> {
        let entries = self.entries.lock().expect("entries lock poisoned");
        entries
            .iter()
            .map(|e| (e.descriptor.clone(), e.phase()))
            .collect()
    }

    /// Kahn's algorithm over declared dependencies. `a` before `b` whenever
    /// `b` depends on `a`. Unknown dependencies and cycles abort startup
    /// before anything initializes.
    fn topological_order(&self) -> Result<Vec<Arc<Entry>>> {
        let entries = self.entries.lock().expect("entries lock poisoned").clone();
        let index: HashMap<&str, usize> = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.descriptor.name.as_str(), i))
            .collect();

        let mut in_degree = vec![0usize; entries.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); entries.len()];
        for (i, entry) in entries.iter().enumerate() {
            for dep in &entry.descriptor.dependencies {
                let Some(&dep_index) = index.get(dep.as_str()) else {
                    return Err(ServiceError::StartupFailure {
                        plugin: entry.descriptor.name.clone(),
                        message: format!("unknown dependency '{dep}'"),
                    });
                };
                dependents[dep_index].push(i);
                in_degree[i] += 1;
            }
        }

        let mut queue: VecDeque<usize> = (0..entries.len()).filter(|i| in_degree[*i] == 0).collect();
        let mut ordered = Vec::with_capacity(entries.len());
        while let Some(i) = queue.pop_front() {
            ordered.push(entries[i].clone());
            for &dependent in &dependents[i] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if ordered.len() != entries.len() {
            let stuck = entries
                .iter()
                .enumerate()
                .find(|(i, _)| in_degree[*i] > 0)
                .map(|(_, e)| e.descriptor.name.clone())
                .unwrap_or_default();
            return Err(ServiceError::DependencyCycle { plugin: stuck });
        }
        Ok(ordered)
    }

    /// Reverse-order stop sharing one drain budget. Each plugin gets what
    /// remains of the budget; an overrun abandons that plugin and moves on.
    async fn stop_with_deadline(&self, started: &[Arc<Entry>]) -> Vec<String> {
        let deadline = self.resources.config.kernel.stop_drain_deadline;
        let begun = Instant::now();
        let mut failed = Vec::new();

        for entry in started.iter().rev() {
            // A stuck plugin exhausts the shared budget; later plugins still
            // get a short grace so one offender cannot block the sweep.
            let remaining = deadline
                .saturating_sub(begun.elapsed())
                .max(Duration::from_millis(100));
            match tokio::time::timeout(remaining, entry.plugin.stop()).await {
                Ok(Ok(())) => {
                    entry.set_phase(PluginPhase::Stopped);
                    tracing::info!(plugin = %entry.descriptor.name, "plugin stopped");
                }
                Ok(Err(e)) => {
                    entry.set_phase(PluginPhase::Failed);
                    tracing::error!(plugin = %entry.descriptor.name, error = %e, "plugin stop failed");
                    failed.push(entry.descriptor.name.clone());
                }
                Err(_) => {
                    entry.set_phase(PluginPhase::Failed);
                    tracing::error!(
                        plugin = %entry.descriptor.name,
                        ?deadline,
                        "plugin exceeded drain deadline, abandoning"
                    );
                    failed.push(entry.descriptor.name.clone());
                }
            }
        }
        failed
    }

    /// Rollback helper for failed startups; best effort, bounded.
    async fn stop_entries(&self, started: &[Arc<Entry>]) {
        let _ = self.stop_with_deadline(started).await;
    }

    fn register_health_probe(&self, entry: &Arc<Entry>) {
        let plugin = entry.plugin.clone();
        let name = entry.descriptor.name.clone();
        self.resources.health.register_probe(
            format!("plugin:{name}"),
            true,
            Arc::new(FnProbe(move || {
                let plugin = plugin.clone();
                async move {
                    let health = plugin.health().await;
                    if health.live && health.ready {
                        ProbeResult::healthy("ready")
                    } else if let Some(deep) = health.deep {
                        deep
                    } else {
                        ProbeResult::unhealthy("not ready")
                    }
                }
            })),
        );
    }

    /// Periodic housekeeping owned by the kernel so components stay free of
    /// their own timer tasks.
    fn spawn_maintenance(&self) {
        let limiter = self.resources.rate_limiter.clone();
        let cancel = self.resources.shutdown.child_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RATE_BUCKET_SWEEP);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => limiter.evict_idle(),
                }
            }
        });
    }
}
