//! StreamGate process entry point.
//!
//! One binary, two shapes: `--mode monolith` hosts every plugin in a single
//! microkernel; `--mode service --service NAME` hosts exactly one, wired to
//! the broker bus and the external registry. Exit codes: 0 on orderly
//! shutdown, 1 when startup fails or a plugin cannot stop cleanly, 2 on a
//! configuration error.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use streamgate_node::config::NodeConfig;
use streamgate_node::kernel::resources::Resources;
use streamgate_node::kernel::Microkernel;
use streamgate_node::plugins;
use streamgate_node::server;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Every plugin in one process, in-process bus and local registry.
    Monolith,
    /// One plugin per process, broker bus and external registry.
    Service,
}

#[derive(Parser, Debug)]
#[command(name = "streamgate", version, about = "StreamGate video platform node")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Mode::Monolith)]
    mode: Mode,

    /// Service to host in `--mode service` (auth, upload, streaming,
    /// metadata, cache, worker, monitor, transcoder, api-gateway).
    #[arg(long)]
    service: Option<String>,
}

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match NodeConfig::load(cli.config.as_deref()) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            return 2;
        }
    };

    let resources = match cli.mode {
        Mode::Monolith => Resources::monolith(config).await,
        Mode::Service => Resources::microservices(config).await,
    };
    let resources = match resources {
        Ok(resources) => resources,
        Err(e) => {
            tracing::error!(error = %e, "resource wiring failed");
            return 1;
        }
    };

    let kernel = Arc::new(Microkernel::new(resources));
    let registration = match cli.mode {
        Mode::Monolith => plugins::monolith_set()
            .into_iter()
            .try_for_each(|plugin| kernel.register(plugin)),
        Mode::Service => {
            let Some(name) = cli.service.as_deref() else {
                tracing::error!("--mode service requires --service NAME");
                return 2;
            };
            match plugins::service_plugin(name) {
                Some(plugin) => kernel.register(plugin),
                None => {
                    tracing::error!(service = name, "unknown service");
                    return 2;
                }
            }
        }
    };
    if let Err(e) = registration {
        tracing::error!(error = %e, "plugin registration failed");
        return 1;
    }

    if let Err(e) = kernel.start().await {
        tracing::error!(error = %e, "startup failed");
        return 1;
    }

    // Signals trigger one orderly stop sweep; the shutdown token it cancels
    // also ends the server's graceful-shutdown future.
    let stop_failed = Arc::new(AtomicBool::new(false));
    let stopped = Arc::new(AtomicBool::new(false));
    {
        let kernel = kernel.clone();
        let stop_failed = stop_failed.clone();
        let stopped = stopped.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            tracing::info!("shutdown signal received");
            stopped.store(true, Ordering::Release);
            if kernel.stop().await.is_err() {
                stop_failed.store(true, Ordering::Release);
            }
        });
    }

    if let Err(e) = server::serve(kernel.clone()).await {
        tracing::error!(error = %e, "server error");
        let _ = kernel.stop().await;
        return 1;
    }

    // Server exited without a signal (bind loss); make the stop sweep run.
    if !stopped.load(Ordering::Acquire) && kernel.stop().await.is_err() {
        return 1;
    }

    if stop_failed.load(Ordering::Acquire) {
        1
    } else {
        0
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
