//! Error taxonomy for the service fabric.
//!
//! Every failure surfaced by the bus, registry, or RPC pool is one of these
//! kinds. Callers branch on the kind, not on message text: the pipeline maps
//! kinds to HTTP statuses and retry decisions, and the pool uses
//! [`FabricError::is_retryable`] to decide whether another instance is worth
//! trying.

use std::time::Duration;
use thiserror::Error;

/// Failures surfaced by fabric components to their callers.
#[derive(Debug, Error)]
pub enum FabricError {
    /// No healthy instance of the requested service is currently known.
    #[error("no healthy instances of service '{service}'")]
    NoInstances { service: String },

    /// The per-instance circuit breaker refused the call.
    #[error("circuit open for {service}/{instance}")]
    CircuitOpen {
        service: String,
        instance: String,
        /// How long until the breaker will admit a probe.
        retry_after: Duration,
    },

    /// The call did not complete within its deadline.
    #[error("call to {service} timed out after {elapsed:?}")]
    Timeout { service: String, elapsed: Duration },

    /// The transport failed before a response was produced.
    #[error("transport error calling {service}: {message}")]
    Transport { service: String, message: String },

    /// The remote side answered with an application-level error.
    #[error("remote error from {service}: {code}")]
    Remote {
        service: String,
        code: String,
        message: String,
    },

    /// The registry backend rejected or could not serve an operation.
    #[error("registry error: {0}")]
    Registry(String),

    /// The event bus could not publish or subscribe.
    #[error("event bus error: {0}")]
    Bus(String),
}

impl FabricError {
    /// Whether a caller may retry this failure against another instance
    /// within its remaining deadline.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FabricError::Transport { .. } | FabricError::Timeout { .. }
        )
    }

    /// Stable machine-readable code for error bodies and metrics labels.
    pub fn code(&self) -> &'static str {
        match self {
            FabricError::NoInstances { .. } => "no_instances",
            FabricError::CircuitOpen { .. } => "circuit_open",
            FabricError::Timeout { .. } => "timeout",
            FabricError::Transport { .. } => "transport",
            FabricError::Remote { .. } => "remote_error",
            FabricError::Registry(_) => "registry",
            FabricError::Bus(_) => "bus",
        }
    }
}

pub type Result<T> = std::result::Result<T, FabricError>;
