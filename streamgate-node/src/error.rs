//! # Service Error Types
//!
//! The error taxonomy every endpoint and plugin shares. Each kind carries a
//! fixed HTTP status, a stable machine-readable code for the JSON error
//! body, and the audit result it maps to. The pipeline's outermost layer is
//! the only place errors are translated into responses; inner layers pass
//! kinds upward unmodified.
//!
//! User-visible bodies follow `{"error": {"code", "message", "details?"}}`
//! and never contain stack traces or secret material.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use std::time::Duration;
use streamgate_fabric::FabricError;
use thiserror::Error;

use crate::audit::AuditResult;

/// Failures surfaced by handlers, plugins, and the pipeline.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Schema or format violation in the request.
    #[error("invalid input: {message}")]
    InvalidInput {
        message: String,
        details: Option<Value>,
    },

    /// Authentication failed or was missing.
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    /// Authenticated but not allowed.
    #[error("forbidden: {message}")]
    Forbidden { message: String },

    /// Admission control denied the request.
    #[error("rate limited")]
    RateLimited { retry_after: Duration },

    /// The addressed resource does not exist.
    #[error("not found: {resource}")]
    NotFound { resource: String },

    /// Idempotency or version clash.
    #[error("conflict: {message}")]
    Conflict { message: String },

    /// A downstream dependency failed transiently.
    #[error("upstream failure: {message}")]
    Upstream { message: String },

    /// The RPC pool refused the call with an open breaker.
    #[error("circuit open for {service}")]
    CircuitOpen {
        service: String,
        retry_after: Duration,
    },

    /// A deadline elapsed.
    #[error("timed out")]
    Timeout,

    /// Unexpected defect. Full detail is logged, not returned.
    #[error("internal error: {message}")]
    Internal { message: String },

    /// Plugin dependency graph contains a cycle. Boot-time only.
    #[error("dependency cycle involving plugin '{plugin}'")]
    DependencyCycle { plugin: String },

    /// A metric series was observed with conflicting kinds. Boot/first-use.
    #[error("metric kind mismatch for '{series}'")]
    KindMismatch { series: String },

    /// A plugin failed to initialize or start.
    #[error("startup failure in plugin '{plugin}': {message}")]
    StartupFailure { plugin: String, message: String },
}

impl ServiceError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        ServiceError::InvalidInput {
            message: message.into(),
            details: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ServiceError::Internal {
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::InvalidInput { .. } => StatusCode::BAD_REQUEST,
            ServiceError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            ServiceError::Forbidden { .. } => StatusCode::FORBIDDEN,
            ServiceError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ServiceError::NotFound { .. } => StatusCode::NOT_FOUND,
            ServiceError::Conflict { .. } => StatusCode::CONFLICT,
            ServiceError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            ServiceError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ServiceError::Internal { .. }
            | ServiceError::DependencyCycle { .. }
            | ServiceError::KindMismatch { .. }
            | ServiceError::StartupFailure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable code for error bodies and the `outcome` metric label.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::InvalidInput { .. } => "invalid_input",
            ServiceError::Unauthorized { .. } => "unauthorized",
            ServiceError::Forbidden { .. } => "forbidden",
            ServiceError::RateLimited { .. } => "rate_limited",
            ServiceError::NotFound { .. } => "not_found",
            ServiceError::Conflict { .. } => "conflict",
            ServiceError::Upstream { .. } => "upstream",
            ServiceError::CircuitOpen { .. } => "circuit_open",
            ServiceError::Timeout => "timeout",
            ServiceError::Internal { .. } => "internal",
            ServiceError::DependencyCycle { .. } => "dependency_cycle",
            ServiceError::KindMismatch { .. } => "kind_mismatch",
            ServiceError::StartupFailure { .. } => "startup_failure",
        }
    }

    /// The audit result this outcome is recorded as.
    pub fn audit_result(&self) -> AuditResult {
        match self {
            ServiceError::RateLimited { .. } => AuditResult::RateLimited,
            ServiceError::InvalidInput { .. }
            | ServiceError::Unauthorized { .. }
            | ServiceError::Forbidden { .. } => AuditResult::Denied,
            _ => AuditResult::Error,
        }
    }

    /// Whether an idempotent endpoint may retry this failure within its
    /// remaining deadline.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServiceError::Upstream { .. } | ServiceError::Timeout)
    }

    /// Seconds for the `Retry-After` header, where applicable.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            ServiceError::RateLimited { retry_after }
            | ServiceError::CircuitOpen { retry_after, .. } => {
                Some(retry_after.as_secs_f64().ceil().max(1.0) as u64)
            }
            _ => None,
        }
    }

    /// The JSON error body. Internal kinds get a generic message; the real
    /// detail stays in the logs.
    pub fn body(&self) -> Value {
        let message = match self {
            ServiceError::Internal { .. } => "internal error".to_string(),
            ServiceError::StartupFailure { .. } => "service unavailable".to_string(),
            other => other.to_string(),
        };
        let mut error = json!({
            "code": self.code(),
            "message": message,
        });
        if let ServiceError::InvalidInput {
            details: Some(details),
            ..
        } = self
        {
            error["details"] = details.clone();
        }
        json!({ "error": error })
    }
}

impl From<FabricError> for ServiceError {
    fn from(err: FabricError) -> Self {
        match err {
            FabricError::NoInstances { service } => ServiceError::Upstream {
                message: format!("no healthy instances of {service}"),
            },
            FabricError::CircuitOpen {
                service,
                retry_after,
                ..
            } => ServiceError::CircuitOpen {
                service,
                retry_after,
            },
            FabricError::Timeout { .. } => ServiceError::Upstream {
                message: err.to_string(),
            },
            FabricError::Transport { .. } | FabricError::Registry(_) | FabricError::Bus(_) => {
                ServiceError::Upstream {
                    message: err.to_string(),
                }
            }
            FabricError::Remote { code, message, .. } => match code.as_str() {
                "not_found" => ServiceError::NotFound { resource: message },
                "invalid_input" => ServiceError::InvalidInput {
                    message,
                    details: None,
                },
                "unauthorized" => ServiceError::Unauthorized { message },
                "forbidden" => ServiceError::Forbidden { message },
                "conflict" => ServiceError::Conflict { message },
                _ => ServiceError::Upstream {
                    message: format!("remote {code}: {message}"),
                },
            },
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        if matches!(self, ServiceError::Internal { .. }) {
            tracing::error!(error = %self, "internal error surfaced to client");
        }
        let status = self.status();
        let mut response = (status, Json(self.body())).into_response();
        if let Some(seconds) = self.retry_after() {
            if let Ok(value) = seconds.to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
