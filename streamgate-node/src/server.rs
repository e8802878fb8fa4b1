//! # HTTP Server Assembly
//!
//! Builds the axum router for one process after the microkernel has
//! started: every endpoint in the dispatch table becomes a route through
//! its service's pipeline, alongside the operational surface (`/health*`,
//! `/metrics`, `/admin/*`) and the `/rpc/{service}/{method}` route peers
//! call through the RPC pool.
//!
//! Each inbound request gets a fresh request id (echoed as
//! `x-request-id`) and a cancellation token parented to the process
//! shutdown token, so an orderly stop trips every in-flight handler.

use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, on, post, MethodFilter};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::error::ServiceError;
use crate::kernel::resources::{BoundEndpoint, Resources};
use crate::kernel::Microkernel;
use crate::pipeline::ApiRequest;
use crate::plugins::gateway::{reply_for, RpcEnvelope};

const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub kernel: Arc<Microkernel>,
    pub resources: Arc<Resources>,
}

/// Build the full router. Call after `kernel.start()` so the endpoint
/// table is populated.
pub fn build_router(kernel: Arc<Microkernel>) -> Router {
    let resources = kernel.resources();
    let state = AppState {
        kernel,
        resources: resources.clone(),
    };

    let mut router: Router<AppState> = Router::new()
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .route("/health", get(health_full))
        .route("/metrics", get(metrics_scrape))
        .route("/admin/plugins", get(admin_plugins))
        .route("/admin/cache/stats", get(admin_cache_stats))
        .route("/admin/breakers", get(admin_breakers))
        .route("/rpc/{service}/{method}", post(rpc_dispatch));

    for bound in resources.endpoints.all() {
        let Some(filter) = method_filter(&bound.endpoint.spec.method) else {
            tracing::warn!(
                endpoint = %bound.endpoint.spec.name,
                method = %bound.endpoint.spec.method,
                "unsupported method, endpoint not routed"
            );
            continue;
        };
        let path = bound.endpoint.spec.path.clone();
        let state = state.clone();
        let bound = bound.clone();
        router = router.route(
            &path,
            on(filter, move |req: Request| {
                let state = state.clone();
                let bound = bound.clone();
                async move { serve_endpoint(state, bound, req).await }
            }),
        );
    }

    // Transport-level ceiling sits above the pipeline's per-endpoint
    // timeouts so a wedged handler cannot hold the connection forever.
    let transport_timeout = resources.config.server.request_timeout + Duration::from_secs(5);
    router
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(TimeoutLayer::new(transport_timeout)),
        )
        .with_state(state)
}

/// Bind and serve until the shutdown token fires.
pub async fn serve(kernel: Arc<Microkernel>) -> anyhow::Result<()> {
    let resources = kernel.resources();
    let addr = format!(
        "{}:{}",
        resources.config.server.host, resources.config.server.port
    );
    let router = build_router(kernel);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "http server listening");
    let shutdown = resources.shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

fn method_filter(method: &str) -> Option<MethodFilter> {
    match method {
        "GET" => Some(MethodFilter::GET),
        "POST" => Some(MethodFilter::POST),
        "PUT" => Some(MethodFilter::PUT),
        "PATCH" => Some(MethodFilter::PATCH),
        "DELETE" => Some(MethodFilter::DELETE),
        _ => None,
    }
}

/// Decode the transport request into an [`ApiRequest`] and run it through
/// the owning service's pipeline.
async fn serve_endpoint(state: AppState, bound: Arc<BoundEndpoint>, req: Request) -> Response {
    use tracing::Instrument;

    let request_id = Uuid::new_v4();
    let span = tracing::info_span!(
        "request",
        id = %request_id,
        service = %bound.service,
        endpoint = %bound.endpoint.spec.name,
    );
    let api_req = match decode_request(&state, request_id, req).await {
        Ok(api_req) => api_req,
        Err(err) => return with_request_id(err.into_response(), request_id),
    };
    let pipeline = state.resources.pipeline(&bound.service);
    let response = match pipeline
        .execute(&bound.endpoint, api_req)
        .instrument(span)
        .await
    {
        Ok(response) => {
            let status =
                StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(response.body)).into_response()
        }
        Err(err) => err.into_response(),
    };
    with_request_id(response, request_id)
}

async fn decode_request(
    state: &AppState,
    request_id: Uuid,
    req: Request,
) -> Result<ApiRequest, ServiceError> {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let query = parse_query(req.uri().query());
    let headers = req.headers().clone();

    let bytes = axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|e| ServiceError::invalid_input(format!("unreadable body: {e}")))?;
    let body: Option<Value> = if bytes.is_empty() {
        None
    } else {
        Some(
            serde_json::from_slice(&bytes)
                .map_err(|e| ServiceError::invalid_input(format!("malformed JSON body: {e}")))?,
        )
    };

    let mut api_req = ApiRequest::new(method, path);
    api_req.id = request_id;
    api_req.query = query;
    api_req.body = body;
    api_req.client_ip = client_ip(&headers);
    api_req.api_key = header_string(&headers, "x-api-key");
    api_req.wallet = header_string(&headers, "x-wallet");
    api_req.cancel = state.resources.shutdown.child_token();
    Ok(api_req)
}

fn parse_query(raw: Option<&str>) -> BTreeMap<String, String> {
    let mut query = BTreeMap::new();
    let Some(raw) = raw else {
        return query;
    };
    for pair in raw.split('&') {
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((key, value)) => query.insert(key.to_string(), value.to_string()),
            None => query.insert(pair.to_string(), String::new()),
        };
    }
    query
}

fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

fn with_request_id(mut response: Response, request_id: Uuid) -> Response {
    if let Ok(value) = request_id.to_string().parse() {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Inter-service RPC serving: peers post an envelope; the target endpoint
/// runs through its own pipeline and the reply preserves the inner status.
async fn rpc_dispatch(
    State(state): State<AppState>,
    axum::extract::Path((service, method)): axum::extract::Path<(String, String)>,
    body: axum::body::Bytes,
) -> Response {
    let request_id = Uuid::new_v4();
    let envelope: RpcEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            return with_request_id(
                ServiceError::invalid_input(format!("malformed rpc envelope: {e}"))
                    .into_response(),
                request_id,
            )
        }
    };
    let Some(bound) = state.resources.endpoints.get(&service, &method) else {
        return with_request_id(
            ServiceError::NotFound {
                resource: format!("rpc method {service}/{method}"),
            }
            .into_response(),
            request_id,
        );
    };

    let mut api_req = envelope.into_request(state.resources.shutdown.child_token());
    api_req.id = request_id;
    let pipeline = state.resources.pipeline(&service);
    let outcome = pipeline.execute(&bound.endpoint, api_req).await;
    let (status, body) = reply_for(outcome);
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    with_request_id((status, Json(body)).into_response(), request_id)
}

async fn health_live(State(state): State<AppState>) -> Response {
    let _ = state.resources.health.live();
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
        .into_response()
}

/// 503 iff not ready, per the ingress contract.
async fn health_ready(State(state): State<AppState>) -> Response {
    let ready = state.resources.health.ready().await;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "ready": ready,
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
        .into_response()
}

async fn health_full(State(state): State<AppState>) -> Response {
    let report = state.resources.health.aggregate().await;
    (StatusCode::OK, Json(json!(report))).into_response()
}

async fn metrics_scrape(State(state): State<AppState>) -> Response {
    let text = state.resources.metrics.scrape_text();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        text,
    )
        .into_response()
}

async fn admin_plugins(State(state): State<AppState>) -> Response {
    let plugins: Vec<Value> = state
        .kernel
        .plugin_states()
        .into_iter()
        .map(|(descriptor, phase)| json!({"descriptor": descriptor, "phase": phase}))
        .collect();
    (StatusCode::OK, Json(json!({"plugins": plugins}))).into_response()
}

async fn admin_cache_stats(State(state): State<AppState>) -> Response {
    (StatusCode::OK, Json(json!(state.resources.cache.stats()))).into_response()
}

async fn admin_breakers(State(state): State<AppState>) -> Response {
    let breakers: Vec<Value> = state
        .resources
        .rpc
        .breaker_snapshots()
        .await
        .into_iter()
        .map(|(service, instance, snapshot)| {
            json!({"service": service, "instance": instance, "breaker": snapshot})
        })
        .collect();
    (StatusCode::OK, Json(json!({"breakers": breakers}))).into_response()
}
