//! Prometheus metrics for the LFS gateway.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides an axum middleware for HTTP RED
//! metrics, and exposes the `/metrics` endpoint handler.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "lfs_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "lfs_http_request_duration_seconds";

/// Outbound backend calls (counter). Labels: outcome (success, failure, rejected).
pub const BACKEND_CALLS_TOTAL: &str = "lfs_backend_calls_total";

/// Calls skipped because the circuit breaker was open (counter).
pub const BREAKER_REJECTIONS_TOTAL: &str = "lfs_breaker_rejections_total";

/// Connections currently open on the tracked listener (gauge).
pub const CONNECTIONS_ACTIVE: &str = "lfs_connections_active";

// -- Global recorder installation ---------------------------------------------

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent; returns the
/// handle, or an error when another recorder is already installed.
pub fn init_metrics() -> anyhow::Result<&'static PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle);
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle))
}

/// Register metric descriptions with the global recorder.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(BACKEND_CALLS_TOTAL, "Outbound backend calls by outcome");
    describe_counter!(
        BREAKER_REJECTIONS_TOTAL,
        "Backend calls skipped by the circuit breaker"
    );
    describe_gauge!(CONNECTIONS_ACTIVE, "Open client connections");
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// Excludes `/metrics` from self-instrumentation.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

// -- Path normalization -------------------------------------------------------

/// Normalize a request path to a route template for metric labels.
///
/// - `/health` -> `/health`
/// - `/alice/repo/objects` -> `/{user}/{repo}/objects`
/// - `/alice/repo/objects/<oid>` -> `/{user}/{repo}/objects/{oid}`
/// - anything else -> `/other`
fn normalize_path(path: &str) -> String {
    if path == "/health" || path == "/metrics" {
        return path.to_string();
    }
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    match segments.as_slice() {
        [_, _, "objects"] => "/{user}/{repo}/objects".to_string(),
        [_, _, "objects", _] => "/{user}/{repo}/objects/{oid}".to_string(),
        _ => "/other".to_string(),
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> Response {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

// -- Tests --------------------------------------------------------------------
