//! Prometheus metrics for formstash.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides a Tower-compatible middleware for
//! HTTP RED metrics, and exposes the `/metrics` endpoint handler.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "formstash_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "formstash_http_request_duration_seconds";

/// Finished upload sessions (counter). Labels: outcome.
pub const UPLOAD_SESSIONS_TOTAL: &str = "formstash_upload_sessions_total";

/// Upload session duration from first event to final result, rollback
/// included (histogram). Labels: outcome.
pub const UPLOAD_SESSION_DURATION_SECONDS: &str = "formstash_upload_session_duration_seconds";

/// Files committed by upload sessions (counter).
pub const FILES_STORED_TOTAL: &str = "formstash_files_stored_total";

/// Bytes of committed files (counter).
pub const FILES_STORED_BYTES_TOTAL: &str = "formstash_files_stored_bytes_total";

/// Rollback deletions (counter). Labels: status.
pub const ROLLBACK_DELETES_TOTAL: &str = "formstash_rollback_deletes_total";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent -- safe to call
/// multiple times (e.g. in tests). Returns a reference to the global handle.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    })
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(UPLOAD_SESSIONS_TOTAL, "Upload sessions by outcome");
    describe_histogram!(
        UPLOAD_SESSION_DURATION_SECONDS,
        "Upload session duration in seconds, rollback included"
    );
    describe_counter!(FILES_STORED_TOTAL, "Files stored by upload sessions");
    describe_counter!(FILES_STORED_BYTES_TOTAL, "Bytes of files stored by upload sessions");
    describe_counter!(ROLLBACK_DELETES_TOTAL, "Rollback deletions by status");
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// Excludes `/metrics` from self-instrumentation to avoid feedback loops.
/// Must be the outermost layer so it captures the full request lifecycle.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

// -- Path normalization -------------------------------------------------------

/// Map a request path to a bounded set of metric labels.
///
/// Known routes keep their path; anything else collapses to `/{other}`.
fn normalize_path(path: &str) -> String {
    match path {
        "/" | "/health" | "/uploads" | "/openapi.json" | "/metrics" => path.to_string(),
        _ => "/{other}".to_string(),
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> impl IntoResponse {
    let Some(handle) = PROMETHEUS_HANDLE.get() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            [("content-type", "text/plain; version=0.0.4")],
            String::new(),
        );
    };
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        handle.render(),
    )
}

// -- Tests --------------------------------------------------------------------
