//! Axum router construction.
//!
//! The [`app`] function wires every endpoint to its handler and returns a
//! ready-to-serve [`axum::Router`].

use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::errors::generate_request_id;
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::AppState;

/// Header carrying the request ID in both directions.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Request ID assigned by [`common_headers_middleware`], available to
/// handlers as a request extension.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

// -- OpenAPI document ----------------------------------------------------------

/// OpenAPI documentation for the formstash API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "formstash Upload API",
        version = "0.1.0",
        description = "Multipart upload ingestion with ordered results and storage rollback"
    ),
    paths(health_check, crate::handlers::upload::create_upload),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "Upload", description = "Multipart uploads"),
    )
)]
struct ApiDoc;

/// Build the axum [`Router`].
///
/// `/metrics` is only mounted when metrics are enabled in the config.
pub fn app(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/health", get(health_check))
        .route("/openapi.json", get(openapi_json))
        .route("/uploads", post(crate::handlers::upload::create_upload));
    if state.config.observability.metrics {
        router = router.route("/metrics", get(metrics_handler));
    }

    router
        .with_state(state)
        // Layer ordering: inner layers run first, outer layers wrap them.
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(TraceLayer::new_for_http())
        // metrics_middleware is outermost (captures full request lifecycle).
        .layer(middleware::from_fn(metrics_middleware))
        // Uploads are bounded by the multipart limits, not the body size.
        .layer(DefaultBodyLimit::disable())
}

// -- Common headers middleware -----------------------------------------------

/// Middleware that tags each request with an ID and adds common response
/// headers:
/// - `x-request-id`: the client's own ID if it sent one, else 16 hex chars
/// - `Date`: RFC 7231 formatted timestamp
/// - `Server`: `formstash`
async fn common_headers_middleware(mut req: Request<axum::body::Body>, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(generate_request_id);
    req.extensions_mut().insert(RequestId(request_id.clone()));

    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    if let Ok(value) = HeaderValue::from_str(&date) {
        headers.insert("date", value);
    }
    headers.insert("server", HeaderValue::from_static("formstash"));

    response
}

// -- Infrastructure endpoints ------------------------------------------------

/// `GET /health` -- Liveness check.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    operation_id = "HealthCheck",
    responses(
        (status = 200, description = "Health check OK")
    )
)]
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}

/// `GET /openapi.json` -- OpenAPI document.
async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
