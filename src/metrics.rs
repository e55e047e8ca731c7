//! Prometheus metrics for BlockDepot.
//!
//! One process-global recorder (via `metrics-exporter-prometheus`), the
//! metric name constants recorded elsewhere in the crate, an axum
//! middleware for per-request counts and latency, and the `/metrics`
//! rendering handler.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Request count by method, route template and status.
pub const HTTP_REQUESTS_TOTAL: &str = "blockdepot_http_requests_total";

/// Request latency histogram (seconds) by method and route template.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "blockdepot_http_request_duration_seconds";

/// Access grants issued (counter). Labels: kind (`download` or `part`).
pub const GRANTS_ISSUED_TOTAL: &str = "blockdepot_grants_issued_total";

/// Upload session transitions (counter). Labels: outcome (`opened`,
/// `completed`, `aborted`).
pub const UPLOAD_SESSIONS_TOTAL: &str = "blockdepot_upload_sessions_total";

/// Stale upload sessions reclaimed by the background reaper (counter).
pub const UPLOADS_REAPED_TOTAL: &str = "blockdepot_uploads_reaped_total";

// -- Global recorder installation ---------------------------------------------

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the process-wide Prometheus recorder.
///
/// Idempotent: repeated calls (tests share one process) return the
/// handle installed by the first.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    })
}

/// Attach help text to every metric the crate records.  Call once,
/// after [`init_metrics`].
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(GRANTS_ISSUED_TOTAL, "Access grants issued by kind");
    describe_counter!(UPLOAD_SESSIONS_TOTAL, "Upload session transitions");
    describe_counter!(UPLOADS_REAPED_TOTAL, "Stale upload sessions reclaimed");
}

// -- Metrics middleware -------------------------------------------------------

/// Count and time every request, labelled by method, route template and
/// status.  Sits outermost in the layer stack; scraping `/metrics` is
/// not itself counted.
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
    let elapsed = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(elapsed);

    response
}

// -- Path normalization -------------------------------------------------------

/// Collapse a request path to its route template, so keys and upload
/// ids never become label values: `/upload/part/abc123/4` reports as
/// `/upload/part/{upload_id}/{part_number}`, every `/files/stream/...`
/// as `/files/stream/{key}`.
fn normalize_path(path: &str) -> String {
    match path {
        "/" | "/health" | "/metrics" | "/openapi.json" => path.to_string(),
        "/upload/init" | "/upload/get_upload_url" | "/upload/complete" | "/upload/abort"
        | "/upload/manifest" => path.to_string(),
        "/download/url" | "/files/delete" | "/files/copy_resource" | "/files/list" => {
            path.to_string()
        }
        p if p.starts_with("/upload/part/") => "/upload/part/{upload_id}/{part_number}".to_string(),
        p if p.starts_with("/files/stream/") => "/files/stream/{key}".to_string(),
        _ => "/other".to_string(),
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Prometheus exposition text.
///
/// Only routed when metrics are enabled, so the recorder is always
/// installed by the time this runs.
pub async fn metrics_handler() -> impl IntoResponse {
    let handle = PROMETHEUS_HANDLE
        .get()
        .expect("Prometheus recorder not initialized");
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        handle.render(),
    )
}

// -- Tests --------------------------------------------------------------------
