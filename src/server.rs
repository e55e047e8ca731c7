//! Axum router construction.
//!
//! [`app`] wires every coordination endpoint to its handler; the result
//! goes straight into `axum::serve`.
//!
//! Grant-redeeming routes (`/upload/part/...`, `/files/stream/...`) carry
//! their authorization in the URL and therefore declare no [`Identity`]
//! extractor; every other data route does.
//!
//! [`Identity`]: crate::auth::Identity

use axum::{
    extract::{DefaultBodyLimit, State},
    http::{HeaderValue, Request},
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::{OpenApi, ToSchema};

use crate::errors::generate_request_id;
use crate::handlers::{files, manifest, upload};
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::AppState;

// -- OpenAPI specification ----------------------------------------------------

/// OpenAPI documentation for the BlockDepot coordination API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "BlockDepot Coordination API",
        version = "0.1.0",
        description = "Control plane for owner-scoped object storage: issues access grants, sequences multipart uploads, maintains version manifests"
    ),
    paths(
        // Health check
        health_check,
        // Upload session operations
        crate::handlers::upload::init_upload,
        crate::handlers::upload::get_upload_url,
        crate::handlers::upload::put_part,
        crate::handlers::upload::complete_upload,
        crate::handlers::upload::abort_upload,
        // Manifest operations
        crate::handlers::manifest::update_manifest,
        crate::handlers::manifest::get_manifest,
        // File access operations
        crate::handlers::files::download_url,
        crate::handlers::files::stream_file,
        crate::handlers::files::delete_file,
        crate::handlers::files::copy_resource,
        crate::handlers::files::list_files,
    ),
    components(schemas(
        crate::handlers::upload::InitUploadRequest,
        crate::handlers::upload::InitUploadResponse,
        crate::handlers::upload::UploadUrlRequest,
        crate::handlers::upload::UploadUrlResponse,
        crate::handlers::upload::PartUploadedResponse,
        crate::handlers::upload::CompleteUploadRequest,
        crate::handlers::upload::CompleteUploadResponse,
        crate::handlers::upload::AbortUploadRequest,
        crate::handlers::upload::AbortUploadResponse,
        crate::handlers::manifest::ManifestUpdateRequest,
        crate::handlers::manifest::ManifestUpdateResponse,
        crate::coordinator::manifest::Manifest,
        crate::coordinator::manifest::ChunkRef,
        crate::handlers::files::DownloadUrlResponse,
        crate::handlers::files::DeleteFileRequest,
        crate::handlers::files::DeleteFileResponse,
        crate::handlers::files::CopyResourceRequest,
        crate::handlers::files::CopyResourceResponse,
        crate::handlers::files::ListFilesResponse,
        crate::storage::adapter::ListEntry,
        crate::storage::adapter::PartSpec,
        HealthResponse,
    )),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "Upload", description = "Upload session operations"),
        (name = "Manifest", description = "Version manifest operations"),
        (name = "Files", description = "File access operations"),
    )
)]
struct ApiDoc;

/// Build the axum [`Router`] with all coordination routes.
pub fn app(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        // Health check endpoint.
        .route("/health", get(health_check))
        // OpenAPI document.
        .route("/openapi.json", get(openapi_spec))
        // Upload session routes.
        .route("/upload/init", post(upload::init_upload))
        .route("/upload/get_upload_url", post(upload::get_upload_url))
        .route(
            "/upload/part/:upload_id/:part_number",
            put(upload::put_part),
        )
        .route("/upload/complete", post(upload::complete_upload))
        .route("/upload/abort", post(upload::abort_upload))
        // Manifest routes share one path across methods.
        .route(
            "/upload/manifest",
            put(manifest::update_manifest).get(manifest::get_manifest),
        )
        // File access routes.
        .route("/download/url", get(files::download_url))
        .route("/files/stream/*key", get(files::stream_file))
        .route("/files/delete", delete(files::delete_file))
        .route("/files/copy_resource", post(files::copy_resource))
        .route("/files/list", get(files::list_files));

    // Prometheus metrics endpoint; its handler requires the recorder,
    // which is only installed when metrics are enabled.
    if state.config.observability.metrics {
        router = router.route("/metrics", get(metrics_handler));
    }

    router
        .with_state(state)
        // Layers run innermost-first: headers, then tracing and CORS,
        // with metrics outermost so it times the whole stack.
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(metrics_middleware))
        // Part uploads can exceed axum's default 2MB body cap.
        .layer(DefaultBodyLimit::disable())
}

// -- Common headers middleware -----------------------------------------------

/// Tower middleware that adds common response headers to every response:
/// - `x-request-id`: 16-character uppercase hex string
/// - `Date`: RFC 7231 formatted timestamp
/// - `Server`: `BlockDepot`
async fn common_headers_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    // Only set x-request-id if not already present (error responses carry
    // their own, matching the id in the body).
    if !headers.contains_key("x-request-id") {
        let request_id = generate_request_id();
        if let Ok(val) = HeaderValue::from_str(&request_id) {
            headers.insert("x-request-id", val);
        }
    }

    // Always overwrite Date and Server to ensure consistency.
    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    if let Ok(val) = HeaderValue::from_str(&date) {
        headers.insert("date", val);
    }
    headers.insert("server", HeaderValue::from_static("BlockDepot"));

    response
}

// -- Health check ------------------------------------------------------------

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// `ok`, or `degraded` when the backend is unreachable.
    pub status: String,
    /// Active backend kind (`local` or `s3`).
    pub backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// `GET /health` -- Liveness plus backend reachability.
///
/// Always 200: the service itself is up; backend trouble surfaces as
/// `degraded` so probes keep routing while operators get the signal.
/// The backend ping can be disabled by config, leaving a shallow probe.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    operation_id = "HealthCheck",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse)
    )
)]
async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    if !state.config.observability.health_check {
        return Json(HealthResponse {
            status: "ok".to_string(),
            backend: state.config.storage.backend.clone(),
            detail: None,
        });
    }
    let ping = state.storage.ping().await;
    let status = if ping.ok { "ok" } else { "degraded" };
    Json(HealthResponse {
        status: status.to_string(),
        backend: ping.backend,
        detail: ping.detail,
    })
}

// -- OpenAPI endpoint --------------------------------------------------------

/// `GET /openapi.json` -- Serve the OpenAPI document.
async fn openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
