//! Error types for the coordination API.
//!
//! [`ApiError`] is the wire-facing taxonomy: every variant maps to one
//! HTTP status and a stable error code, and the enum implements
//! [`axum::response::IntoResponse`] so handlers can simply return
//! `Err(ApiError::NotFound(..))`.  [`StorageError`] is the adapter-facing
//! taxonomy; it converts into [`ApiError`] at the route boundary.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// Faults raised by storage adapters.
///
/// Expected absences (missing key on `get`, missing source on `copy`,
/// already-deleted key on `delete`) are *values*, not errors; these
/// variants cover genuine faults only.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The key resolves outside the storage root (traversal attempt).
    #[error("key escapes the storage root: {key}")]
    PermissionDenied { key: String },

    /// A conditional write lost: the key's current state does not satisfy
    /// the supplied precondition.
    #[error("precondition failed for {key}")]
    ConditionFailed { key: String },

    /// The upload session does not exist, or was already completed or
    /// aborted.
    #[error("upload {upload_id} does not exist or is already finalized")]
    UploadNotFound { upload_id: String },

    /// The part set listed at completion does not match what was
    /// received (missing part, ETag mismatch, bad ordering).
    #[error("part set mismatch: {message}")]
    PartMismatch { message: String },

    /// Unclassified backend failure (I/O, SDK, serialization).
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Backend(err.into())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Backend(err.into())
    }
}

/// API error taxonomy.  One variant per status code the service emits.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed input: bad resource key, invalid part number, bad body.
    #[error("{0}")]
    Validation(String),

    /// No usable caller identity on a protected route.
    #[error("{0}")]
    Authentication(String),

    /// The caller is authenticated but does not own the resource.
    #[error("{0}")]
    Forbidden(String),

    /// The resource, upload session or grant target does not exist.
    #[error("{0}")]
    NotFound(String),

    /// Optimistic-concurrency conflict or multipart part-set mismatch.
    #[error("{0}")]
    ConditionFailed(String),

    /// Backend fault surfaced to the client without internal detail.
    #[error("storage backend error")]
    Backend(#[from] anyhow::Error),
}

impl ApiError {
    /// Stable error code carried in the JSON body.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "ValidationError",
            ApiError::Authentication(_) => "AuthenticationError",
            ApiError::Forbidden(_) => "ForbiddenError",
            ApiError::NotFound(_) => "NotFoundError",
            ApiError::ConditionFailed(_) => "ConditionFailedError",
            ApiError::Backend(_) => "BackendError",
        }
    }

    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Authentication(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::ConditionFailed(_) => StatusCode::CONFLICT,
            ApiError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::PermissionDenied { key } => {
                ApiError::Forbidden(format!("key is not accessible: {key}"))
            }
            StorageError::ConditionFailed { key } => {
                ApiError::ConditionFailed(format!("concurrent update on {key}"))
            }
            StorageError::UploadNotFound { upload_id } => {
                ApiError::NotFound(format!("upload session {upload_id} not found"))
            }
            StorageError::PartMismatch { message } => {
                ApiError::ConditionFailed(format!("part set mismatch: {message}"))
            }
            StorageError::Backend(err) => ApiError::Backend(err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let request_id = generate_request_id();
        let status = self.status_code();
        let date = httpdate::fmt_http_date(std::time::SystemTime::now());

        // Clients get a stable code and message; backend detail stays in
        // the server log, keyed by request id.
        if let ApiError::Backend(ref err) = self {
            tracing::error!(request_id = %request_id, error = ?err, "backend fault");
        }

        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
                "request_id": request_id,
            }
        });

        (
            status,
            [
                ("x-request-id", request_id),
                ("date", date),
                ("server", "BlockDepot".to_string()),
            ],
            Json(body),
        )
            .into_response()
    }
}
