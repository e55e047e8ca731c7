//! Upload session endpoints.
//!
//! `init`, `get_upload_url`, `complete` and `abort` drive the session
//! state machine through the [`UploadCoordinator`]; `put_part` is the
//! grant-authorized staging target that local-backend part URLs point
//! at.  Part bytes enter the service only through `put_part`, and only
//! when the backend is local.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::{ensure_owner, Identity};
use crate::coordinator::upload::UploadCoordinator;
use crate::errors::ApiError;
use crate::keys::ResourceKey;
use crate::storage::adapter::PartSpec;
use crate::AppState;

// -- Request / response bodies ------------------------------------------------

/// Body for `POST /upload/init`.
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct InitUploadRequest {
    /// Full resource key; mutually exclusive with `block_id`.
    #[garde(length(min = 1, max = 1024))]
    pub key: Option<String>,
    /// Block id to mint a fresh versioned key under the caller.
    #[garde(length(min = 1, max = 255))]
    pub block_id: Option<String>,
    /// Filename for minted keys; defaults to `content`.
    #[garde(length(min = 1, max = 255))]
    pub file_name: Option<String>,
    /// MIME type recorded with the finished object.
    #[garde(length(min = 1, max = 255))]
    pub content_type: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct InitUploadResponse {
    /// Resolved resource key the session writes to.
    pub key: String,
    /// Session handle for all later calls.
    pub upload_id: String,
}

/// Body for `POST /upload/get_upload_url`.
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct UploadUrlRequest {
    #[garde(length(min = 1, max = 1024))]
    pub key: String,
    #[garde(length(min = 1, max = 256))]
    pub upload_id: String,
    #[garde(range(min = 1, max = 10_000))]
    pub part_number: i32,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UploadUrlResponse {
    /// URL the client PUTs the part's bytes against.
    pub upload_url: String,
    #[schema(value_type = String)]
    pub expires_at: DateTime<Utc>,
}

/// Grant parameters carried by part-upload URLs.
#[derive(Debug, Deserialize)]
pub struct PartGrantQuery {
    pub key: String,
    pub expires: u64,
    pub signature: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PartUploadedResponse {
    /// ETag of the received part, echoed back at completion.
    pub etag: String,
}

/// Body for `POST /upload/complete`.
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CompleteUploadRequest {
    #[garde(length(min = 1, max = 1024))]
    pub key: String,
    #[garde(length(min = 1, max = 256))]
    pub upload_id: String,
    /// Every uploaded part in ascending order, with the ETags the part
    /// uploads returned.
    #[garde(length(min = 1))]
    pub parts: Vec<PartSpec>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CompleteUploadResponse {
    pub key: String,
    /// Composite ETag of the assembled object.
    pub etag: String,
}

/// Body for `POST /upload/abort`.
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct AbortUploadRequest {
    #[garde(length(min = 1, max = 1024))]
    pub key: String,
    #[garde(length(min = 1, max = 256))]
    pub upload_id: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AbortUploadResponse {
    /// False when the session was already finalized or never existed.
    pub aborted: bool,
}

// -- Handlers -----------------------------------------------------------------

/// `POST /upload/init` -- Open an upload session.
#[utoipa::path(
    post,
    path = "/upload/init",
    tag = "Upload",
    operation_id = "InitUpload",
    request_body = InitUploadRequest,
    responses(
        (status = 200, description = "Session opened", body = InitUploadResponse),
        (status = 400, description = "Invalid key or request shape"),
        (status = 403, description = "Caller does not own the key")
    )
)]
pub async fn init_upload(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Json(request): Json<InitUploadRequest>,
) -> Result<Json<InitUploadResponse>, ApiError> {
    request
        .validate()
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    let key = resolve_target_key(&identity, &request)?;
    ensure_owner(&identity, &key.owner_id)?;

    let session = state
        .uploads
        .init(&key, request.content_type.as_deref())
        .await?;

    Ok(Json(InitUploadResponse {
        key: session.key.to_string(),
        upload_id: session.upload_id,
    }))
}

/// `POST /upload/get_upload_url` -- Issue a part-upload grant.
#[utoipa::path(
    post,
    path = "/upload/get_upload_url",
    tag = "Upload",
    operation_id = "GetUploadUrl",
    request_body = UploadUrlRequest,
    responses(
        (status = 200, description = "Grant issued", body = UploadUrlResponse),
        (status = 403, description = "Caller does not own the key"),
        (status = 404, description = "No such upload session")
    )
)]
pub async fn get_upload_url(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Json(request): Json<UploadUrlRequest>,
) -> Result<Json<UploadUrlResponse>, ApiError> {
    request
        .validate()
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    let key = ResourceKey::parse(&request.key)?;
    ensure_owner(&identity, &key.owner_id)?;

    let grant = state
        .uploads
        .part_url(&key, &request.upload_id, request.part_number)
        .await?;

    Ok(Json(UploadUrlResponse {
        upload_url: grant.url,
        expires_at: grant.expires_at,
    }))
}

/// `PUT /upload/part/{upload_id}/{part_number}` -- Grant-authorized part
/// staging for the local backend.
///
/// No identity runs here: the HMAC grant in the query string is the
/// authorization, and it covers the method, path and target key.
#[utoipa::path(
    put,
    path = "/upload/part/{upload_id}/{part_number}",
    tag = "Upload",
    operation_id = "PutPart",
    request_body = Vec<u8>,
    params(
        ("upload_id" = String, Path, description = "Session handle"),
        ("part_number" = i32, Path, description = "Part number (1-based)"),
        ("key" = String, Query, description = "Target resource key"),
        ("expires" = u64, Query, description = "Grant expiry (unix seconds)"),
        ("signature" = String, Query, description = "Grant HMAC signature")
    ),
    responses(
        (status = 200, description = "Part staged", body = PartUploadedResponse),
        (status = 403, description = "Grant expired or signature mismatch"),
        (status = 404, description = "No such upload session")
    )
)]
pub async fn put_part(
    State(state): State<Arc<AppState>>,
    Path((upload_id, part_number)): Path<(String, String)>,
    Query(grant): Query<PartGrantQuery>,
    body: Bytes,
) -> Result<Json<PartUploadedResponse>, ApiError> {
    let part_number: i32 = part_number
        .parse()
        .map_err(|_| ApiError::Validation("part_number must be an integer".to_string()))?;

    let path = format!("/upload/part/{upload_id}/{part_number}");
    let query = [("key".to_string(), grant.key.clone())];
    state
        .grants
        .verify("PUT", &path, &query, grant.expires, &grant.signature)?;

    let key = ResourceKey::parse(&grant.key)?;
    let etag = state
        .storage
        .put_part(&key.storage_key(), &upload_id, part_number, body)
        .await?;

    Ok(Json(PartUploadedResponse { etag }))
}

/// `POST /upload/complete` -- Commit the session.
#[utoipa::path(
    post,
    path = "/upload/complete",
    tag = "Upload",
    operation_id = "CompleteUpload",
    request_body = CompleteUploadRequest,
    responses(
        (status = 200, description = "Object committed", body = CompleteUploadResponse),
        (status = 403, description = "Caller does not own the key"),
        (status = 404, description = "No such upload session"),
        (status = 409, description = "Claimed part set does not match what was received")
    )
)]
pub async fn complete_upload(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Json(request): Json<CompleteUploadRequest>,
) -> Result<Json<CompleteUploadResponse>, ApiError> {
    request
        .validate()
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    let key = ResourceKey::parse(&request.key)?;
    ensure_owner(&identity, &key.owner_id)?;

    let etag = state
        .uploads
        .complete(&key, &request.upload_id, &request.parts)
        .await?;

    Ok(Json(CompleteUploadResponse {
        key: key.to_string(),
        etag,
    }))
}

/// `POST /upload/abort` -- Abandon the session.
#[utoipa::path(
    post,
    path = "/upload/abort",
    tag = "Upload",
    operation_id = "AbortUpload",
    request_body = AbortUploadRequest,
    responses(
        (status = 200, description = "Abort recorded", body = AbortUploadResponse),
        (status = 403, description = "Caller does not own the key")
    )
)]
pub async fn abort_upload(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Json(request): Json<AbortUploadRequest>,
) -> Result<Json<AbortUploadResponse>, ApiError> {
    request
        .validate()
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    let key = ResourceKey::parse(&request.key)?;
    ensure_owner(&identity, &key.owner_id)?;

    let aborted = state.uploads.abort(&key, &request.upload_id).await?;
    Ok(Json(AbortUploadResponse { aborted }))
}

/// Pick the session's target key: an explicit key and a minted one are
/// mutually exclusive.
fn resolve_target_key(
    identity: &Identity,
    request: &InitUploadRequest,
) -> Result<ResourceKey, ApiError> {
    match (&request.key, &request.block_id) {
        (Some(_), Some(_)) => Err(ApiError::Validation(
            "key and block_id are mutually exclusive".to_string(),
        )),
        (Some(raw), None) => Ok(ResourceKey::parse(raw)?),
        (None, Some(block_id)) => Ok(UploadCoordinator::mint_key(
            &identity.user_id,
            block_id,
            request.file_name.as_deref(),
        )?),
        (None, None) => Err(ApiError::Validation(
            "either key or block_id is required".to_string(),
        )),
    }
}

// -- Unit tests ---------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Identity {
        Identity {
            user_id: "alice".to_string(),
        }
    }

    fn request(key: Option<&str>, block_id: Option<&str>) -> InitUploadRequest {
        InitUploadRequest {
            key: key.map(str::to_string),
            block_id: block_id.map(str::to_string),
            file_name: None,
            content_type: None,
        }
    }

    #[test]
    fn test_resolve_explicit_key() {
        let key =
            resolve_target_key(&identity(), &request(Some("alice/report/v1/data.bin"), None))
                .unwrap();
        assert_eq!(key.to_string(), "alice/report/v1/data.bin");
    }

    #[test]
    fn test_resolve_minted_key() {
        let key = resolve_target_key(&identity(), &request(None, Some("report"))).unwrap();
        assert_eq!(key.owner_id, "alice");
        assert_eq!(key.block_id, "report");
        assert_eq!(key.filename, "content");
    }

    #[test]
    fn test_resolve_requires_exactly_one() {
        assert!(resolve_target_key(&identity(), &request(None, None)).is_err());
        assert!(resolve_target_key(
            &identity(),
            &request(Some("alice/report/v1/data.bin"), Some("report"))
        )
        .is_err());
    }

    #[test]
    fn test_resolve_rejects_malformed_key() {
        let err = resolve_target_key(&identity(), &request(Some("not-a-key"), None)).unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[test]
    fn test_init_request_validation() {
        let bad = InitUploadRequest {
            key: Some(String::new()),
            block_id: None,
            file_name: None,
            content_type: None,
        };
        assert!(bad.validate().is_err());
    }
}
