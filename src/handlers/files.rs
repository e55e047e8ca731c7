//! File access endpoints.
//!
//! `download_url` issues grants, `stream` redeems them (local backend),
//! and `delete` / `copy_resource` / `list` operate on committed objects.
//! Copy runs entirely inside the backend; object bytes cross this
//! service only on `stream`.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;

use crate::auth::{ensure_owner, ensure_readable, Identity};
use crate::errors::ApiError;
use crate::keys::{valid_segment, ResourceKey};
use crate::storage::adapter::ListEntry;
use crate::AppState;

// -- Request / response bodies ------------------------------------------------

/// Query for `GET /download/url`.
#[derive(Debug, Deserialize)]
pub struct DownloadUrlQuery {
    pub key: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DownloadUrlResponse {
    /// URL the bytes can be fetched from directly.
    pub download_url: String,
    #[schema(value_type = String)]
    pub expires_at: DateTime<Utc>,
}

/// Grant parameters carried by download URLs.
#[derive(Debug, Deserialize)]
pub struct StreamGrantQuery {
    pub expires: u64,
    pub signature: String,
}

/// Body for `DELETE /files/delete`.
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct DeleteFileRequest {
    #[garde(length(min = 1, max = 1024))]
    pub resource_key: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DeleteFileResponse {
    pub deleted: bool,
}

/// Body for `POST /files/copy_resource`.
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CopyResourceRequest {
    #[garde(length(min = 1, max = 1024))]
    pub source_key: String,
    #[garde(length(min = 1, max = 1024))]
    pub target_key: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CopyResourceResponse {
    pub success: bool,
    pub target_key: String,
}

/// Query for `GET /files/list`.
#[derive(Debug, Deserialize)]
pub struct ListFilesQuery {
    pub prefix: String,
    pub delimiter: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ListFilesResponse {
    pub entries: Vec<ListEntry>,
}

// -- Handlers -----------------------------------------------------------------

/// `GET /download/url` -- Issue a download grant for a committed object.
#[utoipa::path(
    get,
    path = "/download/url",
    tag = "Files",
    operation_id = "GetDownloadUrl",
    params(
        ("key" = String, Query, description = "Resource key to read")
    ),
    responses(
        (status = 200, description = "Grant issued", body = DownloadUrlResponse),
        (status = 403, description = "Key is neither owned nor shared"),
        (status = 404, description = "No object at the key")
    )
)]
pub async fn download_url(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Query(query): Query<DownloadUrlQuery>,
) -> Result<Json<DownloadUrlResponse>, ApiError> {
    let key = ResourceKey::parse(&query.key)?;
    ensure_readable(
        &identity,
        &key.owner_id,
        &state.config.auth.shared_namespace_prefix,
    )?;

    let grant = state.downloads.grant(&key).await?;
    Ok(Json(DownloadUrlResponse {
        download_url: grant.url,
        expires_at: grant.expires_at,
    }))
}

/// `GET /files/stream/{key}` -- Redeem a download grant.
///
/// The HMAC grant in the query string is the authorization; no identity
/// runs here.  Only the local backend routes download URLs at this
/// endpoint.
#[utoipa::path(
    get,
    path = "/files/stream/{key}",
    tag = "Files",
    operation_id = "StreamFile",
    params(
        ("key" = String, Path, description = "Resource key"),
        ("expires" = u64, Query, description = "Grant expiry (unix seconds)"),
        ("signature" = String, Query, description = "Grant HMAC signature")
    ),
    responses(
        (status = 200, description = "Object bytes"),
        (status = 403, description = "Grant expired or signature mismatch"),
        (status = 404, description = "No object at the key")
    )
)]
pub async fn stream_file(
    State(state): State<Arc<AppState>>,
    Path(raw_key): Path<String>,
    Query(grant): Query<StreamGrantQuery>,
) -> Result<Response, ApiError> {
    let path = format!("/files/stream/{raw_key}");
    state
        .grants
        .verify("GET", &path, &[], grant.expires, &grant.signature)?;

    let key = ResourceKey::parse(&raw_key)?;
    let stored = state
        .storage
        .get(&key.storage_key())
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no object at key '{key}'")))?;

    let mut response = (StatusCode::OK, stored.data).into_response();
    let hdrs = response.headers_mut();
    let content_type = stored
        .content_type
        .as_deref()
        .unwrap_or("application/octet-stream");
    hdrs.insert(
        "content-type",
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    if let Ok(val) = HeaderValue::from_str(&stored.etag) {
        hdrs.insert("etag", val);
    }
    if let Some(modified) = stored.last_modified {
        let formatted = httpdate::fmt_http_date(std::time::SystemTime::from(modified));
        if let Ok(val) = HeaderValue::from_str(&formatted) {
            hdrs.insert("last-modified", val);
        }
    }
    Ok(response)
}

/// `DELETE /files/delete` -- Delete a committed object.
#[utoipa::path(
    delete,
    path = "/files/delete",
    tag = "Files",
    operation_id = "DeleteFile",
    request_body = DeleteFileRequest,
    responses(
        (status = 200, description = "Object deleted", body = DeleteFileResponse),
        (status = 403, description = "Caller does not own the key"),
        (status = 404, description = "No object at the key")
    )
)]
pub async fn delete_file(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Json(request): Json<DeleteFileRequest>,
) -> Result<Json<DeleteFileResponse>, ApiError> {
    request
        .validate()
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    let key = ResourceKey::parse(&request.resource_key)?;
    ensure_owner(&identity, &key.owner_id)?;

    let deleted = state.storage.delete(&key.storage_key()).await?;
    if !deleted {
        return Err(ApiError::NotFound(format!("no object at key '{key}'")));
    }
    info!("Object deleted: key={}", key);
    Ok(Json(DeleteFileResponse { deleted: true }))
}

/// `POST /files/copy_resource` -- Server-side copy between keys.
///
/// The source may live in the shared namespace; the target must belong
/// to the caller.  A vanished source surfaces as a backend fault, not a
/// 404, because the grant to read it was already checked.
#[utoipa::path(
    post,
    path = "/files/copy_resource",
    tag = "Files",
    operation_id = "CopyResource",
    request_body = CopyResourceRequest,
    responses(
        (status = 200, description = "Copy committed", body = CopyResourceResponse),
        (status = 403, description = "Source not readable or target not owned"),
        (status = 500, description = "Source missing or backend fault")
    )
)]
pub async fn copy_resource(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Json(request): Json<CopyResourceRequest>,
) -> Result<Json<CopyResourceResponse>, ApiError> {
    request
        .validate()
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    let source = ResourceKey::parse(&request.source_key)?;
    let target = ResourceKey::parse(&request.target_key)?;
    ensure_readable(
        &identity,
        &source.owner_id,
        &state.config.auth.shared_namespace_prefix,
    )?;
    ensure_owner(&identity, &target.owner_id)?;

    let copied = state
        .storage
        .copy(&source.storage_key(), &target.storage_key())
        .await?;
    if !copied {
        return Err(ApiError::Backend(anyhow::anyhow!(
            "copy source '{source}' does not exist"
        )));
    }
    info!("Object copied: source={} target={}", source, target);
    Ok(Json(CopyResourceResponse {
        success: true,
        target_key: target.to_string(),
    }))
}

/// `GET /files/list` -- List keys under a prefix.
#[utoipa::path(
    get,
    path = "/files/list",
    tag = "Files",
    operation_id = "ListFiles",
    params(
        ("prefix" = String, Query, description = "Key prefix; the leading segment names the owner"),
        ("delimiter" = Option<String>, Query, description = "Collapse keys at this delimiter")
    ),
    responses(
        (status = 200, description = "Matching entries", body = ListFilesResponse),
        (status = 400, description = "Prefix does not name an owner"),
        (status = 403, description = "Prefix is neither owned nor shared")
    )
)]
pub async fn list_files(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Query(query): Query<ListFilesQuery>,
) -> Result<Json<ListFilesResponse>, ApiError> {
    let prefix = effective_prefix(&query.prefix)?;
    let owner = prefix.split('/').next().unwrap_or_default();
    ensure_readable(
        &identity,
        owner,
        &state.config.auth.shared_namespace_prefix,
    )?;

    let mut entries = state
        .storage
        .list(&prefix, query.delimiter.as_deref())
        .await?;
    entries.retain(visible_entry);
    Ok(Json(ListFilesResponse { entries }))
}

/// Coordinator-internal documents (dot-named leaves, like version
/// manifests) are not addressable resource keys and stay out of
/// listings.
fn visible_entry(entry: &ListEntry) -> bool {
    match entry {
        ListEntry::Key { key } => !key.rsplit('/').next().unwrap_or_default().starts_with('.'),
        ListEntry::CommonPrefix { .. } => true,
    }
}

/// Pin the listing prefix to an owner boundary.
///
/// A bare owner id is extended with `/` so that `ali` can never match
/// into `alice/...`; prefixes containing a slash already carry a
/// complete owner segment.
fn effective_prefix(raw: &str) -> Result<String, ApiError> {
    let owner = raw.split('/').next().unwrap_or_default();
    if !valid_segment(owner) {
        return Err(ApiError::Validation(
            "prefix must begin with an owner segment".to_string(),
        ));
    }
    if raw.contains('/') {
        Ok(raw.to_string())
    } else {
        Ok(format!("{raw}/"))
    }
}

// -- Unit tests ---------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_owner_prefix_is_pinned() {
        assert_eq!(effective_prefix("alice").unwrap(), "alice/");
        assert_eq!(effective_prefix("ali").unwrap(), "ali/");
    }

    #[test]
    fn test_slashed_prefix_passes_through() {
        assert_eq!(effective_prefix("alice/report").unwrap(), "alice/report");
        assert_eq!(
            effective_prefix("alice/report/v1/").unwrap(),
            "alice/report/v1/"
        );
    }

    #[test]
    fn test_prefix_requires_owner_segment() {
        assert!(effective_prefix("").is_err());
        assert!(effective_prefix("/report").is_err());
        assert!(effective_prefix(".hidden/x").is_err());
    }

    #[test]
    fn test_internal_documents_are_hidden() {
        assert!(visible_entry(&ListEntry::Key {
            key: "alice/report/v1/data.bin".to_string(),
        }));
        assert!(!visible_entry(&ListEntry::Key {
            key: "alice/report/v1/.manifest.json".to_string(),
        }));
        assert!(visible_entry(&ListEntry::CommonPrefix {
            prefix: "alice/report/v1/".to_string(),
        }));
    }
}
