//! Manifest endpoints.
//!
//! A manifest is the append-only chunk ledger of one
//! `(owner, block, version)` scope.  Writes go through the
//! [`ManifestService`] CAS loop; reads are plain fetches and are open to
//! the shared namespace.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use garde::Validate;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::{ensure_owner, ensure_readable, Identity};
use crate::coordinator::manifest::{ChunkRef, Manifest};
use crate::errors::ApiError;
use crate::keys::VersionScope;
use crate::AppState;

// -- Request / response bodies ------------------------------------------------

/// Body for `PUT /upload/manifest`.
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct ManifestUpdateRequest {
    #[garde(length(min = 1, max = 255))]
    pub owner_id: String,
    #[garde(length(min = 1, max = 255))]
    pub block_id: String,
    #[garde(length(min = 1, max = 255))]
    pub version_id: String,
    /// Chunk to append, if any.
    #[garde(skip)]
    pub new_chunk: Option<ChunkRef>,
    /// Set to close the manifest; omitting it leaves the flag alone.
    #[garde(skip)]
    pub completed: Option<bool>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ManifestUpdateResponse {
    pub manifest: Manifest,
}

/// Query for `GET /upload/manifest`.
#[derive(Debug, Deserialize)]
pub struct ManifestQuery {
    pub owner_id: String,
    pub block_id: String,
    pub version_id: String,
}

// -- Handlers -----------------------------------------------------------------

/// `PUT /upload/manifest` -- Append a chunk and/or close the manifest.
#[utoipa::path(
    put,
    path = "/upload/manifest",
    tag = "Manifest",
    operation_id = "UpdateManifest",
    request_body = ManifestUpdateRequest,
    responses(
        (status = 200, description = "Updated manifest", body = ManifestUpdateResponse),
        (status = 400, description = "Invalid scope or chunk"),
        (status = 403, description = "Caller does not own the scope"),
        (status = 409, description = "Manifest already completed, or update contended")
    )
)]
pub async fn update_manifest(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Json(request): Json<ManifestUpdateRequest>,
) -> Result<Json<ManifestUpdateResponse>, ApiError> {
    request
        .validate()
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    let scope = VersionScope::new(&request.owner_id, &request.block_id, &request.version_id)?;
    ensure_owner(&identity, &scope.owner_id)?;

    let manifest = state
        .manifests
        .update(&scope, request.new_chunk, request.completed.unwrap_or(false))
        .await?;

    Ok(Json(ManifestUpdateResponse { manifest }))
}

/// `GET /upload/manifest` -- Fetch a scope's manifest.
///
/// Absent manifests read as empty, so polling a scope that has not been
/// written yet is not an error.
#[utoipa::path(
    get,
    path = "/upload/manifest",
    tag = "Manifest",
    operation_id = "GetManifest",
    params(
        ("owner_id" = String, Query, description = "Owner segment"),
        ("block_id" = String, Query, description = "Block segment"),
        ("version_id" = String, Query, description = "Version segment")
    ),
    responses(
        (status = 200, description = "Manifest contents", body = Manifest),
        (status = 400, description = "Invalid scope"),
        (status = 403, description = "Scope is neither owned nor shared")
    )
)]
pub async fn get_manifest(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Query(query): Query<ManifestQuery>,
) -> Result<Json<Manifest>, ApiError> {
    let scope = VersionScope::new(&query.owner_id, &query.block_id, &query.version_id)?;
    ensure_readable(
        &identity,
        &scope.owner_id,
        &state.config.auth.shared_namespace_prefix,
    )?;

    let manifest = state.manifests.fetch(&scope).await?;
    Ok(Json(manifest))
}
