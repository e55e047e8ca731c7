//! Caller identity resolution and the ownership gate.
//!
//! Identity *verification* lives outside this service.  Requests arrive
//! carrying either:
//! - a trusted-proxy `X-User-Id` header set by an upstream gateway, or
//! - an `Authorization: Bearer <jwt>` token whose HS256 signature is
//!   checked against the shared `auth.jwt_secret`; the subject claim
//!   becomes the caller's user id.
//!
//! A relaxed dev mode (`auth.allow_anonymous`) substitutes
//! `auth.default_user_id` when no credential is supplied.  Handlers then
//! pass the resolved [`Identity`] through the ownership gate before any
//! backend call.

use std::sync::Arc;

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tracing::debug;

use crate::errors::ApiError;
use crate::AppState;

// ── Identity ────────────────────────────────────────────────────────

/// The authenticated caller.
///
/// Extracted per-request; grant-authorized endpoints (`/upload/part/…`,
/// `/files/stream/…`) do not use it and verify the HMAC grant instead.
#[derive(Debug, Clone)]
pub struct Identity {
    /// Verified user id; the owner segment of every key this caller may write.
    pub user_id: String,
}

/// Claims read from a bearer token.  Expiry is enforced by
/// `jsonwebtoken`'s default validation; the subject is the user id.
#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for Identity {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let auth = &state.config.auth;

        // Trusted-proxy path: the upstream gateway already verified the user.
        if auth.trust_proxy_header {
            if let Some(value) = parts.headers.get("x-user-id") {
                let user_id = value
                    .to_str()
                    .map_err(|_| {
                        ApiError::Authentication("malformed X-User-Id header".to_string())
                    })?
                    .trim();
                if user_id.is_empty() {
                    return Err(ApiError::Authentication(
                        "empty X-User-Id header".to_string(),
                    ));
                }
                return Ok(Identity {
                    user_id: user_id.to_string(),
                });
            }
        }

        // Bearer token path.
        if let Some(value) = parts.headers.get("authorization") {
            let header = value.to_str().map_err(|_| {
                ApiError::Authentication("malformed Authorization header".to_string())
            })?;
            let token = header.strip_prefix("Bearer ").ok_or_else(|| {
                ApiError::Authentication("Authorization header is not a bearer token".to_string())
            })?;
            if auth.jwt_secret.is_empty() {
                // A credential we cannot verify is rejected, never ignored.
                return Err(ApiError::Authentication(
                    "bearer tokens are not accepted: no jwt secret configured".to_string(),
                ));
            }
            let data = decode::<Claims>(
                token,
                &DecodingKey::from_secret(auth.jwt_secret.as_bytes()),
                &Validation::new(Algorithm::HS256),
            )
            .map_err(|e| {
                debug!("Bearer token rejected: {}", e);
                ApiError::Authentication("invalid bearer token".to_string())
            })?;
            return Ok(Identity {
                user_id: data.claims.sub,
            });
        }

        if auth.allow_anonymous {
            return Ok(Identity {
                user_id: auth.default_user_id.clone(),
            });
        }

        Err(ApiError::Authentication(
            "no credentials provided".to_string(),
        ))
    }
}

// ── Ownership gate ──────────────────────────────────────────────────

/// Require that the caller owns the resource.
///
/// Used for uploads, deletes, manifest writes, and copy targets.
pub fn ensure_owner(identity: &Identity, owner_id: &str) -> Result<(), ApiError> {
    if identity.user_id == owner_id {
        Ok(())
    } else {
        Err(ApiError::Forbidden(format!(
            "resource owner '{owner_id}' does not match caller"
        )))
    }
}

/// Require that the caller may read the resource: the owner, or any
/// authenticated caller for keys in the shared namespace.
///
/// Used for downloads, manifest reads, copy sources, and listing.
pub fn ensure_readable(
    identity: &Identity,
    owner_id: &str,
    shared_prefix: &str,
) -> Result<(), ApiError> {
    if identity.user_id == owner_id
        || (!shared_prefix.is_empty() && owner_id.starts_with(shared_prefix))
    {
        Ok(())
    } else {
        Err(ApiError::Forbidden(format!(
            "resource owner '{owner_id}' does not match caller"
        )))
    }
}

// ── Tests ───────────────────────────────────────────────────────────
