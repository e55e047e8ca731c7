//! Append-only manifests for incremental production and consumption.
//!
//! A producer streams chunks into a version scope and appends one
//! descriptor per chunk; a consumer polls the manifest and fetches
//! whatever is listed.  The document lives in the backend itself (at
//! the internal `.manifest.json` name under the version prefix), so the
//! coordinator stays stateless and both backends behave identically.
//!
//! Mutations go through a compare-and-swap loop over the whole
//! document using conditional writes: read with ETag, apply, write back
//! `If-Match` (or `If-Absent` for the first write), retry on conflict
//! with jittered backoff.  No append is ever silently lost.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use utoipa::ToSchema;

use crate::errors::{ApiError, StorageError};
use crate::keys::VersionScope;
use crate::storage::adapter::{SavePrecondition, StorageAdapter};

/// Manifest document name under the version prefix.  Dot-prefixed, so
/// user keys can never collide with it.
pub const MANIFEST_DOC: &str = ".manifest.json";

/// CAS attempts before a conflict surfaces to the caller.
const CAS_MAX_ATTEMPTS: u32 = 8;

/// One produced chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ChunkRef {
    /// Producer-assigned chunk name.
    pub name: String,
    /// Filename segment of the chunk's resource key within the scope.
    pub file_name: String,
}

/// The manifest document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct Manifest {
    /// Ordered chunk descriptors, append-only.
    #[serde(default)]
    pub chunks: Vec<ChunkRef>,
    /// Terminal flag; once set no further appends are accepted.
    #[serde(default)]
    pub completed: bool,
    /// Last mutation time; absent until the first write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>)]
    pub updated_at: Option<DateTime<Utc>>,
}

pub struct ManifestService {
    storage: Arc<dyn StorageAdapter>,
}

impl ManifestService {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        ManifestService { storage }
    }

    fn doc_key(scope: &VersionScope) -> String {
        format!("{}{}", scope.prefix(), MANIFEST_DOC)
    }

    /// Current manifest plus the ETag to condition the next write on.
    async fn load(&self, scope: &VersionScope) -> Result<(Manifest, Option<String>), ApiError> {
        let key = Self::doc_key(scope);
        match self.storage.get(&key).await? {
            Some(obj) => {
                let manifest: Manifest = serde_json::from_slice(&obj.data).map_err(|e| {
                    ApiError::Backend(anyhow::anyhow!("corrupt manifest at {key}: {e}"))
                })?;
                Ok((manifest, Some(obj.etag)))
            }
            None => Ok((Manifest::default(), None)),
        }
    }

    /// Consumer poll: the current manifest, or the empty manifest when
    /// none has been written yet, so polling works from t=0.
    pub async fn fetch(&self, scope: &VersionScope) -> Result<Manifest, ApiError> {
        let (manifest, _) = self.load(scope).await?;
        Ok(manifest)
    }

    /// Apply one mutation -- append a chunk and/or set the terminal
    /// flag -- and return the resulting manifest.
    ///
    /// Appending to a completed manifest is refused with 409.
    /// Re-completing a completed manifest is an idempotent no-op.
    pub async fn update(
        &self,
        scope: &VersionScope,
        new_chunk: Option<ChunkRef>,
        completed: bool,
    ) -> Result<Manifest, ApiError> {
        if let Some(ref chunk) = new_chunk {
            validate_chunk(chunk)?;
        }
        let key = Self::doc_key(scope);

        for attempt in 0..CAS_MAX_ATTEMPTS {
            let (mut manifest, etag) = self.load(scope).await?;

            if manifest.completed {
                if new_chunk.is_some() {
                    return Err(ApiError::ConditionFailed(
                        "manifest is completed; no further chunks are accepted".to_string(),
                    ));
                }
                return Ok(manifest);
            }

            if let Some(chunk) = new_chunk.clone() {
                manifest.chunks.push(chunk);
            }
            if completed {
                manifest.completed = true;
            }
            manifest.updated_at = Some(Utc::now());

            let body = serde_json::to_vec(&manifest)
                .map_err(|e| ApiError::Backend(anyhow::anyhow!("encode manifest: {e}")))?;
            let precondition = match &etag {
                Some(tag) => SavePrecondition::IfMatch(tag.clone()),
                None => SavePrecondition::IfAbsent,
            };

            match self
                .storage
                .save(
                    &key,
                    Bytes::from(body),
                    Some("application/json"),
                    precondition,
                )
                .await
            {
                Ok(_) => return Ok(manifest),
                Err(StorageError::ConditionFailed { .. }) => {
                    debug!("Manifest CAS conflict: key={} attempt={}", key, attempt + 1);
                    backoff_jitter(attempt).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!("Manifest CAS budget exhausted: key={}", key);
        Err(ApiError::ConditionFailed(
            "manifest update contended; retry".to_string(),
        ))
    }
}

fn validate_chunk(chunk: &ChunkRef) -> Result<(), ApiError> {
    if chunk.name.is_empty() {
        return Err(ApiError::Validation("chunk name must be non-empty".to_string()));
    }
    if !crate::keys::valid_segment(&chunk.file_name) {
        return Err(ApiError::Validation(format!(
            "chunk file_name {:?} is not a valid key segment",
            chunk.file_name
        )));
    }
    Ok(())
}

/// Small randomized pause between CAS attempts.
async fn backoff_jitter(attempt: u32) {
    let base = 5u64 << attempt.min(6);
    let jitter = rand::thread_rng().gen_range(0..=base);
    tokio::time::sleep(Duration::from_millis(base + jitter)).await;
}

// -- Tests -------------------------------------------------------------------
