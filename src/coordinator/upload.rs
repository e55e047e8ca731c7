//! Upload session coordination.
//!
//! Sessions move `Initialized -> PartsPending -> Completed | Aborted`.
//! The coordinator owns key minting, part-set validation, and the
//! ordering of checks; part bytes travel over grant URLs and never
//! through these code paths.  `get` can never observe a
//! partially-uploaded object because only `complete` promotes one.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tracing::{debug, info};
use uuid::Uuid;

use super::AccessGrant;
use crate::errors::ApiError;
use crate::keys::ResourceKey;
use crate::metrics::{GRANTS_ISSUED_TOTAL, UPLOAD_SESSIONS_TOTAL};
use crate::storage::adapter::{PartSpec, StorageAdapter};

/// Largest part number accepted, matching the S3 multipart cap so both
/// backends enforce the same bound.
pub const MAX_PART_NUMBER: i32 = 10_000;

/// Filename used when `init` mints a key from a bare block id.
pub const DEFAULT_FILE_NAME: &str = "content";

/// Result of opening a session: the resolved key plus the handle every
/// later call must present.
#[derive(Debug, Clone)]
pub struct InitiatedUpload {
    pub key: ResourceKey,
    pub upload_id: String,
}

pub struct UploadCoordinator {
    storage: Arc<dyn StorageAdapter>,
    part_url_ttl: Duration,
}

impl UploadCoordinator {
    pub fn new(storage: Arc<dyn StorageAdapter>, part_url_ttl: Duration) -> Self {
        UploadCoordinator {
            storage,
            part_url_ttl,
        }
    }

    /// Mint a fresh key under the caller for a block id: a new v4
    /// version per upload, `content` unless a filename is given.
    pub fn mint_key(
        owner_id: &str,
        block_id: &str,
        file_name: Option<&str>,
    ) -> Result<ResourceKey, ApiError> {
        let version_id = Uuid::new_v4().to_string();
        let file_name = match file_name {
            Some(name) if !name.is_empty() => name,
            _ => DEFAULT_FILE_NAME,
        };
        Ok(ResourceKey::new(owner_id, block_id, &version_id, file_name)?)
    }

    /// Open a new upload session for `key`.
    pub async fn init(
        &self,
        key: &ResourceKey,
        content_type: Option<&str>,
    ) -> Result<InitiatedUpload, ApiError> {
        let upload_id = self
            .storage
            .create_upload(&key.storage_key(), content_type)
            .await?;
        info!("Upload session opened: key={} upload_id={}", key, upload_id);
        counter!(UPLOAD_SESSIONS_TOTAL, "outcome" => "opened").increment(1);
        Ok(InitiatedUpload {
            key: key.clone(),
            upload_id,
        })
    }

    /// Issue a grant for one part of an open session.
    ///
    /// Confirms the session is still live first so a grant is never
    /// minted against a finalized upload.
    pub async fn part_url(
        &self,
        key: &ResourceKey,
        upload_id: &str,
        part_number: i32,
    ) -> Result<AccessGrant, ApiError> {
        validate_part_number(part_number)?;
        let storage_key = key.storage_key();
        self.storage.list_parts(&storage_key, upload_id).await?;
        let url = self
            .storage
            .part_upload_url(&storage_key, upload_id, part_number, self.part_url_ttl)
            .await?;
        debug!(
            "Part grant issued: key={} upload_id={} part={}",
            key, upload_id, part_number
        );
        counter!(GRANTS_ISSUED_TOTAL, "kind" => "part").increment(1);
        Ok(AccessGrant::new(url, self.part_url_ttl))
    }

    /// Commit the session.
    ///
    /// The claimed part list is checked for shape here, then the adapter
    /// re-validates it against what was actually received as the single
    /// consistency checkpoint.  Mismatches leave the session retryable.
    pub async fn complete(
        &self,
        key: &ResourceKey,
        upload_id: &str,
        parts: &[PartSpec],
    ) -> Result<String, ApiError> {
        validate_part_set(parts)?;
        let etag = self
            .storage
            .complete_upload(&key.storage_key(), upload_id, parts)
            .await?;
        info!(
            "Upload completed: key={} upload_id={} parts={} etag={}",
            key,
            upload_id,
            parts.len(),
            etag
        );
        counter!(UPLOAD_SESSIONS_TOTAL, "outcome" => "completed").increment(1);
        Ok(etag)
    }

    /// Abandon the session.  Staged parts become reclaimable by the
    /// background reaper and are never readable.
    pub async fn abort(&self, key: &ResourceKey, upload_id: &str) -> Result<bool, ApiError> {
        let aborted = self
            .storage
            .abort_upload(&key.storage_key(), upload_id)
            .await?;
        if aborted {
            info!("Upload aborted: key={} upload_id={}", key, upload_id);
            counter!(UPLOAD_SESSIONS_TOTAL, "outcome" => "aborted").increment(1);
        } else {
            debug!("Abort for unknown upload session: upload_id={}", upload_id);
        }
        Ok(aborted)
    }
}

fn validate_part_number(part_number: i32) -> Result<(), ApiError> {
    if (1..=MAX_PART_NUMBER).contains(&part_number) {
        Ok(())
    } else {
        Err(ApiError::Validation(format!(
            "part_number must be between 1 and {MAX_PART_NUMBER}"
        )))
    }
}

/// Completion lists must be non-empty, carry real ETags, and ascend
/// strictly; both backends then see the same well-formed request.
fn validate_part_set(parts: &[PartSpec]) -> Result<(), ApiError> {
    if parts.is_empty() {
        return Err(ApiError::Validation(
            "completion requires at least one part".to_string(),
        ));
    }
    for spec in parts {
        validate_part_number(spec.part_number)?;
        if spec.etag.trim_matches('"').is_empty() {
            return Err(ApiError::Validation(format!(
                "part {} has an empty etag",
                spec.part_number
            )));
        }
    }
    for pair in parts.windows(2) {
        if pair[1].part_number <= pair[0].part_number {
            return Err(ApiError::Validation(
                "parts must be listed in strictly ascending part_number order".to_string(),
            ));
        }
    }
    Ok(())
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grants::GrantSigner;
    use crate::storage::local::LocalAdapter;
    use bytes::Bytes;

    fn spec(part_number: i32, etag: &str) -> PartSpec {
        PartSpec {
            part_number,
            etag: etag.to_string(),
        }
    }

    fn test_coordinator() -> (tempfile::TempDir, UploadCoordinator) {
        let dir = tempfile::tempdir().unwrap();
        let signer = GrantSigner::new("test-secret", "http://127.0.0.1:9440");
        let adapter = LocalAdapter::new(dir.path(), signer).unwrap();
        let coordinator = UploadCoordinator::new(Arc::new(adapter), Duration::from_secs(900));
        (dir, coordinator)
    }

    #[test]
    fn test_mint_key_defaults_filename() {
        let key = UploadCoordinator::mint_key("alice", "report", None).unwrap();
        assert_eq!(key.owner_id, "alice");
        assert_eq!(key.block_id, "report");
        assert_eq!(key.filename, "content");
        // The minted version is a real v4 uuid.
        assert!(Uuid::parse_str(&key.version_id).is_ok());
    }

    #[test]
    fn test_mint_key_honors_filename() {
        let key = UploadCoordinator::mint_key("alice", "report", Some("data.bin")).unwrap();
        assert_eq!(key.filename, "data.bin");
        let key = UploadCoordinator::mint_key("alice", "report", Some("")).unwrap();
        assert_eq!(key.filename, "content");
    }

    #[test]
    fn test_mint_key_rejects_bad_block() {
        assert!(UploadCoordinator::mint_key("alice", "../escape", None).is_err());
        assert!(UploadCoordinator::mint_key("alice", "", None).is_err());
    }

    #[test]
    fn test_part_number_bounds() {
        assert!(validate_part_number(1).is_ok());
        assert!(validate_part_number(MAX_PART_NUMBER).is_ok());
        assert!(validate_part_number(0).is_err());
        assert!(validate_part_number(-3).is_err());
        assert!(validate_part_number(MAX_PART_NUMBER + 1).is_err());
    }

    #[test]
    fn test_part_set_shape() {
        assert!(validate_part_set(&[]).is_err());
        assert!(validate_part_set(&[spec(1, "\"aa\""), spec(2, "\"bb\"")]).is_ok());
        // Gaps are allowed; order is not.
        assert!(validate_part_set(&[spec(1, "\"aa\""), spec(5, "\"bb\"")]).is_ok());
        assert!(validate_part_set(&[spec(2, "\"aa\""), spec(1, "\"bb\"")]).is_err());
        assert!(validate_part_set(&[spec(1, "\"aa\""), spec(1, "\"bb\"")]).is_err());
        assert!(validate_part_set(&[spec(1, "\"\"")]).is_err());
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let (_dir, coordinator) = test_coordinator();
        let key = ResourceKey::parse("alice/report/v1/data.bin").unwrap();

        let session = coordinator.init(&key, Some("application/octet-stream")).await.unwrap();
        assert_eq!(session.key, key);

        let grant = coordinator.part_url(&key, &session.upload_id, 1).await.unwrap();
        assert!(grant.url.contains(&session.upload_id));
        assert!(grant.expires_at > chrono::Utc::now());

        let etag = coordinator
            .storage
            .put_part(&key.storage_key(), &session.upload_id, 1, Bytes::from("hello"))
            .await
            .unwrap();

        let final_etag = coordinator
            .complete(&key, &session.upload_id, &[spec(1, &etag)])
            .await
            .unwrap();
        assert!(final_etag.ends_with("-1\""));
    }

    #[tokio::test]
    async fn test_no_grant_after_abort() {
        let (_dir, coordinator) = test_coordinator();
        let key = ResourceKey::parse("alice/report/v1/data.bin").unwrap();
        let session = coordinator.init(&key, None).await.unwrap();

        assert!(coordinator.abort(&key, &session.upload_id).await.unwrap());

        let err = coordinator
            .part_url(&key, &session.upload_id, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_abort_unknown_session_is_false() {
        let (_dir, coordinator) = test_coordinator();
        let key = ResourceKey::parse("alice/report/v1/data.bin").unwrap();
        assert!(!coordinator.abort(&key, "no-such-upload").await.unwrap());
    }

    #[tokio::test]
    async fn test_complete_rejects_unordered_parts() {
        let (_dir, coordinator) = test_coordinator();
        let key = ResourceKey::parse("alice/report/v1/data.bin").unwrap();
        let session = coordinator.init(&key, None).await.unwrap();

        let err = coordinator
            .complete(&key, &session.upload_id, &[spec(2, "\"aa\""), spec(1, "\"bb\"")])
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }
}
