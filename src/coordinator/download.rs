//! Download grant issuance.
//!
//! The only read path the coordinator offers: validate, gate, confirm
//! the object exists, then hand out a time-boxed URL.  Bytes flow from
//! the backend (or the local streaming endpoint) directly to the client.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tracing::debug;

use super::AccessGrant;
use crate::errors::ApiError;
use crate::keys::ResourceKey;
use crate::metrics::GRANTS_ISSUED_TOTAL;
use crate::storage::adapter::StorageAdapter;

pub struct DownloadCoordinator {
    storage: Arc<dyn StorageAdapter>,
    url_ttl: Duration,
}

impl DownloadCoordinator {
    pub fn new(storage: Arc<dyn StorageAdapter>, url_ttl: Duration) -> Self {
        DownloadCoordinator { storage, url_ttl }
    }

    /// Issue a read grant for an existing object.
    ///
    /// The ownership gate has already run; existence is enforced here so
    /// the caller learns 404 now, not from a failed transfer later.
    pub async fn grant(&self, key: &ResourceKey) -> Result<AccessGrant, ApiError> {
        let storage_key = key.storage_key();
        if !self.storage.exists(&storage_key).await? {
            debug!("Download grant refused, no such object: {}", key);
            return Err(ApiError::NotFound(format!("no object at key '{key}'")));
        }
        let url = self
            .storage
            .download_url(&storage_key, self.url_ttl)
            .await?;
        counter!(GRANTS_ISSUED_TOTAL, "kind" => "download").increment(1);
        Ok(AccessGrant::new(url, self.url_ttl))
    }
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grants::GrantSigner;
    use crate::storage::adapter::SavePrecondition;
    use crate::storage::local::LocalAdapter;
    use bytes::Bytes;

    fn test_coordinator() -> (tempfile::TempDir, Arc<LocalAdapter>, DownloadCoordinator) {
        let dir = tempfile::tempdir().unwrap();
        let signer = GrantSigner::new("test-secret", "http://127.0.0.1:9440");
        let adapter = Arc::new(LocalAdapter::new(dir.path(), signer).unwrap());
        let coordinator = DownloadCoordinator::new(adapter.clone(), Duration::from_secs(300));
        (dir, adapter, coordinator)
    }

    #[tokio::test]
    async fn test_grant_for_existing_object() {
        let (_dir, adapter, coordinator) = test_coordinator();
        let key = ResourceKey::parse("alice/report/v1/data.bin").unwrap();
        adapter
            .save(
                &key.storage_key(),
                Bytes::from("payload"),
                None,
                SavePrecondition::None,
            )
            .await
            .unwrap();

        let grant = coordinator.grant(&key).await.unwrap();
        assert!(grant.url.contains("/files/stream/alice/report/v1/data.bin"));
        assert!(grant.url.contains("signature="));
        assert!(grant.expires_at > chrono::Utc::now());
    }

    #[tokio::test]
    async fn test_grant_for_absent_object_is_not_found() {
        let (_dir, _adapter, coordinator) = test_coordinator();
        let key = ResourceKey::parse("alice/report/v1/data.bin").unwrap();
        let err = coordinator.grant(&key).await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }
}
