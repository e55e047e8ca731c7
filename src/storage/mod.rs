//! Object storage adapters.
//!
//! The [`adapter::StorageAdapter`] trait abstracts over where bytes
//! physically live and who serves them.  Implementations cover local
//! disk (grant URLs point back at this service) and S3-compatible
//! stores (grant URLs are SDK-presigned, bytes never transit the
//! coordinator).

pub mod adapter;
pub mod local;
pub mod s3;

use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::grants::GrantSigner;

use adapter::StorageAdapter;

/// Build the adapter named by `storage.backend`.
///
/// Every call constructs a fresh adapter from the given configuration;
/// nothing is cached process-wide, so callers can rebuild at will.
/// Unrecognized backend names fall back to local disk.
pub async fn build_adapter(
    config: &Config,
    signer: GrantSigner,
) -> anyhow::Result<Arc<dyn StorageAdapter>> {
    match config.storage.backend.as_str() {
        "s3" => {
            let s3_config = config.storage.s3.as_ref().ok_or_else(|| {
                anyhow::anyhow!("storage.backend is 's3' but storage.s3 config section is missing")
            })?;
            let adapter = s3::S3Adapter::new(
                s3_config.bucket.clone(),
                s3_config.region.clone(),
                s3_config.prefix.clone(),
                non_empty(&s3_config.endpoint_url),
                s3_config.use_path_style,
                non_empty(&s3_config.access_key_id),
                non_empty(&s3_config.secret_access_key),
            )
            .await?;
            info!(
                "S3 storage adapter initialized: bucket={} region={} prefix='{}'",
                s3_config.bucket, s3_config.region, s3_config.prefix
            );
            Ok(Arc::new(adapter))
        }
        "local" | _ => {
            let storage_root = &config.storage.local.root_dir;
            let adapter = local::LocalAdapter::new(storage_root, signer)?;
            info!("Local storage adapter initialized at {}", storage_root);
            Ok(Arc::new(adapter))
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
