//! Abstract storage adapter trait.
//!
//! Every backend implements [`StorageAdapter`].  The trait works in
//! terms of flat storage-key strings (the resource-key model lives a
//! layer above) and encodes expected absences as values: a missing key
//! on `get` is `Ok(None)`, a missing copy source is `Ok(false)`,
//! deleting an absent key is `Ok(false)`.  Faults are
//! [`StorageError`]s.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::errors::StorageError;

/// Result alias used throughout the storage layer.
pub type StorageResult<T> = Result<T, StorageError>;

/// Write-time precondition for [`StorageAdapter::save`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SavePrecondition {
    /// Unconditional create-or-replace.
    None,
    /// Succeed only if the key does not exist yet.
    IfAbsent,
    /// Succeed only if the key's current ETag equals the given one.
    IfMatch(String),
}

/// A stored object's bytes plus its descriptive metadata.
#[derive(Debug, Clone)]
pub struct StoredObject {
    /// Raw bytes of the object.
    pub data: Bytes,
    /// Content type recorded at write time, when known.
    pub content_type: Option<String>,
    /// Quoted hex MD5 ETag (`"<md5>-<n>"` for multipart-assembled objects).
    pub etag: String,
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time, when the backend reports one.
    pub last_modified: Option<DateTime<Utc>>,
}

/// One entry of a `list` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ListEntry {
    /// A concrete object key.
    Key { key: String },
    /// A group of keys collapsed at the delimiter.
    CommonPrefix { prefix: String },
}

/// A part the backend has actually received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartInfo {
    pub part_number: i32,
    pub etag: String,
    pub size: u64,
}

/// A part the caller claims to have uploaded, presented at completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PartSpec {
    pub part_number: i32,
    pub etag: String,
}

/// Backend reachability report.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PingStatus {
    /// Backend kind (`local` or `s3`).
    pub backend: String,
    /// Whether the backend answered.
    pub ok: bool,
    /// Failure detail when `ok` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Async storage contract shared by the local and S3 backends.
pub trait StorageAdapter: std::fmt::Debug + Send + Sync + 'static {
    /// Write `data` to `key`, subject to `precondition`, returning the
    /// new ETag.  A failed precondition raises
    /// [`StorageError::ConditionFailed`].
    fn save(
        &self,
        key: &str,
        data: Bytes,
        content_type: Option<&str>,
        precondition: SavePrecondition,
    ) -> Pin<Box<dyn Future<Output = StorageResult<String>> + Send + '_>>;

    /// Read the full object at `key`; `Ok(None)` when absent.
    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<Option<StoredObject>>> + Send + '_>>;

    /// Check whether an object exists at `key`.
    fn exists(&self, key: &str) -> Pin<Box<dyn Future<Output = StorageResult<bool>> + Send + '_>>;

    /// Delete the object at `key`.  Idempotent: returns `Ok(false)` when
    /// the key was already absent.
    fn delete(&self, key: &str) -> Pin<Box<dyn Future<Output = StorageResult<bool>> + Send + '_>>;

    /// List keys under `prefix`.  With a delimiter, keys sharing a
    /// segment collapse into one [`ListEntry::CommonPrefix`]; entries
    /// come back sorted and deduplicated.
    fn list(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
    ) -> Pin<Box<dyn Future<Output = StorageResult<Vec<ListEntry>>> + Send + '_>>;

    /// Copy `source_key` to `target_key` without routing bytes through
    /// the caller.  Returns `Ok(false)` when the source is absent.
    fn copy(
        &self,
        source_key: &str,
        target_key: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<bool>> + Send + '_>>;

    /// Probe backend reachability.  Never fails; trouble is reported in
    /// the returned status.
    fn ping(&self) -> Pin<Box<dyn Future<Output = PingStatus> + Send + '_>>;

    /// Issue a time-boxed URL from which the object at `key` can be
    /// fetched directly.
    fn download_url(
        &self,
        key: &str,
        expires_in: Duration,
    ) -> Pin<Box<dyn Future<Output = StorageResult<String>> + Send + '_>>;

    /// Open a multipart upload session targeting `key`, returning the
    /// opaque upload id.
    fn create_upload(
        &self,
        key: &str,
        content_type: Option<&str>,
    ) -> Pin<Box<dyn Future<Output = StorageResult<String>> + Send + '_>>;

    /// Issue a time-boxed URL to which `part_number` can be PUT
    /// directly.
    fn part_upload_url(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        expires_in: Duration,
    ) -> Pin<Box<dyn Future<Output = StorageResult<String>> + Send + '_>>;

    /// Store one part's bytes, returning the part ETag.  Backs the
    /// staging endpoint the local adapter's part URLs point at.
    fn put_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = StorageResult<String>> + Send + '_>>;

    /// Parts received so far.  Raises [`StorageError::UploadNotFound`]
    /// for unknown or finalized sessions.
    fn list_parts(
        &self,
        key: &str,
        upload_id: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<Vec<PartInfo>>> + Send + '_>>;

    /// Validate the claimed part set against what was received and, on
    /// success, atomically commit the assembled object, returning its
    /// ETag.  A mismatch raises [`StorageError::PartMismatch`] and
    /// leaves the session open.
    fn complete_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[PartSpec],
    ) -> Pin<Box<dyn Future<Output = StorageResult<String>> + Send + '_>>;

    /// Abandon a session.  Returns `Ok(false)` for unknown sessions;
    /// staged data becomes reclaimable, never readable.
    fn abort_upload(
        &self,
        key: &str,
        upload_id: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<bool>> + Send + '_>>;

    /// Reclaim aborted sessions and sessions older than `older_than`,
    /// returning how many were removed.
    fn reap_stale_uploads(
        &self,
        older_than: Duration,
    ) -> Pin<Box<dyn Future<Output = StorageResult<u64>> + Send + '_>>;
}
