//! Local filesystem storage adapter.
//!
//! Objects are stored as flat files under a configurable root directory,
//! with the storage key used directly as a relative path.  Dot-prefixed
//! directories under the root are service-internal: `.tmp` (atomic-write
//! staging), `.multipart` (upload parts), `.uploads` (session
//! documents), `.meta` (content-type sidecars).
//!
//! All writes follow crash-only design: write to temp file, fsync,
//! rename.  Transfer grants are URLs pointing back at this service,
//! signed by the injected [`GrantSigner`].

use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::future::Future;

use super::adapter::{
    ListEntry, PartInfo, PartSpec, PingStatus, SavePrecondition, StorageAdapter, StorageResult,
    StoredObject,
};
use crate::errors::StorageError;
use crate::grants::GrantSigner;

/// Persisted upload-session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum SessionState {
    Initialized,
    PartsPending,
    Aborted,
}

/// Session document stored at `.uploads/{upload_id}.json`.
///
/// Completion deletes the document; abort flips the state and leaves
/// reclamation to [`StorageAdapter::reap_stale_uploads`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionDoc {
    key: String,
    content_type: Option<String>,
    state: SessionState,
    created_at: DateTime<Utc>,
}

/// Content-type sidecar stored at `.meta/{key}.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetaDoc {
    content_type: String,
}

/// Stores objects on the local filesystem.
#[derive(Debug)]
pub struct LocalAdapter {
    /// Root directory for all stored data.
    root: PathBuf,
    /// Signs part-upload and stream URLs.
    signer: GrantSigner,
    /// Serializes the read-compare-rename window of conditional saves.
    cas_lock: Mutex<()>,
}

impl LocalAdapter {
    /// Create a new `LocalAdapter` rooted at `root`.
    ///
    /// The root and its internal directories are created if missing.
    pub fn new(root: impl Into<PathBuf>, signer: GrantSigner) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        for internal in [".tmp", ".multipart", ".uploads", ".meta"] {
            std::fs::create_dir_all(root.join(internal))?;
        }
        Ok(Self {
            root,
            signer,
            cas_lock: Mutex::new(()),
        })
    }

    /// Resolve a storage key to a path under the root.
    ///
    /// Purely lexical: absolute keys, backslashes and any non-normal
    /// path component (`..`, `.`, prefixes) are rejected before any
    /// filesystem call.
    fn resolve(&self, storage_key: &str) -> StorageResult<PathBuf> {
        let denied = || StorageError::PermissionDenied {
            key: storage_key.to_string(),
        };
        if storage_key.is_empty() || storage_key.starts_with('/') || storage_key.contains('\\') {
            return Err(denied());
        }
        for component in Path::new(storage_key).components() {
            match component {
                Component::Normal(_) => {}
                _ => return Err(denied()),
            }
        }
        Ok(self.root.join(storage_key))
    }

    /// Generate a temp file path under `.tmp/` for atomic writes.
    fn temp_path(&self) -> PathBuf {
        let id = uuid::Uuid::new_v4();
        self.root.join(".tmp").join(format!("tmp-{id}"))
    }

    /// Crash-only write: temp file, fsync, rename into place.
    fn write_atomic(&self, final_path: &Path, data: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = final_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.temp_path();
        if let Some(parent) = tmp_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, final_path)?;
        Ok(())
    }

    /// Sidecar path for a (pre-validated) storage key.
    fn meta_path(&self, storage_key: &str) -> PathBuf {
        self.root.join(".meta").join(format!("{storage_key}.json"))
    }

    fn write_meta(&self, storage_key: &str, content_type: Option<&str>) -> std::io::Result<()> {
        let path = self.meta_path(storage_key);
        match content_type {
            Some(ct) => {
                let doc = MetaDoc {
                    content_type: ct.to_string(),
                };
                let body = serde_json::to_vec(&doc)?;
                self.write_atomic(&path, &body)
            }
            None => {
                // Stale sidecars would misreport overwritten objects.
                let _ = std::fs::remove_file(&path);
                Ok(())
            }
        }
    }

    fn read_meta(&self, storage_key: &str) -> Option<String> {
        let raw = std::fs::read(self.meta_path(storage_key)).ok()?;
        let doc: MetaDoc = serde_json::from_slice(&raw).ok()?;
        Some(doc.content_type)
    }

    fn session_path(&self, upload_id: &str) -> PathBuf {
        self.root.join(".uploads").join(format!("{upload_id}.json"))
    }

    fn part_dir(&self, upload_id: &str) -> PathBuf {
        self.root.join(".multipart").join(upload_id)
    }

    /// Load a live session document; unknown and aborted sessions are
    /// both reported as [`StorageError::UploadNotFound`].
    fn load_session(&self, upload_id: &str) -> StorageResult<SessionDoc> {
        let not_found = || StorageError::UploadNotFound {
            upload_id: upload_id.to_string(),
        };
        let raw = std::fs::read(self.session_path(upload_id)).map_err(|_| not_found())?;
        let doc: SessionDoc = serde_json::from_slice(&raw)?;
        if doc.state == SessionState::Aborted {
            return Err(not_found());
        }
        Ok(doc)
    }

    fn store_session(&self, upload_id: &str, doc: &SessionDoc) -> StorageResult<()> {
        let body = serde_json::to_vec(doc)?;
        self.write_atomic(&self.session_path(upload_id), &body)?;
        Ok(())
    }

    /// Read one staged part's bytes; absence maps to `PartMismatch`.
    fn read_part(&self, upload_id: &str, part_number: i32) -> StorageResult<Vec<u8>> {
        let path = self.part_dir(upload_id).join(part_number.to_string());
        std::fs::read(&path).map_err(|_| StorageError::PartMismatch {
            message: format!("part {part_number} was never uploaded"),
        })
    }
}

/// Quoted hex MD5 of `data`.
fn quoted_md5(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    format!("\"{}\"", hex::encode(hasher.finalize()))
}

/// Recursively collect relative file keys, skipping dot-prefixed names.
fn collect_keys(root: &Path, dir: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            collect_keys(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}

impl StorageAdapter for LocalAdapter {
    fn save(
        &self,
        key: &str,
        data: Bytes,
        content_type: Option<&str>,
        precondition: SavePrecondition,
    ) -> Pin<Box<dyn Future<Output = StorageResult<String>> + Send + '_>> {
        let key = key.to_string();
        let content_type = content_type.map(|s| s.to_string());
        let data = data.clone();
        Box::pin(async move {
            let final_path = self.resolve(&key)?;
            let etag = quoted_md5(&data);

            // Conditional saves hold the lock across check + rename so
            // two writers cannot both pass the same precondition.
            let _guard = self.cas_lock.lock().unwrap_or_else(|e| e.into_inner());
            match &precondition {
                SavePrecondition::None => {}
                SavePrecondition::IfAbsent => {
                    if final_path.exists() {
                        return Err(StorageError::ConditionFailed { key });
                    }
                }
                SavePrecondition::IfMatch(expected) => {
                    if !final_path.exists() {
                        return Err(StorageError::ConditionFailed { key });
                    }
                    let current = quoted_md5(&std::fs::read(&final_path)?);
                    if current.trim_matches('"') != expected.trim_matches('"') {
                        return Err(StorageError::ConditionFailed { key });
                    }
                }
            }
            self.write_atomic(&final_path, &data)?;
            self.write_meta(&key, content_type.as_deref())?;

            Ok(etag)
        })
    }

    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<Option<StoredObject>>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let path = self.resolve(&key)?;
            if !path.is_file() {
                return Ok(None);
            }

            let data = Bytes::from(std::fs::read(&path)?);
            let etag = quoted_md5(&data);
            let size = data.len() as u64;
            let last_modified = std::fs::metadata(&path)?
                .modified()
                .ok()
                .map(DateTime::<Utc>::from);

            Ok(Some(StoredObject {
                data,
                content_type: self.read_meta(&key),
                etag,
                size,
                last_modified,
            }))
        })
    }

    fn exists(&self, key: &str) -> Pin<Box<dyn Future<Output = StorageResult<bool>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let path = self.resolve(&key)?;
            Ok(path.is_file())
        })
    }

    fn delete(&self, key: &str) -> Pin<Box<dyn Future<Output = StorageResult<bool>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let path = self.resolve(&key)?;
            if !path.is_file() {
                return Ok(false);
            }
            std::fs::remove_file(&path)?;
            let _ = std::fs::remove_file(self.meta_path(&key));
            Ok(true)
        })
    }

    fn list(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
    ) -> Pin<Box<dyn Future<Output = StorageResult<Vec<ListEntry>>> + Send + '_>> {
        let prefix = prefix.to_string();
        let delimiter = delimiter.map(|s| s.to_string());
        Box::pin(async move {
            let mut keys = Vec::new();
            collect_keys(&self.root, &self.root, &mut keys)?;
            keys.sort();
            keys.retain(|k| k.starts_with(&prefix));

            let Some(delim) = delimiter.filter(|d| !d.is_empty()) else {
                return Ok(keys.into_iter().map(|key| ListEntry::Key { key }).collect());
            };

            let mut entries = Vec::new();
            let mut prefixes = std::collections::BTreeSet::new();
            for key in keys {
                let rest = &key[prefix.len()..];
                match rest.find(delim.as_str()) {
                    Some(idx) => {
                        prefixes.insert(format!("{prefix}{}", &rest[..idx + delim.len()]));
                    }
                    None => entries.push(ListEntry::Key { key }),
                }
            }
            entries.extend(
                prefixes
                    .into_iter()
                    .map(|prefix| ListEntry::CommonPrefix { prefix }),
            );
            Ok(entries)
        })
    }

    fn copy(
        &self,
        source_key: &str,
        target_key: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<bool>> + Send + '_>> {
        let source_key = source_key.to_string();
        let target_key = target_key.to_string();
        Box::pin(async move {
            let src_path = self.resolve(&source_key)?;
            let dst_path = self.resolve(&target_key)?;
            if !src_path.is_file() {
                return Ok(false);
            }

            if let Some(parent) = dst_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            // Kernel-level copy into a temp file, then atomic rename:
            // the object bytes never pass through service buffers.
            let tmp_path = self.temp_path();
            std::fs::copy(&src_path, &tmp_path)?;
            std::fs::rename(&tmp_path, &dst_path)?;

            match self.read_meta(&source_key) {
                Some(ct) => self.write_meta(&target_key, Some(&ct))?,
                None => self.write_meta(&target_key, None)?,
            }
            Ok(true)
        })
    }

    fn ping(&self) -> Pin<Box<dyn Future<Output = PingStatus> + Send + '_>> {
        Box::pin(async move {
            let ok = self.root.is_dir();
            PingStatus {
                backend: "local".to_string(),
                ok,
                detail: (!ok).then(|| format!("storage root missing: {}", self.root.display())),
            }
        })
    }

    fn download_url(
        &self,
        key: &str,
        expires_in: Duration,
    ) -> Pin<Box<dyn Future<Output = StorageResult<String>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            self.resolve(&key)?;
            let path = format!("/files/stream/{key}");
            let (url, _) = self.signer.issue("GET", &path, &[], expires_in);
            Ok(url)
        })
    }

    fn create_upload(
        &self,
        key: &str,
        content_type: Option<&str>,
    ) -> Pin<Box<dyn Future<Output = StorageResult<String>> + Send + '_>> {
        let key = key.to_string();
        let content_type = content_type.map(|s| s.to_string());
        Box::pin(async move {
            self.resolve(&key)?;
            let upload_id = uuid::Uuid::new_v4().to_string();
            let doc = SessionDoc {
                key,
                content_type,
                state: SessionState::Initialized,
                created_at: Utc::now(),
            };
            self.store_session(&upload_id, &doc)?;
            Ok(upload_id)
        })
    }

    fn part_upload_url(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        expires_in: Duration,
    ) -> Pin<Box<dyn Future<Output = StorageResult<String>> + Send + '_>> {
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let doc = self.load_session(&upload_id)?;
            if doc.key != key {
                return Err(StorageError::UploadNotFound { upload_id });
            }
            let path = format!("/upload/part/{upload_id}/{part_number}");
            let query = vec![("key".to_string(), key)];
            let (url, _) = self.signer.issue("PUT", &path, &query, expires_in);
            Ok(url)
        })
    }

    fn put_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = StorageResult<String>> + Send + '_>> {
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        let data = data.clone();
        Box::pin(async move {
            let mut doc = self.load_session(&upload_id)?;
            if doc.key != key {
                return Err(StorageError::UploadNotFound { upload_id });
            }

            let etag = quoted_md5(&data);
            let part_path = self.part_dir(&upload_id).join(part_number.to_string());
            self.write_atomic(&part_path, &data)?;

            if doc.state == SessionState::Initialized {
                doc.state = SessionState::PartsPending;
                self.store_session(&upload_id, &doc)?;
            }
            Ok(etag)
        })
    }

    fn list_parts(
        &self,
        key: &str,
        upload_id: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<Vec<PartInfo>>> + Send + '_>> {
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let doc = self.load_session(&upload_id)?;
            if doc.key != key {
                return Err(StorageError::UploadNotFound { upload_id });
            }

            let dir = self.part_dir(&upload_id);
            let mut parts = Vec::new();
            if dir.is_dir() {
                for entry in std::fs::read_dir(&dir)? {
                    let entry = entry?;
                    let Ok(part_number) = entry.file_name().to_string_lossy().parse::<i32>()
                    else {
                        continue;
                    };
                    let data = std::fs::read(entry.path())?;
                    parts.push(PartInfo {
                        part_number,
                        etag: quoted_md5(&data),
                        size: data.len() as u64,
                    });
                }
            }
            parts.sort_by_key(|p| p.part_number);
            Ok(parts)
        })
    }

    fn complete_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[PartSpec],
    ) -> Pin<Box<dyn Future<Output = StorageResult<String>> + Send + '_>> {
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        let parts = parts.to_vec();
        Box::pin(async move {
            let doc = self.load_session(&upload_id)?;
            if doc.key != key {
                return Err(StorageError::UploadNotFound { upload_id });
            }
            if parts.is_empty() {
                return Err(StorageError::PartMismatch {
                    message: "completion lists no parts".to_string(),
                });
            }

            // Validate the full claimed set before assembling anything;
            // a mismatch must leave the session untouched and retryable.
            let mut validated = Vec::with_capacity(parts.len());
            for spec in &parts {
                let data = self.read_part(&upload_id, spec.part_number)?;
                let stored_etag = quoted_md5(&data);
                if stored_etag.trim_matches('"') != spec.etag.trim_matches('"') {
                    return Err(StorageError::PartMismatch {
                        message: format!(
                            "part {}: etag does not match the uploaded part",
                            spec.part_number
                        ),
                    });
                }
                validated.push(data);
            }

            // Concatenate into a temp file, fsync, rename: readers see
            // either nothing or the fully assembled object.
            let final_path = self.resolve(&key)?;
            if let Some(parent) = final_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let tmp_path = self.temp_path();
            let mut output = std::fs::File::create(&tmp_path)?;
            let mut combined_md5s: Vec<u8> = Vec::new();
            for data in &validated {
                let mut hasher = Md5::new();
                hasher.update(data);
                combined_md5s.extend_from_slice(&hasher.finalize());
                output.write_all(data)?;
            }
            output.sync_all()?;
            drop(output);
            std::fs::rename(&tmp_path, &final_path)?;
            self.write_meta(&key, doc.content_type.as_deref())?;

            // Finalize: the session vanishes, staging becomes garbage.
            let _ = std::fs::remove_dir_all(self.part_dir(&upload_id));
            let _ = std::fs::remove_file(self.session_path(&upload_id));

            let mut composite = Md5::new();
            composite.update(&combined_md5s);
            Ok(format!(
                "\"{}-{}\"",
                hex::encode(composite.finalize()),
                parts.len()
            ))
        })
    }

    fn abort_upload(
        &self,
        key: &str,
        upload_id: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<bool>> + Send + '_>> {
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let mut doc = match self.load_session(&upload_id) {
                Ok(doc) => doc,
                Err(StorageError::UploadNotFound { .. }) => return Ok(false),
                Err(err) => return Err(err),
            };
            if doc.key != key {
                return Ok(false);
            }
            doc.state = SessionState::Aborted;
            self.store_session(&upload_id, &doc)?;
            Ok(true)
        })
    }

    fn reap_stale_uploads(
        &self,
        older_than: Duration,
    ) -> Pin<Box<dyn Future<Output = StorageResult<u64>> + Send + '_>> {
        Box::pin(async move {
            let now = Utc::now();
            let mut reaped = 0u64;

            for entry in std::fs::read_dir(self.root.join(".uploads"))? {
                let entry = entry?;
                let Some(upload_id) = entry
                    .file_name()
                    .to_string_lossy()
                    .strip_suffix(".json")
                    .map(str::to_string)
                else {
                    continue;
                };

                let stale = match std::fs::read(entry.path())
                    .ok()
                    .and_then(|raw| serde_json::from_slice::<SessionDoc>(&raw).ok())
                {
                    // Unreadable documents cannot ever complete.
                    None => true,
                    Some(doc) => {
                        let age = (now - doc.created_at).to_std().unwrap_or_default();
                        doc.state == SessionState::Aborted || age >= older_than
                    }
                };
                if stale {
                    let _ = std::fs::remove_dir_all(self.part_dir(&upload_id));
                    std::fs::remove_file(entry.path())?;
                    reaped += 1;
                    tracing::debug!(upload_id = %upload_id, "reaped stale upload session");
                }
            }

            // Part directories whose session document is already gone.
            for entry in std::fs::read_dir(self.root.join(".multipart"))? {
                let entry = entry?;
                let upload_id = entry.file_name().to_string_lossy().to_string();
                if !self.session_path(&upload_id).is_file() {
                    std::fs::remove_dir_all(entry.path())?;
                    reaped += 1;
                }
            }

            // Leftover temp files from interrupted writes.
            for entry in std::fs::read_dir(self.root.join(".tmp"))? {
                let entry = entry?;
                let age = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|t| t.elapsed().ok())
                    .unwrap_or_default();
                if age >= older_than {
                    let _ = std::fs::remove_file(entry.path());
                }
            }

            Ok(reaped)
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_adapter() -> (tempfile::TempDir, LocalAdapter) {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let signer = GrantSigner::new("test-secret", "http://127.0.0.1:9440");
        let adapter = LocalAdapter::new(dir.path(), signer).expect("failed to create adapter");
        (dir, adapter)
    }

    #[tokio::test]
    async fn test_save_and_get_roundtrip() {
        let (_dir, adapter) = test_adapter();

        let data = Bytes::from("hello world");
        let etag = adapter
            .save(
                "alice/report/v1/data.bin",
                data.clone(),
                Some("application/octet-stream"),
                SavePrecondition::None,
            )
            .await
            .unwrap();
        assert!(etag.starts_with('"') && etag.ends_with('"'));

        let obj = adapter.get("alice/report/v1/data.bin").await.unwrap().unwrap();
        assert_eq!(obj.data, data);
        assert_eq!(obj.etag, etag);
        assert_eq!(obj.size, 11);
        assert_eq!(obj.content_type.as_deref(), Some("application/octet-stream"));
        assert!(obj.last_modified.is_some());
    }

    #[tokio::test]
    async fn test_etag_is_md5() {
        let (_dir, adapter) = test_adapter();

        // Known MD5 of empty string: d41d8cd98f00b204e9800998ecf8427e
        let etag = adapter
            .save("a/b/v/empty", Bytes::new(), None, SavePrecondition::None)
            .await
            .unwrap();
        assert_eq!(etag, "\"d41d8cd98f00b204e9800998ecf8427e\"");
    }

    #[tokio::test]
    async fn test_get_absent_returns_none() {
        let (_dir, adapter) = test_adapter();
        assert!(adapter.get("alice/no/such/key").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_overwrite_changes_etag() {
        let (_dir, adapter) = test_adapter();

        let etag1 = adapter
            .save("a/b/v/f", Bytes::from("version 1"), None, SavePrecondition::None)
            .await
            .unwrap();
        let etag2 = adapter
            .save("a/b/v/f", Bytes::from("version 2"), None, SavePrecondition::None)
            .await
            .unwrap();
        assert_ne!(etag1, etag2);

        let obj = adapter.get("a/b/v/f").await.unwrap().unwrap();
        assert_eq!(obj.data, Bytes::from("version 2"));
    }

    #[tokio::test]
    async fn test_if_absent_precondition() {
        let (_dir, adapter) = test_adapter();

        adapter
            .save("a/b/v/f", Bytes::from("first"), None, SavePrecondition::IfAbsent)
            .await
            .unwrap();

        let err = adapter
            .save("a/b/v/f", Bytes::from("second"), None, SavePrecondition::IfAbsent)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ConditionFailed { .. }));

        // Loser's write must not have landed.
        let obj = adapter.get("a/b/v/f").await.unwrap().unwrap();
        assert_eq!(obj.data, Bytes::from("first"));
    }

    #[tokio::test]
    async fn test_if_match_precondition() {
        let (_dir, adapter) = test_adapter();

        let etag = adapter
            .save("a/b/v/f", Bytes::from("base"), None, SavePrecondition::None)
            .await
            .unwrap();

        // Matching etag wins, quotes optional.
        adapter
            .save(
                "a/b/v/f",
                Bytes::from("next"),
                None,
                SavePrecondition::IfMatch(etag.trim_matches('"').to_string()),
            )
            .await
            .unwrap();

        // Stale etag loses.
        let err = adapter
            .save("a/b/v/f", Bytes::from("stale"), None, SavePrecondition::IfMatch(etag))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ConditionFailed { .. }));

        // IfMatch against an absent key also fails.
        let err = adapter
            .save(
                "a/b/v/other",
                Bytes::from("x"),
                None,
                SavePrecondition::IfMatch("\"deadbeef\"".to_string()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ConditionFailed { .. }));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (_dir, adapter) = test_adapter();

        adapter
            .save("a/b/v/f", Bytes::from("data"), None, SavePrecondition::None)
            .await
            .unwrap();
        assert!(adapter.delete("a/b/v/f").await.unwrap());
        assert!(!adapter.delete("a/b/v/f").await.unwrap());
        assert!(!adapter.exists("a/b/v/f").await.unwrap());
    }

    #[tokio::test]
    async fn test_traversal_rejected_before_fs() {
        let (_dir, adapter) = test_adapter();

        for key in ["../escape", "/etc/passwd", "a/../../b", "a\\..\\b"] {
            let err = adapter.get(key).await.unwrap_err();
            assert!(
                matches!(err, StorageError::PermissionDenied { .. }),
                "key {key:?} must be rejected"
            );
        }
        // Writes are refused the same way.
        let err = adapter
            .save("../escape", Bytes::from("x"), None, SavePrecondition::None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn test_copy_preserves_bytes_and_content_type() {
        let (_dir, adapter) = test_adapter();

        let data = Bytes::from("copy me");
        let src_etag = adapter
            .save("alice/b/v/orig", data.clone(), Some("text/plain"), SavePrecondition::None)
            .await
            .unwrap();

        assert!(adapter.copy("alice/b/v/orig", "bob/b/v/copy").await.unwrap());

        let obj = adapter.get("bob/b/v/copy").await.unwrap().unwrap();
        assert_eq!(obj.data, data);
        assert_eq!(obj.etag, src_etag);
        assert_eq!(obj.content_type.as_deref(), Some("text/plain"));

        // Source untouched.
        assert!(adapter.exists("alice/b/v/orig").await.unwrap());
    }

    #[tokio::test]
    async fn test_copy_missing_source_returns_false() {
        let (_dir, adapter) = test_adapter();
        assert!(!adapter.copy("a/no/such/key", "a/b/v/target").await.unwrap());
        assert!(!adapter.exists("a/b/v/target").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_flat_and_prefixed() {
        let (_dir, adapter) = test_adapter();

        for key in ["alice/b1/v1/f1", "alice/b1/v1/f2", "alice/b2/v1/f1", "bob/b1/v1/f1"] {
            adapter
                .save(key, Bytes::from("x"), None, SavePrecondition::None)
                .await
                .unwrap();
        }

        let entries = adapter.list("alice/", None).await.unwrap();
        let keys: Vec<_> = entries
            .iter()
            .map(|e| match e {
                ListEntry::Key { key } => key.clone(),
                ListEntry::CommonPrefix { prefix } => panic!("unexpected prefix {prefix}"),
            })
            .collect();
        assert_eq!(keys, vec!["alice/b1/v1/f1", "alice/b1/v1/f2", "alice/b2/v1/f1"]);
    }

    #[tokio::test]
    async fn test_list_with_delimiter_groups() {
        let (_dir, adapter) = test_adapter();

        for key in ["alice/b1/v1/f1", "alice/b1/v2/f1", "alice/b2/v1/f1"] {
            adapter
                .save(key, Bytes::from("x"), None, SavePrecondition::None)
                .await
                .unwrap();
        }

        let entries = adapter.list("alice/", Some("/")).await.unwrap();
        assert_eq!(
            entries,
            vec![
                ListEntry::CommonPrefix { prefix: "alice/b1/".to_string() },
                ListEntry::CommonPrefix { prefix: "alice/b2/".to_string() },
            ]
        );

        let entries = adapter.list("alice/b1/", Some("/")).await.unwrap();
        assert_eq!(
            entries,
            vec![
                ListEntry::CommonPrefix { prefix: "alice/b1/v1/".to_string() },
                ListEntry::CommonPrefix { prefix: "alice/b1/v2/".to_string() },
            ]
        );

        let entries = adapter.list("alice/b1/v1/", Some("/")).await.unwrap();
        assert_eq!(
            entries,
            vec![ListEntry::Key { key: "alice/b1/v1/f1".to_string() }]
        );
    }

    #[tokio::test]
    async fn test_list_hides_internal_dirs() {
        let (_dir, adapter) = test_adapter();

        adapter
            .save("alice/b/v/f", Bytes::from("x"), Some("text/plain"), SavePrecondition::None)
            .await
            .unwrap();
        adapter.create_upload("alice/b/v/g", None).await.unwrap();

        let entries = adapter.list("", None).await.unwrap();
        assert_eq!(entries, vec![ListEntry::Key { key: "alice/b/v/f".to_string() }]);
    }

    #[tokio::test]
    async fn test_ping_reports_local() {
        let (_dir, adapter) = test_adapter();
        let status = adapter.ping().await;
        assert!(status.ok);
        assert_eq!(status.backend, "local");
    }

    #[tokio::test]
    async fn test_grant_urls_point_at_service() {
        let (_dir, adapter) = test_adapter();

        adapter
            .save("alice/b/v/f.bin", Bytes::from("x"), None, SavePrecondition::None)
            .await
            .unwrap();
        let url = adapter
            .download_url("alice/b/v/f.bin", Duration::from_secs(300))
            .await
            .unwrap();
        assert!(url.starts_with("http://127.0.0.1:9440/files/stream/alice/b/v/f.bin?"));
        assert!(url.contains("expires=") && url.contains("signature="));

        let upload_id = adapter.create_upload("alice/b/v/g.bin", None).await.unwrap();
        let url = adapter
            .part_upload_url("alice/b/v/g.bin", &upload_id, 3, Duration::from_secs(300))
            .await
            .unwrap();
        assert!(url.contains(&format!("/upload/part/{upload_id}/3?")));
        assert!(url.contains("key=alice%2Fb%2Fv%2Fg.bin") || url.contains("key=alice/b/v/g.bin"));
    }

    // ── Multipart lifecycle ─────────────────────────────────────────

    #[tokio::test]
    async fn test_multipart_happy_path() {
        let (_dir, adapter) = test_adapter();
        let key = "alice/report/v1/big.bin";

        let upload_id = adapter.create_upload(key, Some("application/zip")).await.unwrap();

        let etag1 = adapter
            .put_part(key, &upload_id, 1, Bytes::from("hello "))
            .await
            .unwrap();
        let etag2 = adapter
            .put_part(key, &upload_id, 2, Bytes::from("world"))
            .await
            .unwrap();

        let parts = adapter.list_parts(key, &upload_id).await.unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].part_number, 1);
        assert_eq!(parts[0].etag, etag1);
        assert_eq!(parts[1].size, 5);

        // Nothing visible before completion.
        assert!(adapter.get(key).await.unwrap().is_none());

        let specs = vec![
            PartSpec { part_number: 1, etag: etag1 },
            PartSpec { part_number: 2, etag: etag2 },
        ];
        let etag = adapter.complete_upload(key, &upload_id, &specs).await.unwrap();
        assert!(etag.ends_with("-2\""));

        let obj = adapter.get(key).await.unwrap().unwrap();
        assert_eq!(obj.data, Bytes::from("hello world"));
        assert_eq!(obj.content_type.as_deref(), Some("application/zip"));

        // Session is finalized.
        let err = adapter.list_parts(key, &upload_id).await.unwrap_err();
        assert!(matches!(err, StorageError::UploadNotFound { .. }));
    }

    #[tokio::test]
    async fn test_complete_with_wrong_etag_fails_and_session_survives() {
        let (_dir, adapter) = test_adapter();
        let key = "alice/report/v1/big.bin";

        let upload_id = adapter.create_upload(key, None).await.unwrap();
        let etag1 = adapter
            .put_part(key, &upload_id, 1, Bytes::from("data"))
            .await
            .unwrap();

        let specs = vec![PartSpec {
            part_number: 1,
            etag: "\"0123456789abcdef0123456789abcdef\"".to_string(),
        }];
        let err = adapter.complete_upload(key, &upload_id, &specs).await.unwrap_err();
        assert!(matches!(err, StorageError::PartMismatch { .. }));

        // No partial object appeared and the session is retryable.
        assert!(adapter.get(key).await.unwrap().is_none());
        let specs = vec![PartSpec { part_number: 1, etag: etag1 }];
        adapter.complete_upload(key, &upload_id, &specs).await.unwrap();
        assert!(adapter.exists(key).await.unwrap());
    }

    #[tokio::test]
    async fn test_complete_with_missing_part_fails() {
        let (_dir, adapter) = test_adapter();
        let key = "alice/report/v1/big.bin";

        let upload_id = adapter.create_upload(key, None).await.unwrap();
        let etag1 = adapter
            .put_part(key, &upload_id, 1, Bytes::from("data"))
            .await
            .unwrap();

        let specs = vec![
            PartSpec { part_number: 1, etag: etag1 },
            PartSpec { part_number: 2, etag: "\"beef\"".to_string() },
        ];
        let err = adapter.complete_upload(key, &upload_id, &specs).await.unwrap_err();
        assert!(matches!(err, StorageError::PartMismatch { .. }));
        assert!(adapter.get(key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_session_key_must_match() {
        let (_dir, adapter) = test_adapter();

        let upload_id = adapter.create_upload("alice/b/v/f", None).await.unwrap();
        let err = adapter
            .put_part("alice/b/v/other", &upload_id, 1, Bytes::from("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::UploadNotFound { .. }));
    }

    #[tokio::test]
    async fn test_put_part_unknown_upload() {
        let (_dir, adapter) = test_adapter();
        let err = adapter
            .put_part("alice/b/v/f", "no-such-upload", 1, Bytes::from("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::UploadNotFound { .. }));
    }

    #[tokio::test]
    async fn test_abort_then_reap() {
        let (_dir, adapter) = test_adapter();
        let key = "alice/b/v/f";

        let upload_id = adapter.create_upload(key, None).await.unwrap();
        adapter.put_part(key, &upload_id, 1, Bytes::from("x")).await.unwrap();

        assert!(adapter.abort_upload(key, &upload_id).await.unwrap());
        // Second abort is a no-op on an already-dead session.
        assert!(!adapter.abort_upload(key, &upload_id).await.unwrap());

        // Aborted sessions refuse further traffic.
        let err = adapter.put_part(key, &upload_id, 2, Bytes::from("y")).await.unwrap_err();
        assert!(matches!(err, StorageError::UploadNotFound { .. }));

        // Even a generous TTL reaps aborted sessions.
        let reaped = adapter.reap_stale_uploads(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(reaped, 1);
        assert!(!adapter.part_dir(&upload_id).exists());
    }

    #[tokio::test]
    async fn test_reap_respects_ttl() {
        let (_dir, adapter) = test_adapter();

        adapter.create_upload("alice/b/v/f", None).await.unwrap();

        // Fresh session survives a one-hour TTL.
        assert_eq!(
            adapter.reap_stale_uploads(Duration::from_secs(3600)).await.unwrap(),
            0
        );
        // Zero TTL makes everything stale.
        assert_eq!(
            adapter.reap_stale_uploads(Duration::from_secs(0)).await.unwrap(),
            1
        );
    }
}
