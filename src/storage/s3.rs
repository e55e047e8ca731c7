//! S3-compatible object store adapter.
//!
//! All coordinator keys live under a configurable prefix inside one
//! backing bucket.  Transfer grants are SDK-presigned URLs, multipart
//! sessions map 1:1 onto native S3 multipart uploads, copies are
//! server-side `CopyObject` calls, and conditional saves use `If-Match`
//! / `If-None-Match` preconditions.  No object bytes transit this
//! service.
//!
//! Credentials are resolved via the standard AWS credential chain
//! (env vars, `~/.aws/credentials`, IAM role, etc.) unless explicit
//! keys are configured.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use tracing::{debug, info, warn};

use super::adapter::{
    ListEntry, PartInfo, PartSpec, PingStatus, SavePrecondition, StorageAdapter, StorageResult,
    StoredObject,
};
use crate::errors::StorageError;

/// Presigned URLs cannot outlive SigV4's hard cap (7 days).
const MAX_PRESIGN_TTL: Duration = Duration::from_secs(604_800);

/// Escaped characters in `x-amz-copy-source` key paths (`/` stays).
const COPY_SOURCE_ENCODE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'+');

/// Adapter backed by a real S3 (or S3-compatible) bucket.
#[derive(Debug)]
pub struct S3Adapter {
    /// AWS S3 SDK client.
    client: Client,
    /// Backing bucket name.
    bucket: String,
    /// Key prefix namespacing all coordinator data in the bucket.
    prefix: String,
}

impl S3Adapter {
    /// Create a new S3 adapter.
    ///
    /// Loads credentials from the default chain unless explicit keys are
    /// given, and honors custom endpoints (MinIO, LocalStack) with
    /// optional path-style addressing.
    pub async fn new(
        bucket: String,
        region: String,
        prefix: String,
        endpoint_url: Option<String>,
        use_path_style: bool,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
    ) -> anyhow::Result<Self> {
        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region));

        if let Some(ref endpoint) = endpoint_url {
            config_loader = config_loader.endpoint_url(endpoint);
        }

        if let (Some(ref ak), Some(ref sk)) = (&access_key_id, &secret_access_key) {
            let creds = aws_sdk_s3::config::Credentials::new(
                ak,
                sk,
                None, // session_token
                None, // expiry
                "blockdepot-config",
            );
            config_loader = config_loader.credentials_provider(creds);
        }

        let sdk_config = config_loader.load().await;
        let s3_config_builder =
            aws_sdk_s3::config::Builder::from(&sdk_config).force_path_style(use_path_style);
        let client = Client::from_conf(s3_config_builder.build());

        info!(
            "S3 adapter initialized: bucket={} prefix='{}'",
            bucket, prefix
        );

        Ok(Self {
            client,
            bucket,
            prefix,
        })
    }

    /// Map a coordinator key to an upstream S3 key.
    fn s3_key(&self, storage_key: &str) -> String {
        format!("{}{}", self.prefix, storage_key)
    }

    /// Strip the configured prefix off an upstream key.
    fn local_key<'a>(&self, s3_key: &'a str) -> &'a str {
        s3_key.strip_prefix(&self.prefix).unwrap_or(s3_key)
    }

    /// Build the `x-amz-copy-source` value for an upstream key.
    fn copy_source(&self, s3_key: &str) -> String {
        format!(
            "{}/{}",
            self.bucket,
            utf8_percent_encode(s3_key, COPY_SOURCE_ENCODE)
        )
    }

    fn presign_config(expires_in: Duration) -> StorageResult<PresigningConfig> {
        PresigningConfig::expires_in(expires_in.min(MAX_PRESIGN_TTL))
            .map_err(|e| Self::backend_err("presigning config", e))
    }

    /// Quoted MD5 computed locally, for parity with the local adapter
    /// when the backend withholds an ETag (e.g. SSE-KMS).
    fn compute_etag(data: &[u8]) -> String {
        let mut hasher = Md5::new();
        hasher.update(data);
        format!("\"{}\"", hex::encode(hasher.finalize()))
    }

    /// Fold an SDK error into a backend fault with context.
    fn backend_err(context: &str, err: impl std::fmt::Display) -> StorageError {
        StorageError::Backend(anyhow::anyhow!("S3 {context}: {err}"))
    }

    /// True for the service codes S3 uses to report a lost precondition.
    fn is_condition_failure(code: Option<&str>) -> bool {
        matches!(
            code,
            Some("PreconditionFailed") | Some("ConditionalRequestConflict")
        )
    }

    fn is_no_such_upload(code: Option<&str>) -> bool {
        code == Some("NoSuchUpload")
    }
}

/// Composite `"md5(concat part-md5s)-N"` ETag from claimed part ETags.
fn composite_etag(parts: &[PartSpec]) -> Option<String> {
    let mut combined: Vec<u8> = Vec::new();
    for spec in parts {
        combined.extend_from_slice(&hex::decode(spec.etag.trim_matches('"')).ok()?);
    }
    let mut hasher = Md5::new();
    hasher.update(&combined);
    Some(format!(
        "\"{}-{}\"",
        hex::encode(hasher.finalize()),
        parts.len()
    ))
}

fn smithy_time_to_chrono(t: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(t.secs(), t.subsec_nanos())
}

impl StorageAdapter for S3Adapter {
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
            let s3_key = self.s3_key(&key);
            let etag = Self::compute_etag(&data);

            debug!("S3 put_object: bucket={} key={}", self.bucket, s3_key);

            let mut req = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(&s3_key)
                .body(ByteStream::from(data));
            if let Some(ref ct) = content_type {
                req = req.content_type(ct);
            }
            match &precondition {
                SavePrecondition::None => {}
                SavePrecondition::IfAbsent => req = req.if_none_match("*"),
                SavePrecondition::IfMatch(expected) => req = req.if_match(expected),
            }

            req.send().await.map_err(|e| {
                let service_err = e.into_service_error();
                if Self::is_condition_failure(service_err.meta().code()) {
                    StorageError::ConditionFailed { key: key.clone() }
                } else {
                    Self::backend_err("put_object", service_err)
                }
            })?;

            Ok(etag)
        })
    }

    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<Option<StoredObject>>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let s3_key = self.s3_key(&key);

            debug!("S3 get_object: bucket={} key={}", self.bucket, s3_key);

            let resp = match self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&s3_key)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    let service_err = e.into_service_error();
                    if service_err.is_no_such_key() {
                        return Ok(None);
                    }
                    return Err(Self::backend_err("get_object", service_err));
                }
            };

            let content_type = resp.content_type().map(str::to_string);
            let etag = resp.e_tag().map(str::to_string);
            let last_modified = resp.last_modified().and_then(smithy_time_to_chrono);

            let body = resp
                .body
                .collect()
                .await
                .map_err(|e| Self::backend_err("get_object body", e))?
                .into_bytes();
            let data = Bytes::from(body.to_vec());

            Ok(Some(StoredObject {
                etag: etag.unwrap_or_else(|| Self::compute_etag(&data)),
                size: data.len() as u64,
                content_type,
                last_modified,
                data,
            }))
        })
    }

    fn exists(&self, key: &str) -> Pin<Box<dyn Future<Output = StorageResult<bool>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let s3_key = self.s3_key(&key);
            match self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(&s3_key)
                .send()
                .await
            {
                Ok(_) => Ok(true),
                Err(e) => {
                    let service_err = e.into_service_error();
                    if service_err.is_not_found() {
                        Ok(false)
                    } else {
                        Err(Self::backend_err("head_object", service_err))
                    }
                }
            }
        })
    }

    fn delete(&self, key: &str) -> Pin<Box<dyn Future<Output = StorageResult<bool>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            // DeleteObject alone cannot answer the idempotence contract
            // (it succeeds for absent keys), so probe first.
            if !self.exists(&key).await? {
                return Ok(false);
            }

            let s3_key = self.s3_key(&key);
            debug!("S3 delete_object: bucket={} key={}", self.bucket, s3_key);
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(&s3_key)
                .send()
                .await
                .map_err(|e| Self::backend_err("delete_object", e))?;
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
            let full_prefix = self.s3_key(&prefix);
            let mut keys: Vec<String> = Vec::new();
            let mut prefixes = std::collections::BTreeSet::new();
            let mut continuation_token: Option<String> = None;

            loop {
                let mut req = self
                    .client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .prefix(&full_prefix);
                if let Some(ref d) = delimiter {
                    req = req.delimiter(d);
                }
                if let Some(ref token) = continuation_token {
                    req = req.continuation_token(token);
                }

                let resp = req
                    .send()
                    .await
                    .map_err(|e| Self::backend_err("list_objects_v2", e))?;

                for obj in resp.contents() {
                    if let Some(k) = obj.key() {
                        keys.push(self.local_key(k).to_string());
                    }
                }
                for cp in resp.common_prefixes() {
                    if let Some(p) = cp.prefix() {
                        prefixes.insert(self.local_key(p).to_string());
                    }
                }

                if resp.is_truncated() == Some(true) {
                    continuation_token = resp.next_continuation_token().map(|s| s.to_string());
                } else {
                    break;
                }
            }

            keys.sort();
            let mut entries: Vec<ListEntry> =
                keys.into_iter().map(|key| ListEntry::Key { key }).collect();
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
            let src_s3_key = self.s3_key(&source_key);
            let dst_s3_key = self.s3_key(&target_key);

            debug!(
                "S3 copy_object: src={}/{} dst={}/{}",
                self.bucket, src_s3_key, self.bucket, dst_s3_key
            );

            match self
                .client
                .copy_object()
                .bucket(&self.bucket)
                .key(&dst_s3_key)
                .copy_source(self.copy_source(&src_s3_key))
                .send()
                .await
            {
                Ok(_) => Ok(true),
                Err(e) => {
                    let service_err = e.into_service_error();
                    if service_err.meta().code() == Some("NoSuchKey") {
                        Ok(false)
                    } else {
                        Err(Self::backend_err("copy_object", service_err))
                    }
                }
            }
        })
    }

    fn ping(&self) -> Pin<Box<dyn Future<Output = PingStatus> + Send + '_>> {
        Box::pin(async move {
            match self
                .client
                .head_bucket()
                .bucket(&self.bucket)
                .send()
                .await
            {
                Ok(_) => PingStatus {
                    backend: "s3".to_string(),
                    ok: true,
                    detail: None,
                },
                Err(e) => PingStatus {
                    backend: "s3".to_string(),
                    ok: false,
                    detail: Some(e.into_service_error().to_string()),
                },
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
            let s3_key = self.s3_key(&key);
            let presigned = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&s3_key)
                .presigned(Self::presign_config(expires_in)?)
                .await
                .map_err(|e| Self::backend_err("presign get_object", e))?;
            Ok(presigned.uri().to_string())
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
            let s3_key = self.s3_key(&key);

            debug!(
                "S3 create_multipart_upload: bucket={} key={}",
                self.bucket, s3_key
            );

            let mut req = self
                .client
                .create_multipart_upload()
                .bucket(&self.bucket)
                .key(&s3_key);
            if let Some(ref ct) = content_type {
                req = req.content_type(ct);
            }

            let resp = req
                .send()
                .await
                .map_err(|e| Self::backend_err("create_multipart_upload", e))?;
            resp.upload_id()
                .map(str::to_string)
                .ok_or_else(|| Self::backend_err("create_multipart_upload", "no upload id"))
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
            let s3_key = self.s3_key(&key);
            let presigned = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(&s3_key)
                .upload_id(&upload_id)
                .part_number(part_number)
                .presigned(Self::presign_config(expires_in)?)
                .await
                .map_err(|e| Self::backend_err("presign upload_part", e))?;
            Ok(presigned.uri().to_string())
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
            let s3_key = self.s3_key(&key);
            let fallback_etag = Self::compute_etag(&data);

            let resp = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(&s3_key)
                .upload_id(&upload_id)
                .part_number(part_number)
                .body(ByteStream::from(data))
                .send()
                .await
                .map_err(|e| {
                    let service_err = e.into_service_error();
                    if Self::is_no_such_upload(service_err.meta().code()) {
                        StorageError::UploadNotFound {
                            upload_id: upload_id.clone(),
                        }
                    } else {
                        Self::backend_err("upload_part", service_err)
                    }
                })?;

            Ok(resp.e_tag().map(str::to_string).unwrap_or(fallback_etag))
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
            let s3_key = self.s3_key(&key);
            let mut parts = Vec::new();
            let mut marker: Option<String> = None;

            loop {
                let mut req = self
                    .client
                    .list_parts()
                    .bucket(&self.bucket)
                    .key(&s3_key)
                    .upload_id(&upload_id);
                if let Some(ref m) = marker {
                    req = req.part_number_marker(m);
                }

                let resp = req.send().await.map_err(|e| {
                    let service_err = e.into_service_error();
                    if Self::is_no_such_upload(service_err.meta().code()) {
                        StorageError::UploadNotFound {
                            upload_id: upload_id.clone(),
                        }
                    } else {
                        Self::backend_err("list_parts", service_err)
                    }
                })?;

                for part in resp.parts() {
                    parts.push(PartInfo {
                        part_number: part.part_number().unwrap_or_default(),
                        etag: part.e_tag().unwrap_or_default().to_string(),
                        size: part.size().unwrap_or_default().max(0) as u64,
                    });
                }

                if resp.is_truncated() == Some(true) {
                    marker = resp.next_part_number_marker().map(|s| s.to_string());
                } else {
                    break;
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
            let s3_key = self.s3_key(&key);

            debug!(
                "S3 complete_multipart_upload: bucket={} key={} parts={}",
                self.bucket,
                s3_key,
                parts.len()
            );

            let completed_parts: Vec<CompletedPart> = parts
                .iter()
                .map(|spec| {
                    CompletedPart::builder()
                        .e_tag(&spec.etag)
                        .part_number(spec.part_number)
                        .build()
                })
                .collect();
            let completed_upload = CompletedMultipartUpload::builder()
                .set_parts(Some(completed_parts))
                .build();

            let resp = self
                .client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(&s3_key)
                .upload_id(&upload_id)
                .multipart_upload(completed_upload)
                .send()
                .await
                .map_err(|e| {
                    let service_err = e.into_service_error();
                    match service_err.meta().code() {
                        Some("NoSuchUpload") => StorageError::UploadNotFound {
                            upload_id: upload_id.clone(),
                        },
                        Some(code @ ("InvalidPart" | "InvalidPartOrder" | "EntityTooSmall")) => {
                            StorageError::PartMismatch {
                                message: format!("{code}: {service_err}"),
                            }
                        }
                        _ => Self::backend_err("complete_multipart_upload", service_err),
                    }
                })?;

            // Prefer the backend's ETag; reconstruct the composite form
            // from claimed part ETags when it is withheld.
            match resp.e_tag() {
                Some(etag) if etag.starts_with('"') => Ok(etag.to_string()),
                Some(etag) => Ok(format!("\"{etag}\"")),
                None => composite_etag(&parts)
                    .ok_or_else(|| Self::backend_err("complete_multipart_upload", "no etag")),
            }
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
            let s3_key = self.s3_key(&key);
            match self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(&s3_key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                Ok(_) => Ok(true),
                Err(e) => {
                    let service_err = e.into_service_error();
                    if Self::is_no_such_upload(service_err.meta().code()) {
                        Ok(false)
                    } else {
                        Err(Self::backend_err("abort_multipart_upload", service_err))
                    }
                }
            }
        })
    }

    fn reap_stale_uploads(
        &self,
        older_than: Duration,
    ) -> Pin<Box<dyn Future<Output = StorageResult<u64>> + Send + '_>> {
        Box::pin(async move {
            let cutoff = Utc::now().timestamp() - older_than.as_secs() as i64;
            let mut reaped = 0u64;
            let mut key_marker: Option<String> = None;
            let mut id_marker: Option<String> = None;

            loop {
                let mut req = self
                    .client
                    .list_multipart_uploads()
                    .bucket(&self.bucket)
                    .prefix(&self.prefix);
                if let Some(ref km) = key_marker {
                    req = req.key_marker(km);
                }
                if let Some(ref im) = id_marker {
                    req = req.upload_id_marker(im);
                }

                let resp = req
                    .send()
                    .await
                    .map_err(|e| Self::backend_err("list_multipart_uploads", e))?;

                for upload in resp.uploads() {
                    let (Some(upload_key), Some(upload_id)) = (upload.key(), upload.upload_id())
                    else {
                        continue;
                    };
                    let initiated = upload.initiated().map(|t| t.secs()).unwrap_or(i64::MIN);
                    if initiated >= cutoff {
                        continue;
                    }

                    match self
                        .client
                        .abort_multipart_upload()
                        .bucket(&self.bucket)
                        .key(upload_key)
                        .upload_id(upload_id)
                        .send()
                        .await
                    {
                        Ok(_) => {
                            reaped += 1;
                            debug!(
                                "S3 reaped stale multipart upload: key={} upload_id={}",
                                upload_key, upload_id
                            );
                        }
                        Err(e) => {
                            let service_err = e.into_service_error();
                            if !Self::is_no_such_upload(service_err.meta().code()) {
                                warn!(
                                    "S3 abort during reap failed: upload_id={} error={}",
                                    upload_id, service_err
                                );
                            }
                        }
                    }
                }

                if resp.is_truncated() == Some(true) {
                    key_marker = resp.next_key_marker().map(|s| s.to_string());
                    id_marker = resp.next_upload_id_marker().map(|s| s.to_string());
                } else {
                    break;
                }
            }

            Ok(reaped)
        })
    }
}

// -- Tests -------------------------------------------------------------------
