//! Coordination services: the control-plane logic between the HTTP
//! surface and the storage adapter.
//!
//! Coordinators own sequencing and validation -- what must be checked
//! and committed in what order -- while the adapter owns the bytes.
//! None of these paths buffer object payloads.

use std::time::Duration;

use chrono::{DateTime, Utc};

pub mod download;
pub mod manifest;
pub mod upload;

/// A short-lived transfer grant.
///
/// Never persisted; expiry is enforced by the grant signature (local
/// backend) or by the presigned URL itself (S3).
#[derive(Debug, Clone)]
pub struct AccessGrant {
    /// URL the client transfers bytes against.
    pub url: String,
    /// Instant after which the URL stops working.
    pub expires_at: DateTime<Utc>,
}

impl AccessGrant {
    pub fn new(url: String, ttl: Duration) -> Self {
        AccessGrant {
            url,
            expires_at: Utc::now() + chrono::Duration::seconds(ttl.as_secs() as i64),
        }
    }
}
