//! Resource key model.
//!
//! Every stored resource is addressed by a four-segment key
//! `owner_id/block_id/version_id/filename`.  Keys are parsed and
//! validated here, once, before anything touches a backend.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::errors::ApiError;

/// Maximum accepted key length in bytes.
pub const MAX_KEY_BYTES: usize = 1024;

/// Why a raw key string was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidKey {
    #[error("resource keys have exactly four segments: owner_id/block_id/version_id/filename")]
    SegmentCount,

    #[error("key segment {0:?} is not allowed")]
    BadSegment(String),

    #[error("key exceeds {MAX_KEY_BYTES} bytes")]
    TooLong,
}

impl From<InvalidKey> for ApiError {
    fn from(err: InvalidKey) -> Self {
        ApiError::Validation(err.to_string())
    }
}

/// Returns true when `segment` may appear in a resource key.
///
/// Segments are non-empty, are not `.` or `..`, do not begin with `.`
/// (dot-prefixed names are reserved for service-internal documents), and
/// contain no separators or control characters.
pub fn valid_segment(segment: &str) -> bool {
    if segment.is_empty() || segment.starts_with('.') {
        return false;
    }
    !segment
        .chars()
        .any(|c| c == '/' || c == '\\' || c.is_control())
}

/// A fully-qualified resource address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub owner_id: String,
    pub block_id: String,
    pub version_id: String,
    pub filename: String,
}

impl ResourceKey {
    /// Build a key from pre-split segments, validating each.
    pub fn new(
        owner_id: &str,
        block_id: &str,
        version_id: &str,
        filename: &str,
    ) -> Result<Self, InvalidKey> {
        for segment in [owner_id, block_id, version_id, filename] {
            if !valid_segment(segment) {
                return Err(InvalidKey::BadSegment(segment.to_string()));
            }
        }
        let key = ResourceKey {
            owner_id: owner_id.to_string(),
            block_id: block_id.to_string(),
            version_id: version_id.to_string(),
            filename: filename.to_string(),
        };
        if key.to_string().len() > MAX_KEY_BYTES {
            return Err(InvalidKey::TooLong);
        }
        Ok(key)
    }

    /// Parse a raw `owner/block/version/filename` string.
    pub fn parse(raw: &str) -> Result<Self, InvalidKey> {
        if raw.len() > MAX_KEY_BYTES {
            return Err(InvalidKey::TooLong);
        }
        let mut parts = raw.split('/');
        let (owner, block, version, filename) = match (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) {
            (Some(o), Some(b), Some(v), Some(f), None) => (o, b, v, f),
            _ => return Err(InvalidKey::SegmentCount),
        };
        ResourceKey::new(owner, block, version, filename)
    }

    /// The storage-facing string form of this key.
    pub fn storage_key(&self) -> String {
        self.to_string()
    }

    /// True when the owner segment falls under the shared namespace
    /// (readable by any authenticated caller, usable as a copy source).
    pub fn is_shared(&self, shared_prefix: &str) -> bool {
        !shared_prefix.is_empty() && self.owner_id.starts_with(shared_prefix)
    }

    /// Version scope this key belongs to.
    pub fn scope(&self) -> VersionScope {
        VersionScope {
            owner_id: self.owner_id.clone(),
            block_id: self.block_id.clone(),
            version_id: self.version_id.clone(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.owner_id, self.block_id, self.version_id, self.filename
        )
    }
}

impl FromStr for ResourceKey {
    type Err = InvalidKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKey::parse(s)
    }
}

/// An `(owner, block, version)` triple: the unit a manifest describes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionScope {
    pub owner_id: String,
    pub block_id: String,
    pub version_id: String,
}

impl VersionScope {
    pub fn new(owner_id: &str, block_id: &str, version_id: &str) -> Result<Self, InvalidKey> {
        for segment in [owner_id, block_id, version_id] {
            if !valid_segment(segment) {
                return Err(InvalidKey::BadSegment(segment.to_string()));
            }
        }
        Ok(VersionScope {
            owner_id: owner_id.to_string(),
            block_id: block_id.to_string(),
            version_id: version_id.to_string(),
        })
    }

    /// Storage prefix covering every file of this version, trailing slash
    /// included.
    pub fn prefix(&self) -> String {
        format!("{}/{}/{}/", self.owner_id, self.block_id, self.version_id)
    }

    pub fn is_shared(&self, shared_prefix: &str) -> bool {
        !shared_prefix.is_empty() && self.owner_id.starts_with(shared_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roundtrip() {
        let key = ResourceKey::parse("alice/report/v42/data.bin").unwrap();
        assert_eq!(key.owner_id, "alice");
        assert_eq!(key.block_id, "report");
        assert_eq!(key.version_id, "v42");
        assert_eq!(key.filename, "data.bin");
        assert_eq!(key.to_string(), "alice/report/v42/data.bin");
    }

    #[test]
    fn test_segment_count_enforced() {
        assert_eq!(
            ResourceKey::parse("alice/report/v42"),
            Err(InvalidKey::SegmentCount)
        );
        assert_eq!(
            ResourceKey::parse("alice/report/v42/data/extra"),
            Err(InvalidKey::SegmentCount)
        );
        assert_eq!(ResourceKey::parse(""), Err(InvalidKey::SegmentCount));
    }

    #[test]
    fn test_empty_segment_rejected() {
        assert!(ResourceKey::parse("alice//v42/data.bin").is_err());
        assert!(ResourceKey::parse("/report/v42/data.bin").is_err());
        assert!(ResourceKey::parse("alice/report/v42/").is_err());
    }

    #[test]
    fn test_traversal_segments_rejected() {
        assert!(ResourceKey::parse("alice/../v42/data.bin").is_err());
        assert!(ResourceKey::parse("../report/v42/data.bin").is_err());
        assert!(ResourceKey::parse("alice/report/./data.bin").is_err());
    }

    #[test]
    fn test_reserved_dot_prefix_rejected() {
        assert!(ResourceKey::parse("alice/report/v42/.manifest.json").is_err());
        assert!(ResourceKey::parse(".uploads/report/v42/data.bin").is_err());
    }

    #[test]
    fn test_backslash_and_control_chars_rejected() {
        assert!(ResourceKey::parse("alice/re\\port/v42/data.bin").is_err());
        assert!(ResourceKey::parse("alice/report/v42/da\ta.bin").is_err());
    }

    #[test]
    fn test_key_length_capped() {
        let long = "a".repeat(MAX_KEY_BYTES);
        let raw = format!("{long}/b/c/d");
        assert_eq!(ResourceKey::parse(&raw), Err(InvalidKey::TooLong));
    }

    #[test]
    fn test_shared_namespace() {
        let key = ResourceKey::parse("template-shapes/starter/v1/shape.bin").unwrap();
        assert!(key.is_shared("template-"));
        assert!(!key.is_shared("lib-"));
        assert!(!key.is_shared(""));

        let key = ResourceKey::parse("alice/starter/v1/shape.bin").unwrap();
        assert!(!key.is_shared("template-"));
    }

    #[test]
    fn test_version_scope_prefix() {
        let scope = VersionScope::new("alice", "report", "v42").unwrap();
        assert_eq!(scope.prefix(), "alice/report/v42/");
        let key = ResourceKey::parse("alice/report/v42/data.bin").unwrap();
        assert_eq!(key.scope(), scope);
    }
}
