//! Signed transfer grants for locally brokered URLs.
//!
//! The S3 backend presigns its own URLs; the local backend issues URLs
//! that point back at this service's staging and streaming endpoints.
//! A grant covers one method, path and query set, carries a unix expiry,
//! and is authenticated by an HMAC-SHA256 signature (hex-encoded,
//! verified in constant time).  Tampering with any covered component
//! invalidates the signature.

use std::collections::BTreeMap;
use std::time::Duration;

use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Maximum grant lifetime (7 days); longer requests are clamped.
pub const MAX_GRANT_TTL_SECONDS: u64 = 604_800;

/// Characters escaped inside query values (path-safe set leaves `/`).
const QUERY_ENCODE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'%')
    .add(b'&')
    .add(b'+')
    .add(b'=')
    .add(b'?');

/// Why a presented grant was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GrantError {
    #[error("grant has expired")]
    Expired,

    #[error("grant signature mismatch")]
    SignatureMismatch,
}

impl From<GrantError> for crate::errors::ApiError {
    fn from(err: GrantError) -> Self {
        crate::errors::ApiError::Forbidden(err.to_string())
    }
}

/// Signs and verifies grant URLs for locally brokered transfers.
#[derive(Debug, Clone)]
pub struct GrantSigner {
    secret: String,
    base_url: String,
}

impl GrantSigner {
    pub fn new(secret: &str, base_url: &str) -> Self {
        Self {
            secret: secret.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Compute the hex signature over method, path, query and expiry.
    ///
    /// `query` holds decoded key/value pairs, excluding `expires` and
    /// `signature` themselves.
    pub fn sign(&self, method: &str, path: &str, query: &[(String, String)], expires: u64) -> String {
        let string_to_sign = format!(
            "{method}\n{path}\n{}\n{expires}",
            canonical_query(query)
        );
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(string_to_sign.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Build a complete signed URL for `method path?query`, valid for
    /// `ttl` from now.  Returns the URL and its unix expiry.
    pub fn issue(
        &self,
        method: &str,
        path: &str,
        query: &[(String, String)],
        ttl: Duration,
    ) -> (String, u64) {
        let expires = now_unix() + ttl.as_secs().clamp(1, MAX_GRANT_TTL_SECONDS);
        let signature = self.sign(method, path, query, expires);

        let mut url = String::with_capacity(path.len() + 96);
        url.push_str(&self.base_url);
        url.push_str(&encode_path(path));
        let mut sep = '?';
        for (k, v) in query {
            url.push(sep);
            sep = '&';
            url.push_str(k);
            url.push('=');
            url.push_str(&utf8_percent_encode(v, QUERY_ENCODE).to_string());
        }
        url.push(sep);
        url.push_str(&format!("expires={expires}&signature={signature}"));
        (url, expires)
    }

    /// Verify a presented grant against its covered components.
    pub fn verify(
        &self,
        method: &str,
        path: &str,
        query: &[(String, String)],
        expires: u64,
        signature: &str,
    ) -> Result<(), GrantError> {
        if now_unix() > expires {
            return Err(GrantError::Expired);
        }
        let computed = self.sign(method, path, query, expires);
        if !constant_time_eq(&computed, signature) {
            return Err(GrantError::SignatureMismatch);
        }
        Ok(())
    }
}

/// Sorted, re-encoded `k=v&…` form of the covered query pairs.
fn canonical_query(query: &[(String, String)]) -> String {
    let sorted: BTreeMap<&str, &str> = query
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    sorted
        .iter()
        .map(|(k, v)| format!("{k}={}", utf8_percent_encode(v, QUERY_ENCODE)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Percent-encode a decoded URL path, leaving `/` separators intact.
fn encode_path(path: &str) -> String {
    const PATH_ENCODE: &AsciiSet = &CONTROLS
        .add(b' ')
        .add(b'"')
        .add(b'#')
        .add(b'<')
        .add(b'>')
        .add(b'%')
        .add(b'?');
    utf8_percent_encode(path, PATH_ENCODE).to_string()
}

/// Compare two signature strings in constant time.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
