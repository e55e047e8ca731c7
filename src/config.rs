//! Configuration loading and types for BlockDepot.
//!
//! A single YAML file deserializes into [`Config`]; every field has a
//! default, so an empty file (or a missing section) yields a working
//! dev setup: local backend, anonymous callers, metrics on.  Sections
//! cover networking, caller identity, transfer grants, storage
//! backends, upload-session reclamation, logging and observability.

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Caller identity / ownership settings.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Signed transfer-grant settings.
    #[serde(default)]
    pub grants: GrantConfig,

    /// Storage backend settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Upload-session lifecycle settings.
    #[serde(default)]
    pub uploads: UploadConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics and health-probe settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Externally reachable base URL, used when minting local transfer
    /// grants (part-upload and stream URLs).
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_base_url: default_public_base_url(),
        }
    }
}

/// Caller identity settings.
///
/// Identity *verification* lives upstream; this service consumes either a
/// trusted proxy header or a JWT whose subject is the user id.  The
/// defaults are the relaxed development mode: unauthenticated requests
/// run as `default_user_id`.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Accept `X-User-Id` from a trusted fronting proxy.
    #[serde(default = "default_true")]
    pub trust_proxy_header: bool,

    /// HS256 secret for `Authorization: Bearer` tokens.  Empty disables
    /// bearer-token identities.
    #[serde(default)]
    pub jwt_secret: String,

    /// Treat unauthenticated requests as `default_user_id` instead of
    /// rejecting them with 401.
    #[serde(default = "default_true")]
    pub allow_anonymous: bool,

    /// Identity assumed for anonymous requests in development mode.
    #[serde(default = "default_user_id")]
    pub default_user_id: String,

    /// Owner-segment prefix marking shared, world-readable resources
    /// (copy sources and downloads only).
    #[serde(default = "default_shared_namespace_prefix")]
    pub shared_namespace_prefix: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            trust_proxy_header: true,
            jwt_secret: String::new(),
            allow_anonymous: true,
            default_user_id: default_user_id(),
            shared_namespace_prefix: default_shared_namespace_prefix(),
        }
    }
}

/// Signed transfer-grant settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GrantConfig {
    /// HMAC secret for locally issued part-upload and stream URLs.
    #[serde(default = "default_grant_secret")]
    pub secret: String,

    /// Lifetime of part-upload grants in seconds.
    #[serde(default = "default_upload_ttl")]
    pub upload_url_ttl_seconds: u64,

    /// Lifetime of download grants in seconds.
    #[serde(default = "default_download_ttl")]
    pub download_url_ttl_seconds: u64,
}

impl Default for GrantConfig {
    fn default() -> Self {
        Self {
            secret: default_grant_secret(),
            upload_url_ttl_seconds: default_upload_ttl(),
            download_url_ttl_seconds: default_download_ttl(),
        }
    }
}

/// Storage backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend type: `local` or `s3`.
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Local filesystem configuration.
    #[serde(default)]
    pub local: LocalStorageConfig,

    /// S3-compatible object store configuration.
    #[serde(default)]
    pub s3: Option<S3StorageConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            local: LocalStorageConfig::default(),
            s3: None,
        }
    }
}

/// Local filesystem storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalStorageConfig {
    /// Root directory for stored objects.
    #[serde(default = "default_storage_root")]
    pub root_dir: String,
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            root_dir: default_storage_root(),
        }
    }
}

/// S3-compatible object store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct S3StorageConfig {
    /// Backing bucket name.
    pub bucket: String,
    /// Region.
    #[serde(default = "default_region")]
    pub region: String,
    /// Prefix namespacing all coordinator keys inside the bucket.
    #[serde(default)]
    pub prefix: String,
    /// Non-AWS endpoint for S3-compatible stores (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: String,
    /// Path-style addressing, required by most S3-compatible stores.
    #[serde(default)]
    pub use_path_style: bool,
    /// Explicit access key (falls back to env/credential chain).
    #[serde(default)]
    pub access_key_id: String,
    /// Explicit secret key (falls back to env/credential chain).
    #[serde(default)]
    pub secret_access_key: String,
}

/// Upload-session lifecycle configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Age after which an unfinished session is reclaimable, in seconds.
    #[serde(default = "default_session_ttl")]
    pub session_ttl_seconds: u64,

    /// Interval between reclamation sweeps in seconds.  0 disables the
    /// background sweep.
    #[serde(default = "default_gc_interval")]
    pub gc_interval_seconds: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            session_ttl_seconds: default_session_ttl(),
            gc_interval_seconds: default_gc_interval(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default level filter (`RUST_LOG` wins when set).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `text` for humans, `json` for log shippers.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Install the Prometheus recorder and route `/metrics`.
    #[serde(default = "default_true")]
    pub metrics: bool,

    /// Enable the deep `/health` check (includes a backend ping).
    #[serde(default = "default_true")]
    pub health_check: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics: true,
            health_check: true,
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9440
}

fn default_public_base_url() -> String {
    "http://127.0.0.1:9440".to_string()
}

fn default_user_id() -> String {
    "dev-user".to_string()
}

fn default_shared_namespace_prefix() -> String {
    "template-".to_string()
}

fn default_grant_secret() -> String {
    "blockdepot-grant-secret".to_string()
}

fn default_upload_ttl() -> u64 {
    900
}

fn default_download_ttl() -> u64 {
    300
}

fn default_storage_backend() -> String {
    "local".to_string()
}

fn default_storage_root() -> String {
    "./data/objects".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_session_ttl() -> u64 {
    86_400
}

fn default_gc_interval() -> u64 {
    3_600
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}
