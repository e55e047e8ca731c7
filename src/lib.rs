//! BlockDepot library — storage coordination service.
//!
//! This crate provides the core components for running a storage
//! coordination server: a control plane that validates owner-scoped
//! resource keys, issues time-boxed transfer grants, sequences multipart
//! upload sessions, and maintains append-only version manifests over a
//! pluggable storage backend.  Object bytes flow directly between
//! clients and the backend; this service only brokers access.

use std::sync::Arc;

pub mod auth;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod grants;
pub mod handlers;
pub mod keys;
pub mod metrics;
pub mod server;
pub mod storage;

use crate::config::Config;
use crate::coordinator::download::DownloadCoordinator;
use crate::coordinator::manifest::ManifestService;
use crate::coordinator::upload::UploadCoordinator;
use crate::grants::GrantSigner;
use crate::storage::adapter::StorageAdapter;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Storage adapter (local filesystem or S3).
    pub storage: Arc<dyn StorageAdapter>,
    /// HMAC signer backing local-backend grant URLs.
    pub grants: GrantSigner,
    /// Upload session coordinator.
    pub uploads: UploadCoordinator,
    /// Download grant coordinator.
    pub downloads: DownloadCoordinator,
    /// Version manifest service.
    pub manifests: ManifestService,
}
