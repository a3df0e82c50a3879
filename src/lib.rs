//! lfs-gateway library: a content-addressed large-file server.
//!
//! Clients negotiate object existence and transfer permission with
//! media-type-negotiated HTTP requests, then move bytes either through
//! this server (filesystem content store) or directly against an
//! S3-compatible bucket using signed URLs (S3 content store).  A metadata
//! authority, local SQLite or a remote HTTP API behind a circuit breaker,
//! decides what each caller may see and write.

use std::sync::Arc;

use tracing::info;

pub mod breaker;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod listener;
pub mod metadata;
pub mod metrics;
pub mod router;
pub mod server;
pub mod signer;
pub mod storage;

use crate::breaker::BreakerClient;
use crate::config::Config;
use crate::metadata::store::MetaStore;
use crate::storage::content::ContentStore;

/// Media type for raw object bytes.
pub const CONTENT_MEDIA_TYPE: &str = "application/vnd.git-media";

/// Media type for JSON object representations.
pub const META_MEDIA_TYPE: &str = "application/vnd.git-media+json";

/// Shared application state handed to every protocol handler.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Metadata authority (local SQLite or remote API).
    pub meta: Arc<dyn MetaStore>,
    /// Object bytes (local filesystem or S3 redirects).
    pub content: Arc<dyn ContentStore>,
}

impl AppState {
    /// Open the stores named by `config`. Errors here are fatal at startup.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let client = BreakerClient::new(&config.breaker)?;

        let meta: Arc<dyn MetaStore> = match config.metadata.backend.as_str() {
            "remote" => {
                let remote = &config.metadata.remote;
                info!(endpoint = %remote.endpoint, "remote metadata store");
                Arc::new(metadata::remote::RemoteMetaStore::new(
                    remote,
                    client.clone(),
                ))
            }
            _ => {
                let path = &config.metadata.local.path;
                if let Some(parent) = std::path::Path::new(path).parent() {
                    std::fs::create_dir_all(parent)?;
                }
                info!(path = %path, "local metadata store");
                Arc::new(metadata::sqlite::LocalMetaStore::new(path)?)
            }
        };

        let content: Arc<dyn ContentStore> = match config.content.backend.as_str() {
            "s3" => {
                let s3 = &config.content.s3;
                info!(bucket = %s3.bucket, region = %s3.region, "s3 content store");
                Arc::new(storage::s3::S3ContentStore::new(s3, client)?)
            }
            _ => {
                let root = &config.content.filesystem.root_dir;
                info!(root = %root, "filesystem content store");
                Arc::new(storage::filesystem::FilesystemContentStore::new(root)?)
            }
        };

        Ok(Self {
            config,
            meta,
            content,
        })
    }
}
