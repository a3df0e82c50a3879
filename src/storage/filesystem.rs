//! Local filesystem content store.
//!
//! Objects live at `<root>/<oid[0..2]>/<oid[2..4]>/<oid>`.  Uploads stream
//! into a hidden temp file in the same shard directory while being hashed,
//! are checked against the descriptor, fsynced, then renamed into place, so
//! readers only ever see complete objects.

use std::path::{Path, PathBuf};

use axum::body::Body;
use http_body_util::BodyExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use super::content::{ContentGet, ContentStore, Link};
use super::{oid_path, valid_oid};
use crate::metadata::store::{ObjectDescriptor, StoreError, StoreFuture};
use crate::CONTENT_MEDIA_TYPE;

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Backend(err.into())
    }
}

/// Stores object bytes on the local filesystem.
pub struct FilesystemContentStore {
    root: PathBuf,
}

impl FilesystemContentStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Absolute path of an object. Rejects oids that are not hex.
    fn path_for(&self, oid: &str) -> Result<PathBuf, StoreError> {
        if !valid_oid(oid) {
            return Err(StoreError::NotFound);
        }
        Ok(self.root.join(oid_path(oid).trim_start_matches('/')))
    }

    async fn write_temp(
        &self,
        tmp: &Path,
        desc: &ObjectDescriptor,
        mut body: Body,
    ) -> Result<(), StoreError> {
        let mut file = tokio::fs::File::create(tmp).await?;
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;

        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|e| StoreError::Backend(anyhow::anyhow!(e)))?;
            let Ok(data) = frame.into_data() else {
                continue;
            };
            written += data.len() as u64;
            if written > desc.size {
                debug!(oid = %desc.oid, expected = desc.size, "upload exceeds registered size");
                return Err(StoreError::Inconsistent);
            }
            hasher.update(&data);
            file.write_all(&data).await?;
        }

        if written != desc.size {
            debug!(oid = %desc.oid, expected = desc.size, written, "upload size mismatch");
            return Err(StoreError::Inconsistent);
        }
        // Only SHA-256 oids can be checked against the content.
        if desc.oid.len() == 64 {
            let digest = hex::encode(hasher.finalize());
            if !digest.eq_ignore_ascii_case(&desc.oid) {
                debug!(oid = %desc.oid, digest = %digest, "upload hash mismatch");
                return Err(StoreError::Inconsistent);
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
}

impl ContentStore for FilesystemContentStore {
    fn get<'a>(&'a self, desc: &'a ObjectDescriptor) -> StoreFuture<'a, ContentGet> {
        Box::pin(async move {
            let path = self.path_for(&desc.oid)?;
            let file = match tokio::fs::File::open(&path).await {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(StoreError::NotFound)
                }
                Err(e) => return Err(e.into()),
            };
            let size = file.metadata().await?.len();
            Ok(ContentGet::Stream {
                body: Body::from_stream(ReaderStream::new(file)),
                size,
            })
        })
    }

    fn put<'a>(&'a self, desc: &'a ObjectDescriptor, body: Body) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let path = self.path_for(&desc.oid)?;
            let dir = path
                .parent()
                .ok_or_else(|| anyhow::anyhow!("object path has no parent: {}", path.display()))?;
            tokio::fs::create_dir_all(dir).await?;

            let tmp = dir.join(format!(".{}.tmp.{}", desc.oid, uuid::Uuid::new_v4()));
            let result = match self.write_temp(&tmp, desc, body).await {
                Ok(()) => tokio::fs::rename(&tmp, &path).await.map_err(StoreError::from),
                Err(e) => Err(e),
            };
            if result.is_err() {
                if let Err(e) = tokio::fs::remove_file(&tmp).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %tmp.display(), error = %e, "failed to remove temp file");
                    }
                }
            }
            result
        })
    }

    fn exists<'a>(&'a self, desc: &'a ObjectDescriptor) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            match self.path_for(&desc.oid) {
                Ok(path) => Ok(tokio::fs::try_exists(&path).await?),
                Err(_) => Ok(false),
            }
        })
    }

    fn accepts_uploads(&self) -> bool {
        true
    }

    fn upload_link(
        &self,
        _desc: &ObjectDescriptor,
        object_href: &str,
        authorization: Option<&str>,
    ) -> Link {
        let link = Link::new(object_href).with_header("Accept", CONTENT_MEDIA_TYPE);
        match authorization {
            Some(auth) => link.with_header("Authorization", auth),
            None => link,
        }
    }
}
