//! Redirecting S3 content store.
//!
//! Never carries object bytes: downloads are answered with a presigned
//! GET redirect, uploads with a header-signed PUT link whose
//! `x-amz-content-sha256` pins the payload to the oid, and existence is
//! checked with a short-lived presigned HEAD through the breaker client.

use axum::body::Body;
use chrono::Utc;
use reqwest::StatusCode;
use tracing::debug;

use super::content::{ContentGet, ContentStore, Link};
use super::oid_path;
use crate::breaker::BreakerClient;
use crate::config::S3Config;
use crate::metadata::store::{ObjectDescriptor, StoreError, StoreFuture};
use crate::signer::S3Signer;

/// Content store that hands clients signed S3 URLs.
pub struct S3ContentStore {
    signer: S3Signer,
    client: BreakerClient,
    path_prefix: String,
    download_expires: u64,
    exists_expires: u64,
}

impl S3ContentStore {
    pub fn new(config: &S3Config, client: BreakerClient) -> anyhow::Result<Self> {
        Ok(Self {
            signer: S3Signer::new(config)?,
            client,
            path_prefix: config.path_prefix.trim_matches('/').to_string(),
            download_expires: config.download_expires,
            exists_expires: config.exists_expires,
        })
    }

    /// Object key: configured prefix, then the descriptor's prefix, then the sharded oid path.
    fn key(&self, desc: &ObjectDescriptor) -> String {
        let mut key = String::new();
        for prefix in [self.path_prefix.as_str(), desc.path_prefix.trim_matches('/')] {
            if !prefix.is_empty() {
                key.push('/');
                key.push_str(prefix);
            }
        }
        key.push_str(&oid_path(&desc.oid));
        key
    }
}

impl ContentStore for S3ContentStore {
    fn get<'a>(&'a self, desc: &'a ObjectDescriptor) -> StoreFuture<'a, ContentGet> {
        Box::pin(async move {
            let token = self
                .signer
                .presign("GET", &self.key(desc), self.download_expires, Utc::now());
            Ok(ContentGet::Redirect(token.location))
        })
    }

    fn put<'a>(&'a self, _desc: &'a ObjectDescriptor, _body: Body) -> StoreFuture<'a, ()> {
        Box::pin(async move { Err(StoreError::Unsupported) })
    }

    fn exists<'a>(&'a self, desc: &'a ObjectDescriptor) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let token = self
                .signer
                .presign("HEAD", &self.key(desc), self.exists_expires, Utc::now());
            let request = self.client.http().head(&token.location).build()?;
            let response = self.client.execute(request).await?;
            debug!(oid = %desc.oid, status = response.status().as_u16(), "object store HEAD");
            Ok(response.status() == StatusCode::OK)
        })
    }

    fn accepts_uploads(&self) -> bool {
        false
    }

    fn upload_link(
        &self,
        desc: &ObjectDescriptor,
        _object_href: &str,
        _authorization: Option<&str>,
    ) -> Link {
        let token = self
            .signer
            .sign_header("PUT", &self.key(desc), &desc.oid, None, Utc::now());
        Link::new(token.location)
            .with_header("Authorization", token.token)
            .with_header("x-amz-content-sha256", desc.oid.clone())
            .with_header("Date", httpdate::fmt_http_date(token.time.into()))
    }
}
