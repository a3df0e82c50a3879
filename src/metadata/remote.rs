//! Metadata store backed by a remote HTTP authority.
//!
//! Every call goes through the shared [`BreakerClient`]; a tripped breaker
//! surfaces as [`StoreError::Backend`].  The caller's `Authorization`
//! header is forwarded verbatim so the authority makes all access
//! decisions.
//!
//! | Call   | Request                                         | Outcome                                  |
//! |--------|-------------------------------------------------|------------------------------------------|
//! | get    | `GET  <endpoint>/<user>/<repo>/media/blobs/<oid>` | 200 descriptor, 204 no record but writeable |
//! | put    | `POST <endpoint>/<user>/<repo>/media/blobs/<oid>` | 201 created, 200 existing, 403 forbidden  |
//! | verify | `POST .../media/blobs/<oid>/verify`               | 200 ok, 403 forbidden                     |

use hmac::{Hmac, Mac};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use sha2::Sha256;
use tracing::{info, warn};

use super::store::{MetaStore, ObjectDescriptor, RequestContext, StoreError, StoreFuture};
use crate::breaker::BreakerClient;
use crate::config::RemoteMetaConfig;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the body signature.
pub const CONTENT_HMAC: &str = "Content-Hmac";

/// Header carrying the request id to the authority.
pub const REQUEST_ID: &str = "X-Request-Id";

#[derive(Serialize)]
struct Registration<'a> {
    oid: &'a str,
    size: u64,
}

/// Client for the metadata authority.
pub struct RemoteMetaStore {
    client: BreakerClient,
    endpoint: String,
    api_media_type: String,
    hmac_key: Option<Vec<u8>>,
    verify_authorization: Option<String>,
}

impl RemoteMetaStore {
    /// Create a store talking to `config.endpoint` through `client`.
    pub fn new(config: &RemoteMetaConfig, client: BreakerClient) -> Self {
        Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_media_type: config.api_media_type.clone(),
            hmac_key: (!config.hmac_key.is_empty()).then(|| config.hmac_key.as_bytes().to_vec()),
            verify_authorization: (!config.verify_authorization.is_empty())
                .then(|| config.verify_authorization.clone()),
        }
    }

    fn blob_url(&self, ctx: &RequestContext) -> String {
        format!(
            "{}/{}/{}/media/blobs/{}",
            self.endpoint, ctx.user, ctx.repo, ctx.oid
        )
    }

    fn request(
        &self,
        method: Method,
        url: String,
        ctx: &RequestContext,
        authorization: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .http()
            .request(method, url)
            .header(ACCEPT, &self.api_media_type);
        if let Some(auth) = authorization {
            builder = builder.header(AUTHORIZATION, auth);
        }
        if !ctx.request_id.is_empty() {
            builder = builder.header(REQUEST_ID, &ctx.request_id);
        }
        builder
    }

    /// POST `{"oid","size"}`, signing the body when a key is configured.
    fn signed_post(
        &self,
        url: String,
        ctx: &RequestContext,
        authorization: Option<&str>,
    ) -> Result<reqwest::Request, StoreError> {
        let body = serde_json::to_vec(&Registration {
            oid: &ctx.oid,
            size: ctx.size,
        })?;
        let mut builder = self
            .request(Method::POST, url, ctx, authorization)
            .header(CONTENT_TYPE, &self.api_media_type);
        if let Some(key) = &self.hmac_key {
            builder = builder.header(CONTENT_HMAC, content_hmac(key, &body));
        }
        Ok(builder.body(body).build()?)
    }

    async fn get_remote(&self, ctx: &RequestContext) -> Result<ObjectDescriptor, StoreError> {
        let request = self
            .request(Method::GET, self.blob_url(ctx), ctx, ctx.authorization.as_deref())
            .build()?;
        let response = self.client.execute(request).await.map_err(|err| {
            warn!(op = "meta.get", oid = %ctx.oid, err = %err, "metadata lookup failed");
            StoreError::from(err)
        })?;

        let status = response.status();
        info!(op = "meta.get", oid = %ctx.oid, status = status.as_u16());
        match status {
            StatusCode::OK => Ok(response.json::<ObjectDescriptor>().await?),
            // No record, but the caller may register it.
            StatusCode::NO_CONTENT => Ok(ObjectDescriptor {
                writeable: true,
                ..ObjectDescriptor::default()
            }),
            StatusCode::UNAUTHORIZED => Err(StoreError::Unauthorized),
            StatusCode::FORBIDDEN => Err(StoreError::Forbidden),
            s if s.is_server_error() => Err(anyhow::anyhow!("meta.get status: {}", s).into()),
            _ => Err(StoreError::NotFound),
        }
    }

    async fn put_remote(&self, ctx: &RequestContext) -> Result<ObjectDescriptor, StoreError> {
        let request = self.signed_post(self.blob_url(ctx), ctx, ctx.authorization.as_deref())?;
        let response = self.client.execute(request).await.map_err(|err| {
            warn!(op = "meta.send", oid = %ctx.oid, err = %err, "metadata registration failed");
            StoreError::from(err)
        })?;

        let status = response.status();
        info!(op = "meta.send", oid = %ctx.oid, status = status.as_u16());
        match status {
            StatusCode::OK | StatusCode::CREATED => {
                let mut desc: ObjectDescriptor = response.json().await?;
                desc.existing = status == StatusCode::OK;
                Ok(desc)
            }
            StatusCode::UNAUTHORIZED => Err(StoreError::Unauthorized),
            StatusCode::FORBIDDEN => Err(StoreError::Forbidden),
            StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => Err(StoreError::Inconsistent),
            s => Err(anyhow::anyhow!("meta.send status: {}", s).into()),
        }
    }

    async fn verify_remote(&self, ctx: &RequestContext) -> Result<(), StoreError> {
        let url = format!("{}/verify", self.blob_url(ctx));
        let authorization = self
            .verify_authorization
            .as_deref()
            .or(ctx.authorization.as_deref());
        let request = self.signed_post(url, ctx, authorization)?;
        let response = self.client.execute(request).await.map_err(|err| {
            warn!(op = "meta.verify", oid = %ctx.oid, err = %err, "metadata verify failed");
            StoreError::from(err)
        })?;

        let status = response.status();
        info!(op = "meta.verify", oid = %ctx.oid, status = status.as_u16());
        match status {
            StatusCode::OK => Ok(()),
            StatusCode::FORBIDDEN => Err(StoreError::Forbidden),
            s => Err(anyhow::anyhow!("meta.verify status: {}", s).into()),
        }
    }
}

impl MetaStore for RemoteMetaStore {
    fn get<'a>(&'a self, ctx: &'a RequestContext) -> StoreFuture<'a, ObjectDescriptor> {
        Box::pin(self.get_remote(ctx))
    }

    fn put<'a>(&'a self, ctx: &'a RequestContext) -> StoreFuture<'a, ObjectDescriptor> {
        Box::pin(self.put_remote(ctx))
    }

    fn verify<'a>(&'a self, ctx: &'a RequestContext) -> StoreFuture<'a, ()> {
        Box::pin(self.verify_remote(ctx))
    }
}

/// `sha256 <hex HMAC-SHA256 of body>`.
pub fn content_hmac(key: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(body);
    format!("sha256 {}", hex::encode(mac.finalize().into_bytes()))
}
