//! Protocol handlers and the route table.
//!
//! Every object route answers one of two media types: raw bytes
//! ([`CONTENT_MEDIA_TYPE`]) or the JSON representation
//! ([`META_MEDIA_TYPE`]).  Handlers build a [`RequestContext`] from the
//! path and headers, consult the metadata store first, and only then
//! touch content.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::LfsError;
use crate::metadata::store::{ObjectDescriptor, RequestContext, StoreError};
use crate::router::{MediaRouter, PathVars};
use crate::storage::content::Link;
use crate::{AppState, CONTENT_MEDIA_TYPE, META_MEDIA_TYPE};

pub mod object;

/// A single object.
pub const OBJECT_ROUTE: &str = "/{user}/{repo}/objects/{oid}";

/// The object collection of a repository.
pub const OBJECTS_ROUTE: &str = "/{user}/{repo}/objects";

/// Build the protocol router. The object route is registered before the
/// collection route.
pub fn routes(state: Arc<AppState>) -> MediaRouter<AppState> {
    MediaRouter::new(state)
        .handle(OBJECT_ROUTE, CONTENT_MEDIA_TYPE, Method::GET, object::get_content)
        .handle(OBJECT_ROUTE, CONTENT_MEDIA_TYPE, Method::HEAD, object::get_content)
        .handle(OBJECT_ROUTE, META_MEDIA_TYPE, Method::GET, object::get_meta)
        .handle(OBJECT_ROUTE, META_MEDIA_TYPE, Method::HEAD, object::get_meta)
        .handle(OBJECT_ROUTE, CONTENT_MEDIA_TYPE, Method::OPTIONS, object::options_content)
        .handle(OBJECT_ROUTE, CONTENT_MEDIA_TYPE, Method::PUT, object::put_content)
        .handle(OBJECT_ROUTE, META_MEDIA_TYPE, Method::POST, object::verify_object)
        .handle(OBJECTS_ROUTE, META_MEDIA_TYPE, Method::POST, object::post_object)
}

// -- Request context ----------------------------------------------------------

/// Context for one request: path segments, credential, request id.
pub(crate) fn context(headers: &HeaderMap, vars: &PathVars) -> RequestContext {
    RequestContext {
        user: vars.get("user").to_string(),
        repo: vars.get("repo").to_string(),
        oid: vars.get("oid").to_string(),
        authorization: headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        request_id: vars.request_id().to_string(),
        ..RequestContext::default()
    }
}

/// JSON body accepted by registration and the verify callback.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ObjectRequest {
    #[serde(default)]
    pub oid: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub status: i64,
    #[serde(default)]
    pub body: String,
}

/// Read a JSON request body, bounded by `server.max_json_body`. An empty
/// body decodes to the default when `optional` is set.
pub(crate) async fn read_json(
    state: &AppState,
    body: Body,
    optional: bool,
) -> Result<ObjectRequest, LfsError> {
    let bytes = axum::body::to_bytes(body, state.config.server.max_json_body)
        .await
        .map_err(|e| {
            debug!(error = %e, "failed to read request body");
            LfsError::BadRequest
        })?;
    if optional && bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(ObjectRequest::default());
    }
    serde_json::from_slice(&bytes).map_err(|e| {
        debug!(error = %e, "invalid JSON body");
        LfsError::BadRequest
    })
}

// -- Representation -----------------------------------------------------------

/// Client-facing view of an object and the links it may follow.
#[derive(Debug, Serialize)]
pub struct Representation {
    pub oid: String,
    pub size: u64,
    #[serde(rename = "_links")]
    pub links: BTreeMap<&'static str, Link>,
}

impl Representation {
    /// Representation with the `download` link.
    pub(crate) fn new(state: &AppState, ctx: &RequestContext, desc: &ObjectDescriptor) -> Self {
        let mut links = BTreeMap::new();
        links.insert("download", Link::new(object_href(state, ctx, &desc.oid)));
        Self {
            oid: desc.oid.clone(),
            size: desc.size,
            links,
        }
    }

    /// Add the `upload` link from the content store and the `callback` link.
    pub(crate) fn with_upload(
        mut self,
        state: &AppState,
        ctx: &RequestContext,
        desc: &ObjectDescriptor,
        callback: bool,
    ) -> Self {
        let href = object_href(state, ctx, &desc.oid);
        let upload = state
            .content
            .upload_link(desc, &href, ctx.authorization.as_deref());
        self.links.insert("upload", upload);
        if callback {
            self.links.insert(
                "callback",
                Link::new(href).with_header("Accept", META_MEDIA_TYPE),
            );
        }
        self
    }

    pub(crate) fn respond(self, status: StatusCode) -> Response {
        match serde_json::to_vec(&self) {
            Ok(body) => (
                status,
                [(header::CONTENT_TYPE, HeaderValue::from_static(META_MEDIA_TYPE))],
                body,
            )
                .into_response(),
            Err(e) => {
                warn!(error = %e, "failed to encode representation");
                LfsError::Internal.into_response()
            }
        }
    }
}

/// This server's URL for an object.
pub(crate) fn object_href(state: &AppState, ctx: &RequestContext, oid: &str) -> String {
    let server = &state.config.server;
    format!(
        "{}://{}/{}/{}/objects/{}",
        server.scheme, server.public_host, ctx.user, ctx.repo, oid
    )
}

// -- Store access -------------------------------------------------------------

/// Look up a registered object. Anything but an auth failure reads as
/// "not found" to the client.
pub(crate) async fn lookup(
    state: &AppState,
    ctx: &RequestContext,
) -> Result<ObjectDescriptor, LfsError> {
    match state.meta.get(ctx).await {
        Ok(desc) if desc.is_registered() => Ok(desc),
        Ok(_) => Err(LfsError::NotFound),
        Err(err) => Err(lookup_error("meta.get", ctx, err)),
    }
}

pub(crate) fn lookup_error(op: &str, ctx: &RequestContext, err: StoreError) -> LfsError {
    match err {
        StoreError::Unauthorized => LfsError::Unauthorized,
        StoreError::Forbidden => LfsError::Forbidden,
        StoreError::NotFound => LfsError::NotFound,
        err => {
            warn!(op, oid = %ctx.oid, request_id = %ctx.request_id, error = %err, "store error");
            LfsError::NotFound
        }
    }
}

/// Whether the object's bytes are present. Store failures read as absent.
pub(crate) async fn content_present(
    state: &AppState,
    ctx: &RequestContext,
    desc: &ObjectDescriptor,
) -> bool {
    match state.content.exists(desc).await {
        Ok(present) => present,
        Err(err) => {
            warn!(op = "content.exists", oid = %desc.oid, request_id = %ctx.request_id, error = %err, "store error");
            false
        }
    }
}
