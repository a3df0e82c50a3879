//! Object lifecycle handlers.
//!
//! An object is Unknown (no metadata), Registered (metadata, no content)
//! or Complete (metadata and content).  Registration moves it from
//! Unknown to Registered; an upload, directly through `PUT` or straight
//! to the object store, followed by the verify callback makes it
//! Complete.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{info, warn};

use super::{content_present, context, lookup, lookup_error, read_json, Representation};
use crate::errors::{message_response, LfsError};
use crate::metadata::store::StoreError;
use crate::router::PathVars;
use crate::storage::content::ContentGet;
use crate::storage::valid_oid;
use crate::{AppState, CONTENT_MEDIA_TYPE};

// -- Content ------------------------------------------------------------------

/// GET/HEAD with the content media type: redirect to, or stream, the bytes.
pub async fn get_content(
    state: Arc<AppState>,
    req: Request<Body>,
    vars: PathVars,
) -> Result<Response, LfsError> {
    let ctx = context(req.headers(), &vars);
    let desc = lookup(&state, &ctx).await?;

    match state.content.get(&desc).await {
        Ok(ContentGet::Redirect(location)) => {
            let location = HeaderValue::from_str(&location).map_err(|e| {
                warn!(oid = %desc.oid, error = %e, "unusable redirect location");
                LfsError::Internal
            })?;
            Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response())
        }
        Ok(ContentGet::Stream { body, size }) => Ok((
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_MEDIA_TYPE)),
                (header::CONTENT_LENGTH, HeaderValue::from(size)),
            ],
            body,
        )
            .into_response()),
        Err(StoreError::NotFound) => Err(LfsError::NotFound),
        Err(err) => {
            warn!(op = "content.get", oid = %desc.oid, request_id = %ctx.request_id, error = %err, "store error");
            Err(LfsError::Internal)
        }
    }
}

/// PUT with the content media type: stream the body into the content store.
pub async fn put_content(
    state: Arc<AppState>,
    req: Request<Body>,
    vars: PathVars,
) -> Result<Response, LfsError> {
    // Redirect deployments upload straight to the object store.
    if !state.content.accepts_uploads() {
        return Err(LfsError::MethodNotAllowed);
    }

    let (parts, body) = req.into_parts();
    let ctx = context(&parts.headers, &vars);
    let desc = lookup(&state, &ctx).await?;
    if !desc.writeable {
        return Err(LfsError::Forbidden);
    }

    match state.content.put(&desc, body).await {
        Ok(()) => {
            info!(oid = %desc.oid, size = desc.size, request_id = %ctx.request_id, "content stored");
            Ok(StatusCode::OK.into_response())
        }
        Err(StoreError::Inconsistent) => Err(LfsError::Inconsistent),
        Err(StoreError::NotFound) => Err(LfsError::NotFound),
        Err(err) => {
            warn!(op = "content.put", oid = %desc.oid, request_id = %ctx.request_id, error = %err, "store error");
            Err(LfsError::Internal)
        }
    }
}

/// OPTIONS with the content media type: may the caller upload, and is an
/// upload still needed?
pub async fn options_content(
    state: Arc<AppState>,
    req: Request<Body>,
    vars: PathVars,
) -> Result<Response, LfsError> {
    let ctx = context(req.headers(), &vars);
    let desc = match state.meta.get(&ctx).await {
        Ok(desc) => desc,
        // Unauthorized callers learn nothing about the object.
        Err(err) => {
            return Err(match lookup_error("meta.get", &ctx, err) {
                LfsError::Forbidden => LfsError::Forbidden,
                _ => LfsError::NotFound,
            })
        }
    };

    if !desc.writeable {
        return Err(LfsError::Forbidden);
    }
    if !desc.is_registered() || !content_present(&state, &ctx, &desc).await {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    Ok(StatusCode::OK.into_response())
}

// -- Metadata -----------------------------------------------------------------

/// GET/HEAD with the metadata media type: the object's representation.
pub async fn get_meta(
    state: Arc<AppState>,
    req: Request<Body>,
    vars: PathVars,
) -> Result<Response, LfsError> {
    let ctx = context(req.headers(), &vars);
    let desc = lookup(&state, &ctx).await?;

    let mut rep = Representation::new(&state, &ctx, &desc);
    if desc.writeable && !content_present(&state, &ctx, &desc).await {
        rep = rep.with_upload(&state, &ctx, &desc, false);
    }
    Ok(rep.respond(StatusCode::OK))
}

/// POST to the collection: register the oid and size from the body.
pub async fn post_object(
    state: Arc<AppState>,
    req: Request<Body>,
    vars: PathVars,
) -> Result<Response, LfsError> {
    let (parts, body) = req.into_parts();
    let payload = read_json(&state, body, false).await?;
    if !valid_oid(&payload.oid) {
        return Err(LfsError::BadRequest);
    }

    let mut ctx = context(&parts.headers, &vars);
    ctx.oid = payload.oid;
    ctx.size = payload.size;

    let desc = state.meta.put(&ctx).await.map_err(|err| match err {
        StoreError::Inconsistent => LfsError::Inconsistent,
        err => lookup_error("meta.put", &ctx, err),
    })?;

    let status = if desc.existing {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    let mut rep = Representation::new(&state, &ctx, &desc);
    if !desc.existing || !content_present(&state, &ctx, &desc).await {
        rep = rep.with_upload(&state, &ctx, &desc, true);
    }
    info!(oid = %desc.oid, size = desc.size, existing = desc.existing, request_id = %ctx.request_id, "object registered");
    Ok(rep.respond(status))
}

/// POST to an object: the client reports its upload finished. The content
/// must be present before the metadata store is told.
pub async fn verify_object(
    state: Arc<AppState>,
    req: Request<Body>,
    vars: PathVars,
) -> Result<Response, LfsError> {
    let (parts, body) = req.into_parts();
    let payload = read_json(&state, body, true).await?;

    let mut ctx = context(&parts.headers, &vars);
    if !payload.oid.is_empty() && payload.oid != ctx.oid {
        return Err(LfsError::BadRequest);
    }
    ctx.status = payload.status;
    ctx.body = payload.body;
    info!(
        oid = %ctx.oid,
        status = ctx.status,
        body = %ctx.body,
        request_id = %ctx.request_id,
        "upload callback"
    );

    let desc = lookup(&state, &ctx).await?;
    if !content_present(&state, &ctx, &desc).await {
        return Err(LfsError::NotFound);
    }

    ctx.size = desc.size;
    match state.meta.verify(&ctx).await {
        Ok(()) => Ok(message_response(StatusCode::OK, "ok")),
        Err(StoreError::Unauthorized) => Err(LfsError::Unauthorized),
        Err(StoreError::Forbidden) => Err(LfsError::Forbidden),
        Err(StoreError::NotFound) => Err(LfsError::NotFound),
        Err(err) => {
            warn!(op = "meta.verify", oid = %ctx.oid, request_id = %ctx.request_id, error = %err, "store error");
            Err(LfsError::Internal)
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
