//! Media-type protocol router.
//!
//! Routes are `{name}` patterns.  Each pattern owns a table keyed by
//! (Accept media type, method).  The first pattern whose segments match
//! the path decides the request: when its table has no entry the answer
//! is 404, later patterns are not consulted.  Register most-specific
//! patterns first.
//!
//! Captured segments travel to the handler in a [`PathVars`] value owned
//! by that call, so nothing outlives the request.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, Request};
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use tracing::{error, info};

use crate::errors::{generate_request_id, LfsError};

/// Boxed future produced by a registered handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

type BoxedHandler<S> = Arc<dyn Fn(Arc<S>, Request<Body>, PathVars) -> HandlerFuture + Send + Sync>;

/// Values captured from the path, plus the request id.
#[derive(Debug, Clone, Default)]
pub struct PathVars {
    vars: HashMap<String, String>,
    request_id: String,
}

impl PathVars {
    /// Captured segment, or `""` when the pattern has no such placeholder.
    pub fn get(&self, name: &str) -> &str {
        self.vars.get(name).map(String::as_str).unwrap_or("")
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Var(String),
}

struct Route<S> {
    pattern: String,
    segments: Vec<Segment>,
    handlers: HashMap<(String, Method), BoxedHandler<S>>,
}

impl<S> Route<S> {
    fn new(pattern: &str) -> Self {
        let segments = split(pattern)
            .map(|seg| match seg.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                Some(name) => Segment::Var(name.to_string()),
                None => Segment::Literal(seg.to_string()),
            })
            .collect();
        Self {
            pattern: pattern.to_string(),
            segments,
            handlers: HashMap::new(),
        }
    }

    /// Captured variables when `path` has this route's shape.
    fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let parts: Vec<&str> = split(path).collect();
        if parts.len() != self.segments.len() {
            return None;
        }
        let mut vars = HashMap::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(lit) if lit == part => {}
                Segment::Var(name) if !part.is_empty() => {
                    vars.insert(name.clone(), part.to_string());
                }
                _ => return None,
            }
        }
        Some(vars)
    }
}

fn split(path: &str) -> impl Iterator<Item = &str> {
    path.trim_start_matches('/').split('/')
}

/// Media type from the `Accept` header, parameters dropped.
pub fn accept_media_type(headers: &HeaderMap) -> String {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}

/// Router dispatching on path pattern, Accept media type, and method.
pub struct MediaRouter<S> {
    state: Arc<S>,
    routes: Vec<Route<S>>,
}

impl<S: Send + Sync + 'static> MediaRouter<S> {
    pub fn new(state: Arc<S>) -> Self {
        Self {
            state,
            routes: Vec::new(),
        }
    }

    /// Register `handler` for `(media_type, method)` on `pattern`. A pattern
    /// registered again reuses its original position.
    pub fn handle<F, Fut, R>(mut self, pattern: &str, media_type: &str, method: Method, handler: F) -> Self
    where
        F: Fn(Arc<S>, Request<Body>, PathVars) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoResponse,
    {
        let idx = match self.routes.iter().position(|r| r.pattern == pattern) {
            Some(idx) => idx,
            None => {
                self.routes.push(Route::new(pattern));
                self.routes.len() - 1
            }
        };
        let boxed: BoxedHandler<S> = Arc::new(move |state, req, vars| {
            let fut = handler(state, req, vars);
            Box::pin(async move { fut.await.into_response() })
        });
        self.routes[idx]
            .handlers
            .insert((media_type.to_string(), method), boxed);
        self
    }

    /// Route one request and log its outcome.
    pub async fn dispatch(&self, req: Request<Body>) -> Response {
        let request_id = generate_request_id();
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let media_type = accept_media_type(req.headers());

        let handler = self
            .routes
            .iter()
            .find_map(|route| route.matches(&path).map(|vars| (route, vars)))
            .and_then(|(route, vars)| {
                route
                    .handlers
                    .get(&(media_type.clone(), method.clone()))
                    .map(|h| (h.clone(), vars))
            });

        let mut response = match handler {
            Some((handler, vars)) => {
                let vars = PathVars {
                    vars,
                    request_id: request_id.clone(),
                };
                // A panicking handler still gets an access line and a 500.
                match AssertUnwindSafe(handler(self.state.clone(), req, vars))
                    .catch_unwind()
                    .await
                {
                    Ok(response) => response,
                    Err(panic) => {
                        error!(
                            method = %method,
                            path = %path,
                            request_id = %request_id,
                            panic = %panic_message(panic.as_ref()),
                            "handler panicked"
                        );
                        LfsError::Internal.into_response()
                    }
                }
            }
            None => LfsError::NotFound.into_response(),
        };

        if method == Method::HEAD {
            let (parts, _) = response.into_parts();
            response = Response::from_parts(parts, Body::empty());
        }
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert("x-request-id", value);
        }

        info!(
            method = %method,
            path = %path,
            accept = %media_type,
            status = response.status().as_u16(),
            request_id = %request_id,
            "request"
        );
        response
    }
}

/// Text carried by a panic payload, when it has any.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    const META: &str = "application/vnd.git-media+json";
    const CONTENT: &str = "application/vnd.git-media";

    fn request(method: Method, path: &str, accept: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(accept) = accept {
            builder = builder.header("accept", accept);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_string(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn router() -> MediaRouter<()> {
        MediaRouter::new(Arc::new(()))
            .handle(
                "/{user}/{repo}/objects/{oid}",
                META,
                Method::GET,
                |_, _, vars: PathVars| async move {
                    format!("meta {} {} {}", vars.get("user"), vars.get("repo"), vars.get("oid"))
                },
            )
            .handle(
                "/{user}/{repo}/objects/{oid}",
                CONTENT,
                Method::GET,
                |_, _, vars: PathVars| async move { format!("content {}", vars.get("oid")) },
            )
            .handle(
                "/{user}/{repo}/objects",
                META,
                Method::POST,
                |_, _, _| async { "register" },
            )
            .handle(
                "/{user}/{repo}/{kind}/{oid}",
                META,
                Method::DELETE,
                |_, _, _| async { "never reached" },
            )
    }

    #[tokio::test]
    async fn test_dispatch_by_media_type() {
        let r = router();
        let resp = r
            .dispatch(request(Method::GET, "/alice/photos/objects/abc", Some(META)))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "meta alice photos abc");

        let resp = r
            .dispatch(request(Method::GET, "/alice/photos/objects/abc", Some(CONTENT)))
            .await;
        assert_eq!(body_string(resp).await, "content abc");
    }

    #[tokio::test]
    async fn test_accept_parameters_are_ignored() {
        let resp = router()
            .dispatch(request(
                Method::GET,
                "/alice/photos/objects/abc",
                Some("application/vnd.git-media; charset=utf-8; q=0.9"),
            ))
            .await;
        assert_eq!(body_string(resp).await, "content abc");
    }

    #[tokio::test]
    async fn test_missing_accept_is_not_found() {
        let resp = router()
            .dispatch(request(Method::GET, "/alice/photos/objects/abc", None))
            .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_string(resp).await, r#"{"message":"Not Found"}"#);
    }

    #[tokio::test]
    async fn test_first_structural_match_is_exclusive() {
        // The DELETE entry lives on a later pattern of the same shape.
        let resp = router()
            .dispatch(request(Method::DELETE, "/alice/photos/objects/abc", Some(META)))
            .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_segment_count_and_literals_must_match() {
        let r = router();
        for path in [
            "/alice/photos/objects",
            "/alice/photos/blobs/abc",
            "/alice/photos/objects/abc/extra",
            "/alice//objects/abc",
        ] {
            let resp = r.dispatch(request(Method::GET, path, Some(META))).await;
            assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{path}");
        }
        let resp = r
            .dispatch(request(Method::POST, "/alice/photos/objects", Some(META)))
            .await;
        assert_eq!(body_string(resp).await, "register");
    }

    #[tokio::test]
    async fn test_head_drops_body_and_sets_request_id() {
        let r = MediaRouter::new(Arc::new(())).handle(
            "/{user}/{repo}/objects/{oid}",
            META,
            Method::HEAD,
            |_, _, _| async { "body" },
        );
        let resp = r
            .dispatch(request(Method::HEAD, "/a/b/objects/c", Some(META)))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let id = resp.headers()["x-request-id"].to_str().unwrap().to_string();
        assert_eq!(id.len(), 16);
        assert!(body_string(resp).await.is_empty());
    }

    #[tokio::test]
    async fn test_vars_carry_request_id() {
        let r = MediaRouter::new(Arc::new(())).handle(
            "/{user}/{repo}/objects/{oid}",
            META,
            Method::GET,
            |_, _, vars: PathVars| async move { vars.request_id().to_string() },
        );
        let resp = r
            .dispatch(request(Method::GET, "/a/b/objects/c", Some(META)))
            .await;
        let id = resp.headers()["x-request-id"].to_str().unwrap().to_string();
        assert_eq!(body_string(resp).await, id);
    }

    #[tokio::test]
    async fn test_handler_panic_is_internal_error() {
        let r = MediaRouter::new(Arc::new(())).handle(
            "/{user}/{repo}/objects/{oid}",
            META,
            Method::GET,
            |_, _, vars: PathVars| async move {
                if vars.get("oid") == "boom" {
                    panic!("handler failure");
                }
                "ok"
            },
        );
        let failed = r
            .dispatch(request(Method::GET, "/a/b/objects/boom", Some(META)))
            .await;
        assert_eq!(failed.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(failed.headers().contains_key("x-request-id"));
        assert_eq!(body_string(failed).await, r#"{"message":"Internal server error"}"#);

        let resp = r
            .dispatch(request(Method::GET, "/a/b/objects/fine", Some(META)))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
