//! HTTP surface and the connection loop.
//!
//! [`app`] assembles the axum [`Router`]: `/health`, `/metrics`, and a
//! fallback into the media-type protocol router.  [`serve`] drives it over
//! a [`TrackingListener`], one task per connection, and on shutdown stops
//! accepting, asks each connection to finish its current request, then
//! waits for the in-flight count to reach zero.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use tokio::sync::watch;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::errors::LfsError;
use crate::handlers;
use crate::listener::TrackingListener;
use crate::router::panic_message;
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::AppState;

/// Build the axum [`Router`] serving the object protocol.
pub fn app(state: Arc<AppState>) -> Router {
    let metrics_enabled = state.config.observability.metrics;
    let protocol = Arc::new(handlers::routes(state));

    let mut router = Router::new().route("/health", get(health_check));
    if metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    router
        .fallback(move |req: Request<Body>| {
            let protocol = protocol.clone();
            async move { protocol.dispatch(req).await }
        })
        // Layer ordering: inner layers run first, outer layers wrap them.
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        // Uploads stream through the content store; no buffering limit.
        .layer(DefaultBodyLimit::disable())
}

/// Serve `app` on `listener` until `shutdown` resolves, then drain.
pub async fn serve<F>(listener: TrackingListener, app: Router, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send,
{
    let tracker = listener.tracker();
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::pin!(shutdown);

    loop {
        let (stream, peer, guard) = tokio::select! {
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(err) => {
                    error!("error accepting connection: {err}");
                    continue;
                }
            },
            _ = &mut shutdown => break,
        };

        let service = TowerToHyperService::new(app.clone());
        let mut stop_rx = stop_rx.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
            tokio::pin!(conn);
            let mut stopping = false;
            loop {
                tokio::select! {
                    res = conn.as_mut() => {
                        if let Err(err) = res {
                            debug!(peer = %peer, error = %err, "connection closed with error");
                        }
                        break;
                    }
                    _ = stop_rx.changed(), if !stopping => {
                        stopping = true;
                        conn.as_mut().graceful_shutdown();
                    }
                }
            }
        });
    }

    drop(listener);
    info!(active = tracker.active(), "listener closed, draining connections");
    let _ = stop_tx.send(true);
    tracker.wait_for_drain().await;
    info!("all connections drained");
    Ok(())
}

// -- Common headers middleware -----------------------------------------------

/// Adds `Date` and `Server` to every response.
async fn common_headers_middleware(req: Request<Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    if let Ok(date) = HeaderValue::from_str(&date) {
        headers.insert("date", date);
    }
    headers.insert("server", HeaderValue::from_static("lfs-gateway"));

    response
}

/// Turn a handler panic into a 500 with the fixed JSON body.
fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    warn!(panic = %panic_message(err.as_ref()), "middleware panicked");
    LfsError::Internal.into_response()
}

async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}
