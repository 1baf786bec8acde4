//! Handler-wrapping middleware and the ordered chain that composes them.
//!
//! A [`Middleware`] is a function from one handler to another, mirroring
//! the classic `func(Handler) -> Handler` shape. The [`MiddlewareChain`]
//! preserves registration order and composes so that the **first**
//! middleware registered becomes the **outermost** wrapper: it sees the
//! request first and the response last.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::Request;
use axum::http::{HeaderName, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Router;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tracing::info;

use crate::server::lifecycle::{Lifecycle, ServerState};

/// A handler transform. Chains own these by `Arc` so a configured chain
/// clones cheaply into server snapshots.
pub type Middleware = Arc<dyn Fn(Router) -> Router + Send + Sync>;

/// Ordered sequence of handler transforms.
///
/// Application order is fixed by [`MiddlewareChain::apply`]: for a chain
/// `[m0, m1, .., mN]` the composed handler is `m0(m1(..mN(base)..))`.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    entries: Vec<Middleware>,
}

impl MiddlewareChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a middleware at the inner end of the chain.
    pub fn append(&mut self, middleware: Middleware) {
        self.entries.push(middleware);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wraps `base` with every middleware in the chain.
    ///
    /// Iterates in reverse registration order: each `Router::layer` call
    /// wraps everything added so far, so the entry wrapped last — the
    /// first one registered — ends up outermost.
    #[must_use]
    pub fn apply(&self, base: Router) -> Router {
        self.entries
            .iter()
            .rev()
            .fold(base, |handler, middleware| middleware(handler))
    }
}

/// Liveness short-circuit: answers `GET <path>` (or `HEAD`, which probes
/// commonly send) with `200 OK` and an empty body without running anything
/// wrapped inside it. Mounted outermost by the server, so the liveness
/// path never reaches request logging, the dispatcher, or any service
/// route table.
#[must_use]
pub fn heartbeat(path: impl Into<String>) -> Middleware {
    let path = path.into();
    Arc::new(move |router: Router| {
        let path = path.clone();
        router.layer(axum::middleware::from_fn(
            move |req: Request, next: Next| {
                let path = path.clone();
                async move {
                    let liveness_read =
                        req.method() == Method::GET || req.method() == Method::HEAD;
                    if liveness_read && req.uri().path() == path {
                        return StatusCode::OK.into_response();
                    }
                    next.run(req).await
                }
            },
        ))
    })
}

/// Request logging with correlation ids.
///
/// Assigns an `x-request-id` (UUID v4) to every request it sees, logs
/// method, path, status, and latency on the way out, and propagates the
/// id onto the response.
#[must_use]
pub fn request_logging() -> Middleware {
    Arc::new(|router: Router| {
        let x_request_id = HeaderName::from_static("x-request-id");
        // `.layer` wraps everything added so far, so inner layers are
        // listed first: propagate (innermost), log, set-id (outermost).
        router
            .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
            .layer(axum::middleware::from_fn(log_request))
            .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid))
    })
}

async fn log_request(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("-")
        .to_owned();

    let start = Instant::now();
    let response = next.run(req).await;

    info!(
        %method,
        path,
        request_id,
        status = response.status().as_u16(),
        elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
        "request handled"
    );
    response
}

/// Drain awareness: refuses new work with `503` once the server is
/// draining, and holds an in-flight guard for every admitted request so
/// shutdown can wait for them. The server appends this at the inner end
/// of the chain, just outside the dispatcher.
#[must_use]
pub fn drain_aware(lifecycle: Arc<Lifecycle>) -> Middleware {
    Arc::new(move |router: Router| {
        let lifecycle = Arc::clone(&lifecycle);
        router.layer(axum::middleware::from_fn(
            move |req: Request, next: Next| {
                let lifecycle = Arc::clone(&lifecycle);
                async move {
                    match lifecycle.state() {
                        ServerState::Draining | ServerState::Stopped => {
                            return StatusCode::SERVICE_UNAVAILABLE.into_response();
                        }
                        ServerState::Idle | ServerState::Running => {}
                    }
                    let _guard = lifecycle.guard();
                    next.run(req).await
                }
            },
        ))
    })
}
