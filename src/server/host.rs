//! The top-level, immutably configured server aggregate.
//!
//! Construction assembles everything up front: a base snapshot from the
//! settings, the supplied options applied in order, every service nested
//! at its mount path, and the middleware chain wrapped around the mux.
//! After that the snapshot is read-only; `serve` and `shutdown` only
//! drive the shared [`Lifecycle`].

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::normalize_path::NormalizePath;
use tower_http::timeout::TimeoutLayer;
use tracing::{info, warn, Span};

use super::lifecycle::Lifecycle;
use super::options::ServerOption;
use super::router::{build_mux, validate_mounts};
use crate::config::Settings;
use crate::middleware::{drain_aware, heartbeat, request_logging, Middleware, MiddlewareChain};
use crate::service::HostedService;

/// Composition and lifecycle failures.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Two services declared equal or nested mount paths.
    #[error("mount path {path:?} overlaps already mounted {existing:?}")]
    MountCollision { path: String, existing: String },

    /// Two services declared the same name.
    #[error("duplicate service name {0:?}")]
    DuplicateServiceName(String),

    /// A mount path was empty, relative, bare `/`, or had a trailing slash.
    #[error("invalid mount path {0:?}")]
    InvalidMountPath(String),

    /// More than one service was registered directly on the router.
    #[error("more than one service registered directly on the router")]
    RootServiceConflict,

    /// The listen address could not be bound.
    #[error("failed to bind {addr}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The accept loop failed after binding.
    #[error("listener failure")]
    Listener(#[source] std::io::Error),

    /// `serve` was called on an instance that already served.
    #[error("server already started or stopped")]
    AlreadyStarted,

    /// The graceful drain deadline expired with requests still in flight.
    #[error("shutdown deadline {deadline:?} exceeded with {in_flight} requests in flight")]
    ShutdownTimeout { deadline: Duration, in_flight: u64 },
}

/// Immutable server snapshot: settings, mounted services, middleware
/// chain, listen endpoint, and the composed request handler.
///
/// `Clone` is the shallow copy that [`Server::with_options`] configures;
/// route tables, the chain, and the lifecycle handle are shared by `Arc`.
#[derive(Clone)]
pub struct Server {
    settings: Arc<Settings>,
    host: String,
    port: u16,
    services: Vec<Arc<dyn HostedService>>,
    roots: Vec<Arc<dyn HostedService>>,
    middleware: MiddlewareChain,
    span: Span,
    router: Router,
    lifecycle: Arc<Lifecycle>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("settings", &self.settings)
            .field("host", &self.host)
            .field("port", &self.port)
            .field(
                "services",
                &self.services.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field(
                "roots",
                &self.roots.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Builds a server: base snapshot from `settings` (listen address,
    /// default heartbeat + request-logging chain), then the options in
    /// order, then mounting and middleware composition.
    ///
    /// # Errors
    ///
    /// Any mount validation failure: [`ServerError::MountCollision`],
    /// [`ServerError::DuplicateServiceName`],
    /// [`ServerError::InvalidMountPath`],
    /// [`ServerError::RootServiceConflict`].
    pub fn new(
        settings: Settings,
        options: impl IntoIterator<Item = ServerOption>,
    ) -> Result<Self, ServerError> {
        let mut chain = MiddlewareChain::new();
        chain.append(heartbeat(settings.health_path.clone()));
        chain.append(request_logging());

        let base = Self {
            host: settings.http_host.clone(),
            port: settings.http_port,
            settings: Arc::new(settings),
            services: Vec::new(),
            roots: Vec::new(),
            middleware: chain,
            span: Span::none(),
            router: Router::new(),
            lifecycle: Arc::new(Lifecycle::new()),
        };

        let mut server = base.with_options(options);
        server.router = server.compose_handler()?;
        Ok(server)
    }

    /// Applies `options` to a clone of this snapshot and returns the
    /// clone. The receiver is never mutated, so earlier snapshots stay
    /// valid under concurrent configuration branching.
    ///
    /// Pure configuration: the composed handler is assembled once, by
    /// [`Server::new`]. Feed branched snapshots back through `new` (via
    /// their accessors) when a freshly mounted handler is needed.
    #[must_use]
    pub fn with_options(&self, options: impl IntoIterator<Item = ServerOption>) -> Self {
        let mut next = self.clone();
        for option in options {
            option.apply(&mut next);
        }
        next
    }

    /// Validates mounts, builds the mux, and wraps it: request timeout
    /// and drain tracking innermost, then the chain (heartbeat outermost),
    /// then trailing-slash normalization.
    fn compose_handler(&self) -> Result<Router, ServerError> {
        validate_mounts(&self.services, &self.roots)?;

        let mux = build_mux(&self.services, &self.roots).layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            self.settings.request_timeout(),
        ));

        let mut chain = self.middleware.clone();
        chain.append(drain_aware(Arc::clone(&self.lifecycle)));
        let routed = chain.apply(mux);

        // `GET <mount>/` must dispatch like `GET <mount>`. The rewrite has
        // to happen before routing, so the normalizer wraps the whole
        // routed handler instead of being a `.layer` on it.
        Ok(Router::new().fallback_service(NormalizePath::trim_trailing_slash(routed)))
    }

    /// Binds the configured address and accepts connections until the
    /// lifecycle is told to drain, waiting for in-flight requests unless
    /// a force-stop cuts the wait short. Either signalled stop is
    /// success; only bind and accept failures are errors.
    ///
    /// # Errors
    ///
    /// [`ServerError::AlreadyStarted`] on a second call,
    /// [`ServerError::Bind`] when the address is unavailable,
    /// [`ServerError::Listener`] on accept-loop failure.
    pub async fn serve(&self) -> Result<(), ServerError> {
        if !self.lifecycle.begin() {
            return Err(ServerError::AlreadyStarted);
        }

        let addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local = listener.local_addr().map_err(ServerError::Listener)?;
        info!(parent: &self.span, url = %format!("http://{local}"), "http server listening");

        let mut stop = self.lifecycle.subscribe();
        let mut force = self.lifecycle.subscribe_force();
        let serving = axum::serve(listener, self.router.clone()).with_graceful_shutdown(
            async move {
                let _ = stop.changed().await;
            },
        );

        // Dropping the serve future on the force signal tears down the
        // listener and every connection the graceful path was still
        // waiting on.
        tokio::select! {
            result = serving => result.map_err(ServerError::Listener)?,
            _ = force.changed() => {
                warn!(parent: &self.span, "drain deadline expired, forcing open connections closed");
            }
        }

        Ok(())
    }

    /// Stops accepting new connections immediately, waits up to
    /// `deadline` for in-flight requests, then forces the remaining
    /// connections closed so the serve loop returns promptly either way.
    ///
    /// # Errors
    ///
    /// [`ServerError::ShutdownTimeout`] when the drain did not complete.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), ServerError> {
        info!(
            parent: &self.span,
            deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
            "http server shutting down"
        );
        self.lifecycle.begin_drain();

        if self.lifecycle.drain(deadline).await {
            Ok(())
        } else {
            let in_flight = self.lifecycle.in_flight();
            self.lifecycle.force_stop();
            Err(ServerError::ShutdownTimeout { deadline, in_flight })
        }
    }

    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn services(&self) -> &[Arc<dyn HostedService>] {
        &self.services
    }

    #[must_use]
    pub fn middleware(&self) -> &MiddlewareChain {
        &self.middleware
    }

    /// A clone of the composed request handler; handy for in-process
    /// testing without binding a socket.
    #[must_use]
    pub fn handler(&self) -> Router {
        self.router.clone()
    }

    /// Shared lifecycle handle for observation and external shutdown
    /// triggering.
    #[must_use]
    pub fn lifecycle(&self) -> Arc<Lifecycle> {
        Arc::clone(&self.lifecycle)
    }

    pub(crate) fn set_span(&mut self, span: Span) {
        self.span = span;
    }

    pub(crate) fn append_middleware(&mut self, middleware: Middleware) {
        self.middleware.append(middleware);
    }

    pub(crate) fn mount(&mut self, service: Arc<dyn HostedService>) {
        self.services.push(service);
    }

    pub(crate) fn mount_root(&mut self, service: Arc<dyn HostedService>) {
        self.roots.push(service);
    }

    pub(crate) fn set_listen_addr(&mut self, host: String, port: u16) {
        self.host = host;
        self.port = port;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use axum::body::Body;
    use axum::extract::Path;
    use axum::http::{Request, StatusCode};
    use axum::routing::get;
    use tower::ServiceExt;

    use super::*;
    use crate::service::Service;

    fn test_settings() -> Settings {
        Settings {
            http_host: "127.0.0.1".to_string(),
            http_port: 0,
            ..Settings::default()
        }
    }

    /// Service whose handlers record every hit in a shared log.
    fn probe_service(
        name: &str,
        mount_path: &str,
        hits: Arc<Mutex<Vec<String>>>,
    ) -> Arc<dyn HostedService> {
        let on_list = Arc::clone(&hits);
        let list_name = name.to_string();
        let on_get = hits;
        let get_name = name.to_string();
        Arc::new(
            Service::new(name, mount_path)
                .route(
                    "/",
                    get(move || {
                        let on_list = Arc::clone(&on_list);
                        let list_name = list_name.clone();
                        async move {
                            on_list.lock().unwrap().push(format!("{list_name}:list"));
                            "list"
                        }
                    }),
                )
                .route(
                    "/{id}",
                    get(move |Path(id): Path<String>| {
                        let on_get = Arc::clone(&on_get);
                        let get_name = get_name.clone();
                        async move {
                            on_get.lock().unwrap().push(format!("{get_name}:{id}"));
                            id
                        }
                    }),
                ),
        )
    }

    async fn get_status(server: &Server, path: &str) -> StatusCode {
        server
            .handler()
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[test]
    fn with_options_leaves_the_receiver_untouched() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let base = Server::new(test_settings(), []).unwrap();

        let derived = base.with_options([
            ServerOption::listen_addr("10.0.0.1", 9000),
            ServerOption::service(probe_service("users", "/api/v1/users", hits)),
            ServerOption::middleware(heartbeat("/extra")),
        ]);

        assert_eq!(base.host(), "127.0.0.1");
        assert_eq!(base.port(), 0);
        assert!(base.services().is_empty());
        assert_eq!(base.middleware().len(), 2, "default chain only");

        assert_eq!(derived.host(), "10.0.0.1");
        assert_eq!(derived.port(), 9000);
        assert_eq!(derived.services().len(), 1);
        assert_eq!(derived.middleware().len(), 3);
    }

    #[test]
    fn options_apply_in_supplied_order() {
        let base = Server::new(test_settings(), []).unwrap();
        let derived = base.with_options([
            ServerOption::listen_addr("10.0.0.1", 1),
            ServerOption::listen_addr("10.0.0.2", 2),
        ]);
        assert_eq!(derived.host(), "10.0.0.2");
        assert_eq!(derived.port(), 2);
    }

    #[test]
    fn colliding_mounts_fail_construction() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let err = Server::new(
            test_settings(),
            [
                ServerOption::service(probe_service("api", "/api", Arc::clone(&hits))),
                ServerOption::service(probe_service("users", "/api/v1/users", hits)),
            ],
        )
        .expect_err("overlapping mounts must be rejected");
        assert!(matches!(err, ServerError::MountCollision { .. }));
    }

    #[tokio::test]
    async fn health_users_and_unknown_scenario() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let server = Server::new(
            test_settings(),
            [ServerOption::service(probe_service(
                "users",
                "/api/v1/users",
                Arc::clone(&hits),
            ))],
        )
        .unwrap();

        // Liveness short-circuits before the users table.
        assert_eq!(get_status(&server, "/health").await, StatusCode::OK);
        assert!(hits.lock().unwrap().is_empty());

        // Prefix stripped: the users table sees /42.
        let response = server
            .handler()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/users/42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = http_body_util::BodyExt::collect(response.into_body())
            .await
            .unwrap()
            .to_bytes();
        assert_eq!(&body[..], b"42");
        assert_eq!(*hits.lock().unwrap(), vec!["users:42".to_string()]);

        assert_eq!(get_status(&server, "/unknown").await, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn prefix_isolation_between_services() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let server = Server::new(
            test_settings(),
            [
                ServerOption::service(probe_service(
                    "users",
                    "/api/v1/users",
                    Arc::clone(&hits),
                )),
                ServerOption::service(probe_service(
                    "orders",
                    "/api/v1/orders",
                    Arc::clone(&hits),
                )),
            ],
        )
        .unwrap();

        assert_eq!(get_status(&server, "/api/v1/users/1").await, StatusCode::OK);
        assert_eq!(*hits.lock().unwrap(), vec!["users:1".to_string()]);

        hits.lock().unwrap().clear();
        assert_eq!(
            get_status(&server, "/api/v1/orders/1").await,
            StatusCode::OK
        );
        assert_eq!(*hits.lock().unwrap(), vec!["orders:1".to_string()]);
    }

    #[tokio::test]
    async fn requests_are_refused_while_draining() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let server = Server::new(
            test_settings(),
            [ServerOption::service(probe_service(
                "users",
                "/api/v1/users",
                Arc::clone(&hits),
            ))],
        )
        .unwrap();

        server.lifecycle().begin_drain();
        assert_eq!(
            get_status(&server, "/api/v1/users/1").await,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert!(hits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn serve_then_shutdown_is_clean() {
        let server = Arc::new(Server::new(test_settings(), []).unwrap());

        let serving = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = tokio::time::Instant::now();
        server.shutdown(Duration::from_secs(5)).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));

        serving.await.unwrap().expect("clean stop is not an error");
    }

    #[tokio::test]
    async fn serve_twice_is_refused() {
        let server = Arc::new(Server::new(test_settings(), []).unwrap());

        let serving = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = server.serve().await.expect_err("second serve must fail");
        assert!(matches!(err, ServerError::AlreadyStarted));

        server.shutdown(Duration::from_secs(5)).await.unwrap();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_times_out_on_slow_in_flight_request() {
        let server = Server::new(test_settings(), []).unwrap();

        // Simulate one request stuck past the deadline.
        let _stuck = server.lifecycle().guard();

        let err = server
            .shutdown(Duration::from_millis(50))
            .await
            .expect_err("drain cannot complete");
        assert!(matches!(
            err,
            ServerError::ShutdownTimeout { in_flight: 1, .. }
        ));
    }

    #[tokio::test]
    async fn timed_out_shutdown_forces_open_connections_closed() {
        use tokio::io::AsyncWriteExt;

        // Reserve a port so the raw request below knows where to connect.
        let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = reserved.local_addr().unwrap().port();
        drop(reserved);

        let slow: Arc<dyn HostedService> =
            Arc::new(Service::new("slow", "/api/v1/slow").route(
                "/",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    "late"
                }),
            ));
        let server = Arc::new(
            Server::new(
                Settings {
                    http_host: "127.0.0.1".to_string(),
                    http_port: port,
                    ..Settings::default()
                },
                [ServerOption::service(slow)],
            )
            .unwrap(),
        );

        let serving = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Park one request in its handler; never read the response.
        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        stream
            .write_all(b"GET /api/v1/slow HTTP/1.1\r\nhost: localhost\r\n\r\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.lifecycle().in_flight(), 1);

        let err = server
            .shutdown(Duration::from_millis(100))
            .await
            .expect_err("drain cannot complete");
        assert!(matches!(err, ServerError::ShutdownTimeout { .. }));

        // The stuck connection must not keep the serve loop alive past
        // the deadline.
        let outcome = tokio::time::timeout(Duration::from_secs(2), serving)
            .await
            .expect("serve must return promptly after the forced stop");
        outcome.unwrap().expect("forced stop is not an error");
        drop(stream);
    }

    #[tokio::test]
    async fn trailing_slash_dispatches_like_the_canonical_path() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let server = Server::new(
            test_settings(),
            [ServerOption::service(probe_service(
                "users",
                "/api/v1/users",
                Arc::clone(&hits),
            ))],
        )
        .unwrap();

        assert_eq!(get_status(&server, "/api/v1/users/").await, StatusCode::OK);
        assert_eq!(
            get_status(&server, "/api/v1/users/42/").await,
            StatusCode::OK
        );
        assert_eq!(
            *hits.lock().unwrap(),
            vec!["users:list".to_string(), "users:42".to_string()]
        );
    }

    #[tokio::test]
    async fn slow_requests_are_answered_with_408() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let slow: Arc<dyn HostedService> = Arc::new(Service::new("slow", "/api/v1/slow").route(
            "/",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                "late"
            }),
        ));
        let server = Server::new(
            Settings {
                request_timeout_secs: 1,
                ..test_settings()
            },
            [
                ServerOption::service(slow),
                ServerOption::service(probe_service("users", "/api/v1/users", hits)),
            ],
        )
        .unwrap();

        assert_eq!(
            get_status(&server, "/api/v1/slow").await,
            StatusCode::REQUEST_TIMEOUT
        );
        // The timeout is per request, not per server.
        assert_eq!(get_status(&server, "/api/v1/users/1").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn bind_failure_is_surfaced() {
        // Hold a listener ourselves, then point a server at the same port.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = Server::new(
            Settings {
                http_host: "127.0.0.1".to_string(),
                http_port: port,
                ..Settings::default()
            },
            [],
        )
        .unwrap();

        let err = server.serve().await.expect_err("port is taken");
        assert!(matches!(err, ServerError::Bind { .. }));
    }
}
