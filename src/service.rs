//! Named, URL-prefixed service units and the contract the server mounts
//! them through.

use std::sync::Arc;

use axum::routing::MethodRouter;
use axum::Router;
use tracing::Span;

use crate::database::Database;

/// What the server needs to mount a service, and nothing more: a unique
/// name, a mount path, and a route table.
pub trait HostedService: Send + Sync {
    /// Unique name within one server (e.g. `"users"`).
    fn name(&self) -> &str;

    /// URL prefix under which the route table is exposed.
    fn mount_path(&self) -> &str;

    /// A clone of the service's route table.
    fn routes(&self) -> Router;

    /// Installs the route table onto an externally supplied dispatcher
    /// without a prefix. Used when a single service is mounted directly
    /// on the router, e.g. during isolated testing.
    fn register_router(&self, dispatcher: Router) -> Router {
        dispatcher.merge(self.routes())
    }
}

/// A named unit owning its route table and, usually, a connection pool.
///
/// Routes are fixed at build time: the constructors consume and return
/// `self`, and there is no mutation API once the value is shared.
#[derive(Clone, Debug)]
pub struct Service {
    name: String,
    mount_path: String,
    routes: Router,
    database: Option<Arc<Database>>,
    span: Span,
}

impl Service {
    /// Creates an empty service with its own tracing span.
    #[must_use]
    pub fn new(name: impl Into<String>, mount_path: impl Into<String>) -> Self {
        let name = name.into();
        let span = tracing::info_span!("service", service = %name);
        Self {
            name,
            mount_path: mount_path.into(),
            routes: Router::new(),
            database: None,
            span,
        }
    }

    /// Registers a single route on the service's table.
    #[must_use]
    pub fn route(mut self, path: &str, method_router: MethodRouter) -> Self {
        self.routes = self.routes.route(path, method_router);
        self
    }

    /// Merges a pre-built router (typically one carrying handler state)
    /// into the service's table.
    #[must_use]
    pub fn with_routes(mut self, routes: Router) -> Self {
        self.routes = self.routes.merge(routes);
        self
    }

    /// Attaches the pool this service owns.
    #[must_use]
    pub fn with_database(mut self, database: Arc<Database>) -> Self {
        self.database = Some(database);
        self
    }

    #[must_use]
    pub fn database(&self) -> Option<&Arc<Database>> {
        self.database.as_ref()
    }

    #[must_use]
    pub fn span(&self) -> &Span {
        &self.span
    }
}

impl HostedService for Service {
    fn name(&self) -> &str {
        &self.name
    }

    fn mount_path(&self) -> &str {
        &self.mount_path
    }

    fn routes(&self) -> Router {
        self.routes.clone()
    }
}
