//! Copy-on-configure options for [`Server`].
//!
//! A [`ServerOption`] is a pure function from one server snapshot to the
//! next. [`Server::with_options`] applies options to a clone of the
//! receiver, in the order supplied, and returns the clone — the receiver
//! is never touched, so configuration can branch from a shared base
//! concurrently.

use std::sync::Arc;

use tracing::Span;

use super::host::Server;
use crate::middleware::Middleware;
use crate::service::HostedService;

type Apply = dyn Fn(&mut Server) + Send + Sync;

/// One configuration step.
#[derive(Clone)]
pub struct ServerOption {
    apply: Arc<Apply>,
}

impl ServerOption {
    fn new(apply: impl Fn(&mut Server) + Send + Sync + 'static) -> Self {
        Self {
            apply: Arc::new(apply),
        }
    }

    /// Sets the span under which server lifecycle events are logged.
    #[must_use]
    pub fn logger(span: Span) -> Self {
        Self::new(move |server| server.set_span(span.clone()))
    }

    /// Appends one middleware at the inner end of the chain.
    #[must_use]
    pub fn middleware(middleware: Middleware) -> Self {
        Self::new(move |server| server.append_middleware(Arc::clone(&middleware)))
    }

    /// Mounts one service at its declared mount path.
    #[must_use]
    pub fn service(service: Arc<dyn HostedService>) -> Self {
        Self::new(move |server| server.mount(Arc::clone(&service)))
    }

    /// Registers one service directly on the router, without a prefix.
    /// At most one such service is accepted per server.
    #[must_use]
    pub fn root_service(service: Arc<dyn HostedService>) -> Self {
        Self::new(move |server| server.mount_root(Arc::clone(&service)))
    }

    /// Overrides the listen host and port from the settings.
    #[must_use]
    pub fn listen_addr(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Self::new(move |server| server.set_listen_addr(host.clone(), port))
    }

    pub(crate) fn apply(&self, server: &mut Server) {
        (self.apply)(server);
    }
}
