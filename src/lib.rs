//! `servicekit` — a small HTTP service host.
//!
//! Builds an HTTP server from named, URL-prefixed sub-services, wires an
//! ordered middleware chain around the composed dispatcher, and manages a
//! `PostgreSQL` connection pool plus the serve/shutdown lifecycle.
//!
//! Composition is option-driven and copy-on-configure: every configuration
//! step yields a new immutable server snapshot, so partially configured
//! servers can be branched and reused concurrently without interference.

pub mod config;
pub mod database;
pub mod middleware;
pub mod server;
pub mod service;
pub mod services;

pub use config::Settings;
pub use database::{ConnectionSource, Database, DatabaseError};
pub use middleware::{Middleware, MiddlewareChain};
pub use server::{Lifecycle, Server, ServerError, ServerOption, ServerState};
pub use service::{HostedService, Service};
