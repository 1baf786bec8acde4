//! Server composition and lifecycle: snapshot aggregate, options, mux
//! assembly, drain-aware state machine.

pub mod host;
pub mod lifecycle;
pub mod options;
pub mod router;

pub use host::{Server, ServerError};
pub use lifecycle::{InFlightGuard, Lifecycle, ServerState};
pub use options::ServerOption;
