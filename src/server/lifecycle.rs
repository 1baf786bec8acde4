//! Server lifecycle state machine with in-flight request tracking.
//!
//! One [`Lifecycle`] instance is shared (via `Arc`) between the serve
//! loop, the drain-aware middleware, and whoever triggers shutdown.
//! State reads are lock-free (`ArcSwap`); the serve loop learns about
//! shutdown through a `watch` channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Lifecycle states. `Stopped` is terminal: there is no transition out,
/// and a server that reached it can never serve again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Configured, not yet serving.
    Idle,
    /// Accept loop running.
    Running,
    /// Shutdown requested; no new work admitted, in-flight work draining.
    Draining,
    /// All in-flight work finished (or was abandoned at the deadline).
    Stopped,
}

impl ServerState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

/// Coordinates the serve/shutdown lifecycle of one server.
#[derive(Debug)]
pub struct Lifecycle {
    state: ArcSwap<ServerState>,
    stop: watch::Sender<bool>,
    force: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
}

impl Lifecycle {
    #[must_use]
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        let (force, _) = watch::channel(false);
        Self {
            state: ArcSwap::from_pointee(ServerState::Idle),
            stop,
            force,
            in_flight: Arc::new(AtomicU64::new(0)),
        }
    }

    #[must_use]
    pub fn state(&self) -> ServerState {
        **self.state.load()
    }

    /// Attempts the `Idle -> Running` transition.
    ///
    /// Returns `false` if the server already ran (or is running): serving
    /// twice on the same instance is refused.
    pub fn begin(&self) -> bool {
        let previous = self.state.rcu(|current| {
            if **current == ServerState::Idle {
                Arc::new(ServerState::Running)
            } else {
                Arc::clone(current)
            }
        });
        *previous == ServerState::Idle
    }

    /// Moves to `Draining` and signals the serve loop to stop accepting.
    ///
    /// Idempotent, except that `Stopped` is never left.
    pub fn begin_drain(&self) {
        self.state.rcu(|current| match **current {
            ServerState::Stopped => Arc::clone(current),
            _ => Arc::new(ServerState::Draining),
        });
        // Receivers may be gone when shutdown races serve teardown.
        let _ = self.stop.send(true);
    }

    /// Receiver resolved by [`Lifecycle::begin_drain`]; the serve loop
    /// selects on it to stop accepting connections.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    /// Moves straight to `Stopped` and signals the serve loop to tear
    /// down whatever connections are still open. Fired when the drain
    /// deadline expires with work in flight.
    pub fn force_stop(&self) {
        self.state.store(Arc::new(ServerState::Stopped));
        let _ = self.force.send(true);
    }

    /// Receiver resolved by [`Lifecycle::force_stop`].
    #[must_use]
    pub fn subscribe_force(&self) -> watch::Receiver<bool> {
        self.force.subscribe()
    }

    /// RAII guard counting one admitted request. The count drops even if
    /// the handler panics, since `Drop` runs during unwinding.
    #[must_use]
    pub fn guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits until every admitted request finished, up to `deadline`.
    ///
    /// Returns `true` on a complete drain (state becomes `Stopped`);
    /// `false` when the deadline expired with work still in flight
    /// (state stays `Draining`).
    pub async fn drain(&self, deadline: Duration) -> bool {
        let limit = tokio::time::Instant::now() + deadline;
        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                self.state.store(Arc::new(ServerState::Stopped));
                return true;
            }
            let now = tokio::time::Instant::now();
            if now >= limit {
                return false;
            }
            let step = Duration::from_millis(10).min(limit - now);
            tokio::time::sleep(step).await;
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
