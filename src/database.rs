//! `PostgreSQL` connection pool wrapper.
//!
//! [`Database`] owns one live `sqlx` pool. Pool limits are applied before
//! the handle exists and never mutated afterward. Opening is lazy: no
//! network dial happens until the first query, so construction succeeding
//! does not imply the database is reachable — [`Database::ping`] is the
//! bounded liveness check for that.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;

use crate::config::Settings;

/// Failures surfaced by the pool wrapper.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// The pool could not be opened (bad connection string, bad options).
    /// Fatal to the construction of the owning service.
    #[error("failed to open connection pool")]
    ConnectionFailed(#[source] sqlx::Error),

    /// The liveness check failed. Reported, not fatal; used for health
    /// and readiness signaling.
    #[error("database unreachable")]
    Unreachable(#[source] sqlx::Error),

    /// The liveness check did not complete before its deadline.
    #[error("liveness check exceeded deadline of {0:?}")]
    PingDeadlineExceeded(Duration),

    /// `close` was called on a pool that is already closed. Double-close
    /// is an error, not a no-op.
    #[error("connection pool is already closed")]
    AlreadyClosed,
}

/// Capability interface over "a thing with a pool handle, ping, and close".
///
/// Single-level, exactly these operations; consumers that only need
/// liveness checks or teardown can take `&dyn ConnectionSource`.
#[async_trait]
pub trait ConnectionSource: Send + Sync {
    /// Borrow the underlying pool handle for running queries.
    fn handle(&self) -> &PgPool;

    /// Liveness check bounded by `deadline`. Never blocks indefinitely.
    async fn ping(&self, deadline: Duration) -> Result<(), DatabaseError>;

    /// Release all pooled connections. At most once per pool instance.
    async fn close(&self) -> Result<(), DatabaseError>;
}

/// Owns one live connection pool. Cheap to clone; clones share the pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Opens a pool from the configured connection string with all four
    /// pool limits applied atomically before the handle is returned.
    ///
    /// The underlying connection is dialed lazily on first use.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::ConnectionFailed`] when the connection
    /// string cannot be parsed.
    pub fn open(settings: &Settings) -> Result<Self, DatabaseError> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.db_max_open_conns)
            .min_connections(settings.db_max_idle_conns)
            .idle_timeout(settings.conn_max_idle())
            .max_lifetime(settings.conn_max_lifetime())
            .connect_lazy(&settings.database_url)
            .map_err(DatabaseError::ConnectionFailed)?;

        Ok(Self { pool })
    }

    /// Borrow the pool handle for running queries.
    #[must_use]
    pub fn handle(&self) -> &PgPool {
        &self.pool
    }

    /// Runs `SELECT 1` against the pool, bounded by `deadline`.
    ///
    /// # Errors
    ///
    /// [`DatabaseError::Unreachable`] when the query fails,
    /// [`DatabaseError::PingDeadlineExceeded`] when the deadline fires first.
    pub async fn ping(&self, deadline: Duration) -> Result<(), DatabaseError> {
        let check = sqlx::query("SELECT 1").execute(&self.pool);
        match tokio::time::timeout(deadline, check).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => Err(DatabaseError::Unreachable(err)),
            Err(_) => Err(DatabaseError::PingDeadlineExceeded(deadline)),
        }
    }

    /// Releases all pooled connections.
    ///
    /// # Errors
    ///
    /// [`DatabaseError::AlreadyClosed`] when the pool was closed before.
    pub async fn close(&self) -> Result<(), DatabaseError> {
        if self.pool.is_closed() {
            return Err(DatabaseError::AlreadyClosed);
        }
        self.pool.close().await;
        Ok(())
    }
}

#[async_trait]
impl ConnectionSource for Database {
    fn handle(&self) -> &PgPool {
        Database::handle(self)
    }

    async fn ping(&self, deadline: Duration) -> Result<(), DatabaseError> {
        Database::ping(self, deadline).await
    }

    async fn close(&self) -> Result<(), DatabaseError> {
        Database::close(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_with_url(url: &str) -> Settings {
        Settings {
            database_url: url.to_string(),
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn open_with_valid_url_succeeds_without_dialing() {
        // Lazy open: nothing is listening on this address, yet open succeeds.
        let settings = settings_with_url("postgres://user:pw@127.0.0.1:1/none");
        assert!(Database::open(&settings).is_ok());
    }

    #[test]
    fn open_with_invalid_url_is_connection_failed() {
        let settings = settings_with_url("not-a-connection-string");
        let err = Database::open(&settings).expect_err("open must fail");
        assert!(matches!(err, DatabaseError::ConnectionFailed(_)));
    }

    #[tokio::test]
    async fn ping_unreachable_database_reports_unreachable() {
        // Port 1 refuses connections immediately, well within the deadline.
        let settings = settings_with_url("postgres://user:pw@127.0.0.1:1/none");
        let database = Database::open(&settings).unwrap();

        let err = database
            .ping(Duration::from_secs(5))
            .await
            .expect_err("ping must fail");
        assert!(matches!(err, DatabaseError::Unreachable(_)));
    }

    #[tokio::test]
    async fn ping_zero_deadline_exceeds_deadline() {
        let settings = settings_with_url("postgres://user:pw@127.0.0.1:1/none");
        let database = Database::open(&settings).unwrap();

        let err = database
            .ping(Duration::ZERO)
            .await
            .expect_err("ping must fail");
        assert!(matches!(err, DatabaseError::PingDeadlineExceeded(_)));
    }

    #[tokio::test]
    async fn close_is_single_shot() {
        let settings = settings_with_url("postgres://user:pw@127.0.0.1:1/none");
        let database = Database::open(&settings).unwrap();

        database.close().await.expect("first close succeeds");
        let err = database.close().await.expect_err("second close must fail");
        assert!(matches!(err, DatabaseError::AlreadyClosed));
    }

    #[tokio::test]
    async fn connection_source_trait_object_is_usable() {
        let settings = settings_with_url("postgres://user:pw@127.0.0.1:1/none");
        let database = Database::open(&settings).unwrap();
        let source: &dyn ConnectionSource = &database;

        assert!(!source.handle().is_closed());
        source.close().await.expect("close through trait object");
    }
}
