//! Database module for handling the PostgreSQL connection pool
//!
//! One `ConnectionPool` is created per process and handed to every component
//! that needs store access. It starts uninitialized; `initialize` opens the
//! connections and `shutdown` closes them again.

use std::sync::Arc;
use std::time::Duration;

use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::{DatabaseConfig, IsolationLevel};
use crate::error::{DatabaseError, DatabaseResult};

/// Snapshot of the pool's connection counts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Open connections, idle or checked out
    pub size: u32,
    /// Open connections waiting in the pool
    pub idle: usize,
}

impl PoolStatus {
    /// Connections currently checked out
    pub fn in_use(&self) -> usize {
        (self.size as usize).saturating_sub(self.idle)
    }
}

struct ActivePool {
    pool: PgPool,
    isolation: IsolationLevel,
    shutdown_timeout: Duration,
}

/// Bounded PostgreSQL connection pool
///
/// Cloning is cheap and every clone refers to the same pool.
///
/// `acquire` waits up to the configured acquire timeout when all
/// `max_connections` are checked out, then fails with
/// `DatabaseError::PoolExhausted`.
#[derive(Clone, Default)]
pub struct ConnectionPool {
    inner: Arc<RwLock<Option<ActivePool>>>,
}

impl ConnectionPool {
    /// Create an uninitialized pool handle
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the pool
    ///
    /// Calling this on an already initialized pool does nothing.
    ///
    /// # Arguments
    /// * `config` - Database configuration
    ///
    /// # Returns
    /// * `DatabaseResult<()>` - `Configuration` error if the parameters are
    ///   invalid or the store cannot be reached
    pub async fn initialize(&self, config: &DatabaseConfig) -> DatabaseResult<()> {
        let mut state = self.inner.write().await;
        if state.is_some() {
            debug!("Connection pool already initialized");
            return Ok(());
        }

        info!(
            min = config.min_connections,
            max = config.max_connections,
            "Initializing database connection pool"
        );

        let options = config.connect_options()?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect_with(options)
            .await
            .map_err(|e| {
                error!("Failed to connect to database: {}", e);
                DatabaseError::Configuration(format!("Database unreachable: {}", e))
            })?;

        // Open the minimum eagerly instead of waiting for the pool's reaper.
        let mut warm = Vec::with_capacity(config.min_connections as usize);
        for _ in 0..config.min_connections {
            let conn = pool.acquire().await.map_err(|e| {
                DatabaseError::Configuration(format!("Database unreachable: {}", e))
            })?;
            warm.push(conn);
        }
        drop(warm);

        *state = Some(ActivePool {
            pool,
            isolation: config.isolation_level,
            shutdown_timeout: config.shutdown_timeout(),
        });

        info!(
            "Connection pool initialized: {}-{} connections",
            config.min_connections, config.max_connections
        );
        Ok(())
    }

    /// Whether `initialize` has succeeded and `shutdown` has not been called since
    pub async fn is_initialized(&self) -> bool {
        self.inner.read().await.is_some()
    }

    async fn handle(&self) -> DatabaseResult<(PgPool, IsolationLevel)> {
        self.inner
            .read()
            .await
            .as_ref()
            .map(|active| (active.pool.clone(), active.isolation))
            .ok_or(DatabaseError::NotInitialized)
    }

    /// Check out a connection
    ///
    /// The connection is exclusively owned by the caller until it is passed
    /// to `release` or dropped.
    pub async fn acquire(&self) -> DatabaseResult<PoolConnection<Postgres>> {
        let (pool, _) = self.handle().await?;
        let conn = pool.acquire().await.map_err(DatabaseError::from_checkout)?;
        debug!("Connection checked out");
        Ok(conn)
    }

    /// Return a connection to the pool
    ///
    /// After `shutdown` the connection is closed instead of being reused.
    pub fn release(&self, conn: PoolConnection<Postgres>) {
        debug!("Connection released");
        drop(conn);
    }

    /// Check out a connection and begin a transaction on it.
    pub(crate) async fn begin(
        &self,
    ) -> DatabaseResult<(Transaction<'static, Postgres>, IsolationLevel)> {
        let (pool, isolation) = self.handle().await?;
        let tx = pool.begin().await.map_err(DatabaseError::from_checkout)?;
        Ok((tx, isolation))
    }

    /// Connection counts of the running pool
    pub async fn status(&self) -> DatabaseResult<PoolStatus> {
        let (pool, _) = self.handle().await?;
        Ok(PoolStatus {
            size: pool.size(),
            idle: pool.num_idle(),
        })
    }

    /// Check database connectivity
    ///
    /// # Returns
    /// * `DatabaseResult<bool>` - True if the store answered
    pub async fn health_check(&self) -> DatabaseResult<bool> {
        let (pool, _) = self.handle().await?;
        match sqlx::query("SELECT 1").execute(&pool).await {
            Ok(_) => {
                debug!("Database health check successful");
                Ok(true)
            }
            Err(e) => {
                error!("Database health check failed: {}", e);
                Ok(false)
            }
        }
    }

    /// Close every connection
    ///
    /// New checkouts fail with `NotInitialized` as soon as this is called.
    /// Idle connections are closed immediately; outstanding ones are waited
    /// for up to the shutdown timeout and otherwise closed on release.
    pub async fn shutdown(&self) {
        let Some(active) = self.inner.write().await.take() else {
            debug!("Connection pool already shut down");
            return;
        };

        let in_use = PoolStatus {
            size: active.pool.size(),
            idle: active.pool.num_idle(),
        }
        .in_use();
        if in_use > 0 {
            warn!(in_use, "Shutting down with connections still checked out");
        }

        if tokio::time::timeout(active.shutdown_timeout, active.pool.close())
            .await
            .is_err()
        {
            warn!("Outstanding connections will be closed when released");
        }

        info!("Connection pool closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_uninitialized_pool_rejects_checkout() {
        let pool = ConnectionPool::new();
        assert!(!pool.is_initialized().await);
        assert!(matches!(
            pool.acquire().await,
            Err(DatabaseError::NotInitialized)
        ));
        assert!(matches!(pool.status().await, Err(DatabaseError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_initialize_rejects_invalid_config() {
        let pool = ConnectionPool::new();
        let config = DatabaseConfig {
            min_connections: 3,
            max_connections: 1,
            ..DatabaseConfig::default()
        };
        assert!(matches!(
            pool.initialize(&config).await,
            Err(DatabaseError::Configuration(_))
        ));
        assert!(!pool.is_initialized().await);
    }

    #[tokio::test]
    async fn test_shutdown_of_uninitialized_pool_is_noop() {
        let pool = ConnectionPool::new();
        pool.shutdown().await;
        assert!(!pool.is_initialized().await);
    }

    #[test]
    fn test_pool_status_in_use() {
        let status = PoolStatus { size: 5, idle: 2 };
        assert_eq!(status.in_use(), 3);
        let status = PoolStatus { size: 0, idle: 0 };
        assert_eq!(status.in_use(), 0);
    }
}
