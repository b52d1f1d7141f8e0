//! Scoped cursor acquisition
//!
//! A [`Cursor`] owns a transaction on a checked-out connection. Finishing
//! it commits (or rolls back for read-only cursors); dropping it without
//! finishing rolls back. Either way the connection goes back to the pool
//! once the cursor is gone.

use futures::future::BoxFuture;
use sqlx::{PgConnection, Postgres, Transaction};
use tracing::{debug, warn};

use crate::config::IsolationLevel;
use crate::database::ConnectionPool;
use crate::error::{DatabaseError, DatabaseResult};

/// Transaction-scoped access to one pooled connection
pub struct Cursor {
    tx: Transaction<'static, Postgres>,
    commit: bool,
}

impl Cursor {
    async fn open(pool: &ConnectionPool, commit: bool) -> DatabaseResult<Self> {
        let (mut tx, isolation) = pool.begin().await?;
        set_isolation(&mut tx, isolation).await?;
        Ok(Self { tx, commit })
    }

    /// Connection to run statements on
    pub fn conn(&mut self) -> &mut PgConnection {
        &mut self.tx
    }

    /// Whether `finish` commits
    pub fn commits(&self) -> bool {
        self.commit
    }

    /// Commit when the cursor was opened with `commit`, roll back otherwise.
    pub async fn finish(self) -> DatabaseResult<()> {
        if self.commit {
            self.tx.commit().await?;
            debug!("Transaction committed");
        } else {
            self.tx.rollback().await?;
            debug!("Read-only transaction closed");
        }
        Ok(())
    }

    /// Discard everything done through this cursor.
    pub async fn rollback(self) -> DatabaseResult<()> {
        self.tx.rollback().await?;
        debug!("Transaction rolled back");
        Ok(())
    }

    /// Roll back on an error path. A failing rollback is only logged so the
    /// caller keeps reporting the error that caused it.
    pub(crate) async fn abandon(self) {
        if let Err(e) = self.rollback().await {
            warn!("Rollback failed: {}", e);
        }
    }
}

async fn set_isolation(
    tx: &mut Transaction<'static, Postgres>,
    isolation: IsolationLevel,
) -> DatabaseResult<()> {
    let statement = format!("SET TRANSACTION ISOLATION LEVEL {}", isolation.as_sql());
    sqlx::query(&statement).execute(&mut **tx).await?;
    Ok(())
}

impl ConnectionPool {
    /// Open a cursor
    ///
    /// # Arguments
    /// * `commit` - whether `Cursor::finish` commits or rolls back
    pub async fn cursor(&self, commit: bool) -> DatabaseResult<Cursor> {
        Cursor::open(self, commit).await
    }

    /// Run `work` on a fresh cursor
    ///
    /// On success the cursor is finished (committed when `commit` is set).
    /// If `work` fails the transaction is rolled back and the same error is
    /// returned. The connection is released on every path.
    ///
    /// ```rust,no_run
    /// # use common::{ConnectionPool, DatabaseError};
    /// # async fn demo(pool: ConnectionPool) -> Result<(), DatabaseError> {
    /// let count: i64 = pool
    ///     .with_cursor(false, |cursor| {
    ///         Box::pin(async move {
    ///             let n = sqlx::query_scalar("SELECT COUNT(*) FROM equipment")
    ///                 .fetch_one(cursor.conn())
    ///                 .await?;
    ///             Ok::<_, DatabaseError>(n)
    ///         })
    ///     })
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_cursor<T, E, F>(&self, commit: bool, work: F) -> Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut Cursor) -> BoxFuture<'c, Result<T, E>>,
        E: From<DatabaseError>,
    {
        let mut cursor = self.cursor(commit).await?;
        match work(&mut cursor).await {
            Ok(value) => {
                cursor.finish().await?;
                Ok(value)
            }
            Err(err) => {
                cursor.abandon().await;
                Err(err)
            }
        }
    }
}
