//! Transaction manager with retry on transient conflicts
//!
//! A unit of work is re-run from scratch on a new cursor when the store
//! reports a serialization failure or a deadlock. Every other error is
//! returned after a single rollback.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::cursor::Cursor;
use crate::database::ConnectionPool;
use crate::error::{DatabaseError, TransientConflict};

/// Configuration for transaction retry behavior
///
/// # Example
/// ```
/// use common::RetryConfig;
///
/// let retry = RetryConfig::new().with_max_attempts(5).with_base_delay_ms(20);
/// assert_eq!(retry.max_attempts, 5);
/// ```
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts in total, the first one included. 0 behaves like 1.
    pub max_attempts: u32,
    /// Base delay between attempts in milliseconds (exponential backoff)
    pub base_delay_ms: u64,
    /// Maximum delay between attempts in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 10,
            max_delay_ms: 100,
        }
    }
}

impl RetryConfig {
    /// Create a new RetryConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Single attempt, no retry
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay after the given failed attempt (0-based, exponential backoff)
    pub(crate) fn calculate_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.min(63);
        let delay_ms = self.base_delay_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }
}

/// Run `attempt` until it succeeds, fails with a non-transient error, or
/// the attempt budget is spent.
///
/// `attempt` receives the 1-based attempt number. When every attempt hits
/// a transient conflict the result is `DatabaseError::RetriesExhausted`.
pub async fn retry_on_conflict<T, E, F, Fut>(retry: &RetryConfig, mut attempt: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: TransientConflict + From<DatabaseError> + Display,
{
    let max_attempts = retry.attempts();

    for n in 1..=max_attempts {
        match attempt(n).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient_conflict() => {
                if n < max_attempts {
                    warn!(
                        "Deadlock detected, retrying... (attempt {}/{}): {}",
                        n, max_attempts, err
                    );
                    tokio::time::sleep(retry.calculate_delay(n - 1)).await;
                } else {
                    warn!("Transient conflict on final attempt {}: {}", n, err);
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(DatabaseError::RetriesExhausted {
        attempts: max_attempts,
    }
    .into())
}

/// Runs units of work atomically, retrying transient conflicts
#[derive(Clone)]
pub struct TransactionManager {
    pool: ConnectionPool,
    retry: RetryConfig,
}

impl TransactionManager {
    /// Create a new transaction manager
    pub fn new(pool: ConnectionPool, retry: RetryConfig) -> Self {
        Self { pool, retry }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Run `work` in a transaction with the configured retry policy.
    pub async fn run<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: for<'c> Fn(&'c mut Cursor) -> BoxFuture<'c, Result<T, E>>,
        E: TransientConflict + From<DatabaseError> + Display,
    {
        let retry = self.retry.clone();
        self.execute(&retry, work).await
    }

    /// Run `work` in a transaction, making at most `max_attempts` attempts.
    pub async fn run_with_retries<T, E, F>(&self, max_attempts: u32, work: F) -> Result<T, E>
    where
        F: for<'c> Fn(&'c mut Cursor) -> BoxFuture<'c, Result<T, E>>,
        E: TransientConflict + From<DatabaseError> + Display,
    {
        let retry = self.retry.clone().with_max_attempts(max_attempts);
        self.execute(&retry, work).await
    }

    async fn execute<T, E, F>(&self, retry: &RetryConfig, work: F) -> Result<T, E>
    where
        F: for<'c> Fn(&'c mut Cursor) -> BoxFuture<'c, Result<T, E>>,
        E: TransientConflict + From<DatabaseError> + Display,
    {
        let pool = &self.pool;
        let work = &work;

        retry_on_conflict(retry, move |attempt| async move {
            debug!(attempt, "Starting transaction attempt");
            pool.with_cursor(true, work).await
        })
        .await
    }
}
