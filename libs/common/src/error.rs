//! Custom error types for the common library
//!
//! This module defines the error taxonomy shared by the pool, cursor,
//! concurrency-control and transaction layers.

use sqlx::Error as SqlxError;
use thiserror::Error;

/// SQLSTATE reported by PostgreSQL when a transaction cannot be serialized.
pub const SERIALIZATION_FAILURE: &str = "40001";

/// SQLSTATE reported by PostgreSQL when it breaks a deadlock.
pub const DEADLOCK_DETECTED: &str = "40P01";

/// Custom error type for database operations
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Bad or missing store parameters, or an unreachable store at startup
    #[error("Database configuration error: {0}")]
    Configuration(String),

    /// The pool has not been initialized, or has been shut down
    #[error("Connection pool not initialized")]
    NotInitialized,

    /// No connection became free within the acquire timeout
    #[error("Connection pool exhausted")]
    PoolExhausted,

    /// Error occurred while talking to the store outside of a statement
    #[error("Database connection error: {0}")]
    Connection(#[source] SqlxError),

    /// Error occurred during database query execution
    #[error("Database query error: {0}")]
    Query(#[source] SqlxError),

    /// Error occurred during database migration
    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// An audit snapshot could not be serialized
    #[error("Audit snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),

    /// A table or column name that is not a plain SQL identifier
    #[error("Invalid SQL identifier: {0}")]
    InvalidIdentifier(String),

    /// The versioned record does not exist
    #[error("Record {id} not found in {table}")]
    RecordNotFound { table: String, id: i64 },

    /// The versioned record was modified by another user since it was read
    #[error(
        "Conflict detected: record {id} in {table} was modified by another user. \
         Expected version {expected}, found {current}."
    )]
    VersionConflict {
        table: String,
        id: i64,
        expected: i32,
        current: i32,
    },

    /// Every attempt failed with a transient conflict
    #[error("Transaction failed after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

impl DatabaseError {
    /// Classify a pool checkout failure.
    pub(crate) fn from_checkout(err: SqlxError) -> Self {
        match err {
            SqlxError::PoolTimedOut => DatabaseError::PoolExhausted,
            SqlxError::PoolClosed => DatabaseError::NotInitialized,
            other => DatabaseError::Connection(other),
        }
    }
}

impl From<SqlxError> for DatabaseError {
    fn from(err: SqlxError) -> Self {
        DatabaseError::Query(err)
    }
}

/// Store adapter predicate used by the transaction manager to decide
/// whether a failed unit of work should simply be re-run.
pub trait TransientConflict {
    /// True for serialization failures and deadlocks.
    fn is_transient_conflict(&self) -> bool;
}

/// Whether a SQLSTATE code denotes a transient conflict.
pub fn is_transient_sqlstate(code: &str) -> bool {
    code == SERIALIZATION_FAILURE || code == DEADLOCK_DETECTED
}

impl TransientConflict for SqlxError {
    fn is_transient_conflict(&self) -> bool {
        self.as_database_error()
            .and_then(|db| db.code())
            .is_some_and(|code| is_transient_sqlstate(&code))
    }
}

impl TransientConflict for DatabaseError {
    fn is_transient_conflict(&self) -> bool {
        match self {
            DatabaseError::Query(err) | DatabaseError::Connection(err) => {
                err.is_transient_conflict()
            }
            _ => false,
        }
    }
}

/// Type alias for Result with DatabaseError
pub type DatabaseResult<T> = Result<T, DatabaseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_sqlstates() {
        assert!(is_transient_sqlstate("40001"));
        assert!(is_transient_sqlstate("40P01"));
        assert!(!is_transient_sqlstate("23505"));
        assert!(!is_transient_sqlstate(""));
    }

    #[test]
    fn test_checkout_errors_are_classified() {
        assert!(matches!(
            DatabaseError::from_checkout(SqlxError::PoolTimedOut),
            DatabaseError::PoolExhausted
        ));
        assert!(matches!(
            DatabaseError::from_checkout(SqlxError::PoolClosed),
            DatabaseError::NotInitialized
        ));
    }

    #[test]
    fn test_non_store_errors_are_not_transient() {
        assert!(!DatabaseError::PoolExhausted.is_transient_conflict());
        assert!(!DatabaseError::RetriesExhausted { attempts: 3 }.is_transient_conflict());
        assert!(!DatabaseError::Query(SqlxError::RowNotFound).is_transient_conflict());
    }

    #[test]
    fn test_conflict_message_reports_both_versions() {
        let err = DatabaseError::VersionConflict {
            table: "equipment".to_string(),
            id: 7,
            expected: 1,
            current: 2,
        };
        let message = err.to_string();
        assert!(message.contains("Expected version 1"));
        assert!(message.contains("found 2"));
    }
}
