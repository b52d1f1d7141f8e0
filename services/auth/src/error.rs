//! Error types for user and session management

use common::{DatabaseError, TransientConflict};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    /// Unknown user, inactive account or wrong password. The cause is not
    /// revealed to the caller.
    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("Username already exists: {0}")]
    UsernameTaken(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// The session does not exist or was already ended
    #[error("Session not found or no longer active")]
    SessionNotFound,

    #[error("Password hashing error: {0}")]
    PasswordHash(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl From<sqlx::Error> for AuthError {
    fn from(err: sqlx::Error) -> Self {
        AuthError::Database(err.into())
    }
}

impl TransientConflict for AuthError {
    fn is_transient_conflict(&self) -> bool {
        match self {
            AuthError::Database(err) => err.is_transient_conflict(),
            _ => false,
        }
    }
}

pub type AuthResult<T> = Result<T, AuthError>;
