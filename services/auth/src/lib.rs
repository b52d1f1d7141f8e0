//! User accounts and login sessions for the CMMS application
//!
//! Built on the `common` database layer: every change goes through its
//! transaction manager and leaves an audit entry.

pub mod error;
pub mod manager;
pub mod models;
pub mod password;
pub mod repositories;
pub mod session;
pub mod validation;

pub use error::{AuthError, AuthResult};
pub use manager::UserManager;
pub use models::{ActiveSession, LoginCredentials, NewUser, Session, UpdateUser, User, UserRole};
pub use session::SessionManager;
