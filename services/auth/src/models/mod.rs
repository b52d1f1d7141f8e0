//! Authentication service models

pub mod session;
pub mod user;

// Re-export for convenience
pub use session::{ActiveSession, Session};
pub use user::{LoginCredentials, NewUser, UpdateUser, User, UserRole};
