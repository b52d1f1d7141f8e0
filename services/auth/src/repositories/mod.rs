//! Data access for the `users` and `user_sessions` tables
//!
//! Every function runs on the caller's connection so that it takes part in
//! the caller's transaction.

pub mod session;
pub mod user;

pub use session::SessionRepository;
pub use user::UserRepository;
