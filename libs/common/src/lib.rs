//! Common library for the CMMS application
//!
//! This crate provides the multi-user database access layer used by every
//! screen of the application: the connection pool, scoped cursors,
//! optimistic concurrency control, the retrying transaction manager and the
//! audit logger.
//!
//! # Example
//!
//! ```rust,no_run
//! use common::{
//!     AuditAction, AuditEntry, AuditLogger, ConnectionPool, DatabaseConfig, DatabaseError,
//!     TransactionManager, VersionedTable, occ,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DatabaseConfig::from_env()?;
//!     let pool = ConnectionPool::new();
//!     pool.initialize(&config).await?;
//!
//!     let transactions = TransactionManager::new(pool.clone(), config.retry());
//!     let equipment = VersionedTable::new("equipment")?;
//!
//!     let version = transactions
//!         .run(|cursor| {
//!             let equipment = equipment.clone();
//!             Box::pin(async move {
//!                 occ::require_version(cursor.conn(), &equipment, 42, 3).await?;
//!                 sqlx::query("UPDATE equipment SET status = 'Down' WHERE id = $1")
//!                     .bind(42_i64)
//!                     .execute(cursor.conn())
//!                     .await?;
//!                 let version = occ::increment_version(cursor.conn(), &equipment, 42).await?;
//!                 let entry = AuditEntry::new("jsmith", AuditAction::Update, "equipment", 42)
//!                     .with_notes("Marked down");
//!                 AuditLogger::log(cursor.conn(), &entry).await?;
//!                 Ok::<_, DatabaseError>(version)
//!             })
//!         })
//!         .await?;
//!
//!     println!("equipment 42 is now at version {}", version);
//!     pool.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod config;
pub mod cursor;
pub mod database;
pub mod error;
pub mod migrations;
pub mod occ;
pub mod transaction;

pub use audit::{AuditAction, AuditEntry, AuditLogger};
pub use config::{DatabaseConfig, IsolationLevel};
pub use cursor::Cursor;
pub use database::{ConnectionPool, PoolStatus};
pub use error::{DatabaseError, DatabaseResult, TransientConflict};
pub use occ::{VersionCheck, VersionedTable};
pub use transaction::{RetryConfig, TransactionManager, retry_on_conflict};
