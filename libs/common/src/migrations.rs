//! Embedded schema migrations

use sqlx::migrate::Migrator;
use tracing::info;

use crate::database::ConnectionPool;
use crate::error::DatabaseResult;

/// Migrations under `libs/common/migrations`, embedded at compile time
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Apply every pending migration on one pooled connection.
pub async fn run(pool: &ConnectionPool) -> DatabaseResult<()> {
    info!("Running database migrations");

    let mut conn = pool.acquire().await?;
    MIGRATOR.run(&mut *conn).await?;
    pool.release(conn);

    info!("Database migrations applied");
    Ok(())
}
