use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use auth::{NewUser, UserManager, UserRole};
use common::{ConnectionPool, DatabaseConfig, TransactionManager, migrations};

const BOOTSTRAP_ACTOR: &str = "system";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    info!("Starting CMMS administration tool");

    let config_file = std::env::var("CMMS_CONFIG").ok();
    let db_config = DatabaseConfig::load(config_file.as_deref())?;
    info!("Database configuration: {:?}", db_config);

    let pool = ConnectionPool::new();
    pool.initialize(&db_config).await?;

    let result = run(&pool, &db_config).await;
    pool.shutdown().await;
    result
}

async fn run(pool: &ConnectionPool, db_config: &DatabaseConfig) -> Result<()> {
    migrations::run(pool).await.context("Failed to apply migrations")?;

    // Check database connectivity
    if pool.health_check().await? {
        info!("Database connection successful");
    } else {
        anyhow::bail!("Failed to connect to database");
    }

    let transactions = TransactionManager::new(pool.clone(), db_config.retry());
    let users = UserManager::new(transactions)?;

    bootstrap_manager(&users).await?;

    let sessions = users.list_active_sessions().await?;
    info!("{} active session(s)", sessions.len());
    for session in &sessions {
        info!(
            "  {} ({}, {}) since {}",
            session.username, session.full_name, session.role, session.login_time
        );
    }

    let status = pool.status().await?;
    info!(
        "Pool status: {} connection(s), {} idle",
        status.size, status.idle
    );

    Ok(())
}

/// Create the first manager account on an empty installation.
async fn bootstrap_manager(users: &UserManager) -> Result<()> {
    if users.count_users().await? > 0 {
        return Ok(());
    }

    let (Ok(username), Ok(password)) = (
        std::env::var("CMMS_BOOTSTRAP_USER"),
        std::env::var("CMMS_BOOTSTRAP_PASSWORD"),
    ) else {
        warn!("No users exist; set CMMS_BOOTSTRAP_USER and CMMS_BOOTSTRAP_PASSWORD to create one");
        return Ok(());
    };

    let full_name = std::env::var("CMMS_BOOTSTRAP_FULL_NAME").unwrap_or_else(|_| username.clone());
    let manager = users
        .create_user(
            BOOTSTRAP_ACTOR,
            NewUser::new(username, full_name, UserRole::Manager, password),
        )
        .await
        .context("Failed to create the first manager account")?;

    info!("Created manager account {}", manager.username);
    Ok(())
}
