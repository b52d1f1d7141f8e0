//! Database configuration
//!
//! Settings are layered with the `config` crate: built-in defaults, then an
//! optional `cmms.toml` file, then `CMMS_DATABASE_*` environment variables.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;
use sqlx::postgres::{PgConnectOptions, PgSslMode};

use crate::error::{DatabaseError, DatabaseResult};
use crate::transaction::RetryConfig;

/// Transaction isolation level applied to every cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub(crate) fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Database configuration struct
#[derive(Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Full connection URL; when set it takes precedence over the
    /// individual connection fields
    #[serde(default)]
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    /// libpq-style SSL mode (`disable`, `prefer`, `require`, ...)
    pub sslmode: String,
    /// Connections opened eagerly at initialization
    pub min_connections: u32,
    /// Upper bound on simultaneously checked-out connections
    pub max_connections: u32,
    /// Seconds `acquire` waits before reporting the pool as exhausted
    pub acquire_timeout_secs: u64,
    /// Seconds `shutdown` waits for outstanding connections
    pub shutdown_timeout_secs: u64,
    pub isolation_level: IsolationLevel,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &self.url.as_ref().map(|_| "***"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"***")
            .field("sslmode", &self.sslmode)
            .field("min_connections", &self.min_connections)
            .field("max_connections", &self.max_connections)
            .field("acquire_timeout_secs", &self.acquire_timeout_secs)
            .field("shutdown_timeout_secs", &self.shutdown_timeout_secs)
            .field("isolation_level", &self.isolation_level)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 5432,
            database: "cmms".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            sslmode: "prefer".to_string(),
            min_connections: 2,
            max_connections: 10,
            acquire_timeout_secs: 30,
            shutdown_timeout_secs: 5,
            isolation_level: IsolationLevel::ReadCommitted,
            max_attempts: 3,
            retry_base_delay_ms: 10,
            retry_max_delay_ms: 100,
        }
    }
}

impl DatabaseConfig {
    /// Create a new DatabaseConfig from defaults and environment variables
    ///
    /// # Environment Variables
    /// - `CMMS_DATABASE_HOST`, `CMMS_DATABASE_PORT`, `CMMS_DATABASE_DATABASE`
    /// - `CMMS_DATABASE_USER`, `CMMS_DATABASE_PASSWORD`, `CMMS_DATABASE_SSLMODE`
    /// - `CMMS_DATABASE_MIN_CONNECTIONS` (default: 2)
    /// - `CMMS_DATABASE_MAX_CONNECTIONS` (default: 10)
    /// - `CMMS_DATABASE_ACQUIRE_TIMEOUT_SECS` (default: 30)
    /// - `CMMS_DATABASE_ISOLATION_LEVEL` (default: read_committed)
    /// - `CMMS_DATABASE_MAX_ATTEMPTS` (default: 3)
    pub fn from_env() -> DatabaseResult<Self> {
        Self::load(None)
    }

    /// Load defaults, then `file` (if given and present), then the environment.
    pub fn load(file: Option<&str>) -> DatabaseResult<Self> {
        let defaults = DatabaseConfig::default();
        let mut builder = Config::builder()
            .set_default("host", defaults.host)
            .and_then(|b| b.set_default("port", i64::from(defaults.port)))
            .and_then(|b| b.set_default("database", defaults.database))
            .and_then(|b| b.set_default("user", defaults.user))
            .and_then(|b| b.set_default("password", defaults.password))
            .and_then(|b| b.set_default("sslmode", defaults.sslmode))
            .and_then(|b| b.set_default("min_connections", i64::from(defaults.min_connections)))
            .and_then(|b| b.set_default("max_connections", i64::from(defaults.max_connections)))
            .and_then(|b| b.set_default("acquire_timeout_secs", defaults.acquire_timeout_secs as i64))
            .and_then(|b| b.set_default("shutdown_timeout_secs", defaults.shutdown_timeout_secs as i64))
            .and_then(|b| b.set_default("isolation_level", "read_committed"))
            .and_then(|b| b.set_default("max_attempts", i64::from(defaults.max_attempts)))
            .and_then(|b| b.set_default("retry_base_delay_ms", defaults.retry_base_delay_ms as i64))
            .and_then(|b| b.set_default("retry_max_delay_ms", defaults.retry_max_delay_ms as i64))
            .map_err(|e| DatabaseError::Configuration(e.to_string()))?;

        if let Some(path) = file {
            builder = builder.add_source(File::with_name(path).required(false));
        }

        builder
            .add_source(
                Environment::with_prefix("CMMS_DATABASE")
                    .prefix_separator("_")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize::<DatabaseConfig>())
            .map_err(|e| DatabaseError::Configuration(e.to_string()))
    }

    /// Configuration pointing at `url`, other settings left at their defaults.
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Check the parameters without touching the store.
    pub fn validate(&self) -> DatabaseResult<()> {
        if self.max_connections == 0 {
            return Err(DatabaseError::Configuration(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(DatabaseError::Configuration(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.url.is_some() {
            return Ok(());
        }
        if self.host.trim().is_empty() {
            return Err(DatabaseError::Configuration("host is required".to_string()));
        }
        if self.port == 0 {
            return Err(DatabaseError::Configuration("port must be non-zero".to_string()));
        }
        if self.database.trim().is_empty() {
            return Err(DatabaseError::Configuration("database is required".to_string()));
        }
        if self.user.trim().is_empty() {
            return Err(DatabaseError::Configuration("user is required".to_string()));
        }
        self.ssl_mode().map(|_| ())
    }

    fn ssl_mode(&self) -> DatabaseResult<PgSslMode> {
        PgSslMode::from_str(&self.sslmode).map_err(|e| {
            DatabaseError::Configuration(format!("Invalid sslmode {:?}: {}", self.sslmode, e))
        })
    }

    /// Build connection options for `sqlx`.
    pub fn connect_options(&self) -> DatabaseResult<PgConnectOptions> {
        self.validate()?;

        if let Some(url) = &self.url {
            return PgConnectOptions::from_str(url)
                .map_err(|e| DatabaseError::Configuration(format!("Invalid database URL: {}", e)));
        }

        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.user)
            .ssl_mode(self.ssl_mode()?);
        if !self.password.is_empty() {
            options = options.password(&self.password);
        }

        Ok(options)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Retry policy for the transaction manager.
    pub fn retry(&self) -> RetryConfig {
        RetryConfig::new()
            .with_max_attempts(self.max_attempts)
            .with_base_delay_ms(self.retry_base_delay_ms)
            .with_max_delay_ms(self.retry_max_delay_ms)
    }
}
