//! Optimistic concurrency control on version-stamped rows
//!
//! Every mutable business row carries an integer `version` and an
//! `updated_date`. A writer reads the version it started from, then inside
//! its transaction locks the row with `check_version` and, only on a match,
//! applies its change together with `increment_version`.

use std::sync::OnceLock;

use regex::Regex;
use sqlx::PgConnection;
use tracing::debug;

use crate::error::{DatabaseError, DatabaseResult};

fn validate_identifier(name: &str) -> DatabaseResult<()> {
    static IDENTIFIER_REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = IDENTIFIER_REGEX.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}(\.[A-Za-z_][A-Za-z0-9_]{0,62})?$")
            .expect("Failed to compile identifier regex")
    });

    if regex.is_match(name) {
        Ok(())
    } else {
        Err(DatabaseError::InvalidIdentifier(name.to_string()))
    }
}

/// A table whose rows carry `version` and `updated_date` columns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedTable {
    table: String,
    id_column: String,
}

impl VersionedTable {
    /// Table keyed by an `id` column
    pub fn new(table: impl Into<String>) -> DatabaseResult<Self> {
        let table = table.into();
        validate_identifier(&table)?;
        Ok(Self {
            table,
            id_column: "id".to_string(),
        })
    }

    /// Use a different key column
    pub fn with_id_column(mut self, id_column: impl Into<String>) -> DatabaseResult<Self> {
        let id_column = id_column.into();
        validate_identifier(&id_column)?;
        self.id_column = id_column;
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.table
    }

    pub fn id_column(&self) -> &str {
        &self.id_column
    }
}

/// Outcome of a locked version read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionCheck {
    /// No such record; the update must be abandoned
    NotFound,
    /// Someone else committed a change since the caller read the row
    Conflict { expected: i32, current: i32 },
    /// The row is unchanged and now locked for this transaction
    Match { current: i32 },
}

impl VersionCheck {
    /// Compare the stored version, if any, with the expected one.
    pub fn evaluate(current: Option<i32>, expected: i32) -> Self {
        match current {
            None => VersionCheck::NotFound,
            Some(current) if current != expected => VersionCheck::Conflict { expected, current },
            Some(current) => VersionCheck::Match { current },
        }
    }

    pub fn is_match(&self) -> bool {
        matches!(self, VersionCheck::Match { .. })
    }

    /// Turn `NotFound` and `Conflict` into errors so `?` aborts the unit of work.
    pub fn into_result(self, table: &VersionedTable, id: i64) -> DatabaseResult<i32> {
        match self {
            VersionCheck::Match { current } => Ok(current),
            VersionCheck::NotFound => Err(DatabaseError::RecordNotFound {
                table: table.table.clone(),
                id,
            }),
            VersionCheck::Conflict { expected, current } => Err(DatabaseError::VersionConflict {
                table: table.table.clone(),
                id,
                expected,
                current,
            }),
        }
    }
}

/// Read the current version of a record under a row lock.
///
/// The `FOR UPDATE` lock is held until the surrounding transaction ends, so
/// a concurrent writer checking the same row waits for this one and then
/// sees the bumped version.
pub async fn check_version(
    conn: &mut PgConnection,
    table: &VersionedTable,
    id: i64,
    expected: i32,
) -> DatabaseResult<VersionCheck> {
    let sql = format!(
        "SELECT version FROM {} WHERE {} = $1 FOR UPDATE",
        table.table, table.id_column
    );
    let current: Option<i32> = sqlx::query_scalar(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    let check = VersionCheck::evaluate(current, expected);
    debug!(table = %table.table, id, expected, ?check, "Version check");
    Ok(check)
}

/// Bump `version` by one and refresh `updated_date`, returning the new version.
///
/// Call it in the same transaction as the row mutation, after a `Match`.
pub async fn increment_version(
    conn: &mut PgConnection,
    table: &VersionedTable,
    id: i64,
) -> DatabaseResult<i32> {
    let sql = format!(
        "UPDATE {} SET version = version + 1, updated_date = CURRENT_TIMESTAMP \
         WHERE {} = $1 RETURNING version",
        table.table, table.id_column
    );
    let version: Option<i32> = sqlx::query_scalar(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    version.ok_or_else(|| DatabaseError::RecordNotFound {
        table: table.table.clone(),
        id,
    })
}

/// `check_version` that fails with `RecordNotFound` or `VersionConflict`
/// instead of returning them.
pub async fn require_version(
    conn: &mut PgConnection,
    table: &VersionedTable,
    id: i64,
    expected: i32,
) -> DatabaseResult<i32> {
    check_version(conn, table, id, expected)
        .await?
        .into_result(table, id)
}
