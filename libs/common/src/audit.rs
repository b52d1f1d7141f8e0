//! Append-only audit trail
//!
//! Entries are written through the caller's cursor, inside the transaction
//! of the mutation they describe, so an entry is committed exactly when the
//! mutation is.

use std::fmt;

use serde::Serialize;
use serde_json::Value;
use sqlx::PgConnection;
use tracing::debug;

use crate::error::DatabaseResult;

/// Kind of action recorded in the audit log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditAction {
    Insert,
    Update,
    Delete,
    Login,
    Logout,
    /// Any other action label, stored as given
    Other(String),
}

impl AuditAction {
    pub fn as_str(&self) -> &str {
        match self {
            AuditAction::Insert => "INSERT",
            AuditAction::Update => "UPDATE",
            AuditAction::Delete => "DELETE",
            AuditAction::Login => "LOGIN",
            AuditAction::Logout => "LOGOUT",
            AuditAction::Other(label) => label,
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit record, built before it is logged
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub user_name: String,
    pub action: AuditAction,
    pub table_name: String,
    pub record_id: String,
    pub old_values: Option<Value>,
    pub new_values: Option<Value>,
    pub notes: Option<String>,
}

impl AuditEntry {
    pub fn new(
        user_name: impl Into<String>,
        action: AuditAction,
        table_name: impl Into<String>,
        record_id: impl ToString,
    ) -> Self {
        Self {
            user_name: user_name.into(),
            action,
            table_name: table_name.into(),
            record_id: record_id.to_string(),
            old_values: None,
            new_values: None,
            notes: None,
        }
    }

    /// Snapshot of the row before the change
    pub fn with_old_values(mut self, values: Value) -> Self {
        self.old_values = Some(values);
        self
    }

    /// Snapshot of the row after the change
    pub fn with_new_values(mut self, values: Value) -> Self {
        self.new_values = Some(values);
        self
    }

    /// Serialize `old` as the before-snapshot.
    pub fn with_old<T: Serialize>(self, old: &T) -> DatabaseResult<Self> {
        Ok(self.with_old_values(serde_json::to_value(old)?))
    }

    /// Serialize `new` as the after-snapshot.
    pub fn with_new<T: Serialize>(self, new: &T) -> DatabaseResult<Self> {
        Ok(self.with_new_values(serde_json::to_value(new)?))
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// Writer for the `audit_log` table
///
/// Entries can only be appended.
pub struct AuditLogger;

impl AuditLogger {
    /// Append `entry` in the caller's transaction and return its id.
    pub async fn log(conn: &mut PgConnection, entry: &AuditEntry) -> DatabaseResult<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO audit_log
                (user_name, action, table_name, record_id, old_values, new_values, notes, action_timestamp)
            VALUES ($1, $2, $3, $4, $5, $6, $7, CURRENT_TIMESTAMP)
            RETURNING id
            "#,
        )
        .bind(&entry.user_name)
        .bind(entry.action.as_str())
        .bind(&entry.table_name)
        .bind(&entry.record_id)
        .bind(&entry.old_values)
        .bind(&entry.new_values)
        .bind(&entry.notes)
        .fetch_one(&mut *conn)
        .await?;

        debug!(
            id,
            action = %entry.action,
            table = %entry.table_name,
            record = %entry.record_id,
            "Audit entry written"
        );
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize)]
    struct Equipment {
        description: String,
        status: String,
    }

    #[test]
    fn test_action_labels() {
        assert_eq!(AuditAction::Insert.to_string(), "INSERT");
        assert_eq!(AuditAction::Logout.as_str(), "LOGOUT");
        assert_eq!(
            AuditAction::Other("STOCK_ADJUST".to_string()).as_str(),
            "STOCK_ADJUST"
        );
    }

    #[test]
    fn test_entry_builder() {
        let before = Equipment {
            description: "Conveyor".to_string(),
            status: "Active".to_string(),
        };
        let entry = AuditEntry::new("jsmith", AuditAction::Update, "equipment", 42)
            .with_old(&before)
            .unwrap()
            .with_new_values(json!({"status": "Run to Failure"}))
            .with_notes("Status change");

        assert_eq!(entry.record_id, "42");
        assert_eq!(
            entry.old_values,
            Some(json!({"description": "Conveyor", "status": "Active"}))
        );
        assert_eq!(entry.new_values, Some(json!({"status": "Run to Failure"})));
        assert_eq!(entry.notes.as_deref(), Some("Status change"));
    }
}
