//! Session model and related functionality

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::models::UserRole;

/// Session entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Session {
    pub id: Uuid,
    pub user_id: i64,
    pub username: String,
    pub login_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub is_active: bool,
    pub logout_time: Option<DateTime<Utc>>,
}

/// An open session joined with its user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveSession {
    pub id: Uuid,
    pub user_id: i64,
    pub username: String,
    pub full_name: String,
    pub role: UserRole,
    pub login_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}
