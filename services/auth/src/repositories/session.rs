//! Session repository for database operations

use common::{DatabaseError, DatabaseResult};
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use crate::models::{ActiveSession, Session, User, UserRole};

const SESSION_COLUMNS: &str =
    "id, user_id, username, login_time, last_activity, is_active, logout_time";

/// Session repository
pub struct SessionRepository;

impl SessionRepository {
    /// Open a new session for `user`
    pub async fn create(conn: &mut PgConnection, user: &User) -> DatabaseResult<Session> {
        let sql = format!(
            "INSERT INTO user_sessions (id, user_id, username) VALUES ($1, $2, $3) \
             RETURNING {SESSION_COLUMNS}"
        );
        let session = sqlx::query_as::<_, Session>(&sql)
            .bind(Uuid::new_v4())
            .bind(user.id)
            .bind(&user.username)
            .fetch_one(&mut *conn)
            .await?;
        Ok(session)
    }

    pub async fn find(conn: &mut PgConnection, id: Uuid) -> DatabaseResult<Option<Session>> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM user_sessions WHERE id = $1");
        let session = sqlx::query_as::<_, Session>(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(session)
    }

    /// Refresh `last_activity`. Returns false when no active session matched.
    pub async fn touch(conn: &mut PgConnection, id: Uuid) -> DatabaseResult<bool> {
        let result = sqlx::query(
            "UPDATE user_sessions SET last_activity = CURRENT_TIMESTAMP \
             WHERE id = $1 AND is_active",
        )
        .bind(id)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Close an active session, returning it as closed
    pub async fn end(conn: &mut PgConnection, id: Uuid) -> DatabaseResult<Option<Session>> {
        let sql = format!(
            "UPDATE user_sessions SET is_active = FALSE, logout_time = CURRENT_TIMESTAMP \
             WHERE id = $1 AND is_active RETURNING {SESSION_COLUMNS}"
        );
        let session = sqlx::query_as::<_, Session>(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(session)
    }

    /// Active sessions with the user's name and role, newest login first
    pub async fn list_active(conn: &mut PgConnection) -> DatabaseResult<Vec<ActiveSession>> {
        let rows = sqlx::query(
            r#"
            SELECT s.id, s.user_id, s.username, u.full_name, u.role,
                   s.login_time, s.last_activity
            FROM user_sessions s
            JOIN users u ON u.id = s.user_id
            WHERE s.is_active
            ORDER BY s.login_time DESC
            "#,
        )
        .fetch_all(&mut *conn)
        .await?;

        let mut sessions = Vec::with_capacity(rows.len());
        for row in rows {
            let role: String = row.try_get("role")?;
            let role = role
                .parse::<UserRole>()
                .map_err(|e| DatabaseError::Query(sqlx::Error::Decode(e.into())))?;

            sessions.push(ActiveSession {
                id: row.try_get("id")?,
                user_id: row.try_get("user_id")?,
                username: row.try_get("username")?,
                full_name: row.try_get("full_name")?,
                role,
                login_time: row.try_get("login_time")?,
                last_activity: row.try_get("last_activity")?,
            });
        }
        Ok(sessions)
    }
}
