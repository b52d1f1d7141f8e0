//! User repository for database operations

use common::{DatabaseError, DatabaseResult};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};
use tracing::debug;

use crate::models::{NewUser, UpdateUser, User, UserRole};

const USER_COLUMNS: &str = "id, username, full_name, email, role, is_active, last_login, \
     created_by, notes, created_date, updated_date, version";

/// A user together with the stored password hash
pub(crate) struct UserCredentials {
    pub user: User,
    pub password_hash: String,
}

fn user_from_row(row: &PgRow) -> Result<User, sqlx::Error> {
    let role: String = row.try_get("role")?;
    let role = role
        .parse::<UserRole>()
        .map_err(|e| sqlx::Error::Decode(e.into()))?;

    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        full_name: row.try_get("full_name")?,
        email: row.try_get("email")?,
        role,
        is_active: row.try_get("is_active")?,
        last_login: row.try_get("last_login")?,
        created_by: row.try_get("created_by")?,
        notes: row.try_get("notes")?,
        created_date: row.try_get("created_date")?,
        updated_date: row.try_get("updated_date")?,
        version: row.try_get("version")?,
    })
}

/// User repository
pub struct UserRepository;

impl UserRepository {
    /// Insert a user whose password is already hashed
    pub async fn create(
        conn: &mut PgConnection,
        new_user: &NewUser,
        password_hash: &str,
        created_by: &str,
    ) -> DatabaseResult<User> {
        debug!("Creating new user: {}", new_user.username);

        let sql = format!(
            r#"
            INSERT INTO users (username, full_name, email, role, password_hash, created_by, notes)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {USER_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(&new_user.username)
            .bind(&new_user.full_name)
            .bind(new_user.email.as_deref().filter(|e| !e.is_empty()))
            .bind(new_user.role.as_str())
            .bind(password_hash)
            .bind(created_by)
            .bind(&new_user.notes)
            .fetch_one(&mut *conn)
            .await?;

        Ok(user_from_row(&row)?)
    }

    /// Find a user and its password hash by username
    pub(crate) async fn find_credentials(
        conn: &mut PgConnection,
        username: &str,
    ) -> DatabaseResult<Option<UserCredentials>> {
        debug!("Finding credentials for user: {}", username);

        let sql = format!("SELECT {USER_COLUMNS}, password_hash FROM users WHERE username = $1");
        let row = sqlx::query(&sql)
            .bind(username)
            .fetch_optional(&mut *conn)
            .await?;

        match row {
            Some(row) => Ok(Some(UserCredentials {
                user: user_from_row(&row)?,
                password_hash: row.try_get("password_hash")?,
            })),
            None => Ok(None),
        }
    }

    /// Find a user by ID
    pub async fn find_by_id(conn: &mut PgConnection, id: i64) -> DatabaseResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;

        row.map(|row| user_from_row(&row).map_err(DatabaseError::from))
            .transpose()
    }

    pub async fn username_exists(conn: &mut PgConnection, username: &str) -> DatabaseResult<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE username = $1)")
                .bind(username)
                .fetch_one(&mut *conn)
                .await?;
        Ok(exists)
    }

    /// All users, newest first
    pub async fn list(conn: &mut PgConnection) -> DatabaseResult<Vec<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users ORDER BY created_date DESC, id DESC");
        let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;

        rows.iter()
            .map(|row| user_from_row(row).map_err(DatabaseError::from))
            .collect()
    }

    pub async fn count(conn: &mut PgConnection) -> DatabaseResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&mut *conn)
            .await?;
        Ok(count)
    }

    /// Apply the fields set in `changes`. The version is bumped separately.
    ///
    /// An empty email clears the column, as it does on insert.
    pub async fn update(
        conn: &mut PgConnection,
        id: i64,
        changes: &UpdateUser,
        password_hash: Option<&str>,
    ) -> DatabaseResult<()> {
        sqlx::query(
            r#"
            UPDATE users SET
                full_name = COALESCE($2, full_name),
                email = CASE WHEN $3::TEXT IS NULL THEN email ELSE NULLIF($3, '') END,
                role = COALESCE($4, role),
                is_active = COALESCE($5, is_active),
                notes = COALESCE($6, notes),
                password_hash = COALESCE($7, password_hash)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&changes.full_name)
        .bind(&changes.email)
        .bind(changes.role.map(|role| role.as_str()))
        .bind(changes.is_active)
        .bind(&changes.notes)
        .bind(password_hash)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Stamp a successful sign-in. The caller bumps the version.
    pub async fn touch_last_login(conn: &mut PgConnection, id: i64) -> DatabaseResult<()> {
        sqlx::query("UPDATE users SET last_login = CURRENT_TIMESTAMP WHERE id = $1")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}
