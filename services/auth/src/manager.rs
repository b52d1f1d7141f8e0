//! User accounts, authentication and audited account changes
//!
//! Every mutation runs through the [`TransactionManager`], so it is retried
//! on transient conflicts and its audit entry commits together with it.

use common::occ::{increment_version, require_version};
use common::{
    AuditAction, AuditEntry, AuditLogger, DatabaseError, TransactionManager, VersionedTable,
};
use sqlx::PgConnection;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{AuthError, AuthResult};
use crate::models::{ActiveSession, NewUser, Session, UpdateUser, User};
use crate::password::{hash_password, verify_password};
use crate::repositories::{SessionRepository, UserRepository};
use crate::session::SessionManager;
use crate::validation::{validate_new_user, validate_update};

const USERS_TABLE: &str = "users";
const SESSIONS_TABLE: &str = "user_sessions";

/// Check a username/password pair. Nothing is written.
///
/// Unknown users, inactive accounts and wrong passwords are reported the
/// same way.
async fn verify_credentials(
    conn: &mut PgConnection,
    username: &str,
    password: &str,
) -> AuthResult<User> {
    let Some(credentials) = UserRepository::find_credentials(conn, username).await? else {
        debug!("Authentication failed for {}: unknown user", username);
        return Err(AuthError::InvalidCredentials);
    };

    if !credentials.user.is_active {
        debug!("Authentication failed for {}: account inactive", username);
        return Err(AuthError::InvalidCredentials);
    }

    if !verify_password(password, &credentials.password_hash)? {
        debug!("Authentication failed for {}: wrong password", username);
        return Err(AuthError::InvalidCredentials);
    }

    Ok(credentials.user)
}

/// Stamp `last_login` as a versioned change of the user row and return the
/// row as stored.
async fn record_login(
    conn: &mut PgConnection,
    users: &VersionedTable,
    user_id: i64,
) -> AuthResult<User> {
    UserRepository::touch_last_login(conn, user_id).await?;
    increment_version(conn, users, user_id).await?;

    let user = UserRepository::find_by_id(conn, user_id)
        .await?
        .ok_or_else(|| DatabaseError::RecordNotFound {
            table: users.name().to_string(),
            id: user_id,
        })?;
    Ok(user)
}

/// A unique violation on insert means another writer took the username first.
fn insert_error(err: DatabaseError, username: &str) -> AuthError {
    let duplicate = matches!(
        &err,
        DatabaseError::Query(e) if e
            .as_database_error()
            .is_some_and(|db| db.is_unique_violation())
    );

    if duplicate {
        AuthError::UsernameTaken(username.to_string())
    } else {
        AuthError::Database(err)
    }
}

/// Manages user accounts and their sessions
#[derive(Clone)]
pub struct UserManager {
    transactions: TransactionManager,
    sessions: SessionManager,
    users_table: VersionedTable,
}

impl UserManager {
    pub fn new(transactions: TransactionManager) -> AuthResult<Self> {
        Ok(Self {
            sessions: SessionManager::new(transactions.clone()),
            users_table: VersionedTable::new(USERS_TABLE)?,
            transactions,
        })
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Verify credentials and return the user, without the password hash.
    ///
    /// Runs on a read-only cursor; use `login` to record the sign-in.
    pub async fn authenticate(&self, username: &str, password: &str) -> AuthResult<User> {
        let username = username.to_string();
        let password = password.to_string();

        self.transactions
            .pool()
            .with_cursor(false, move |cursor| {
                Box::pin(async move {
                    let user = verify_credentials(cursor.conn(), &username, &password).await?;
                    Ok::<_, AuthError>(user)
                })
            })
            .await
    }

    /// Authenticate, stamp `last_login`, open a session and audit the login
    /// in one transaction.
    pub async fn login(&self, username: &str, password: &str) -> AuthResult<(User, Session)> {
        let username = username.to_string();
        let password = password.to_string();
        let table = self.users_table.clone();

        let (user, session) = self
            .transactions
            .run(move |cursor| {
                let username = username.clone();
                let password = password.clone();
                let table = table.clone();
                Box::pin(async move {
                    let user = verify_credentials(cursor.conn(), &username, &password).await?;
                    let user = record_login(cursor.conn(), &table, user.id).await?;
                    let session = SessionRepository::create(cursor.conn(), &user).await?;

                    let entry = AuditEntry::new(
                        &user.username,
                        AuditAction::Login,
                        SESSIONS_TABLE,
                        session.id,
                    )
                    .with_notes(format!("{} signed in as {}", user.full_name, user.role));
                    AuditLogger::log(cursor.conn(), &entry).await?;

                    Ok::<_, AuthError>((user, session))
                })
            })
            .await?;

        info!("User {} logged in (session {})", user.username, session.id);
        Ok((user, session))
    }

    /// Close a session and audit the logout in one transaction.
    pub async fn logout(&self, session_id: Uuid) -> AuthResult<Session> {
        let session = self
            .transactions
            .run(move |cursor| {
                Box::pin(async move {
                    let session = SessionRepository::end(cursor.conn(), session_id)
                        .await?
                        .ok_or(AuthError::SessionNotFound)?;

                    let entry = AuditEntry::new(
                        &session.username,
                        AuditAction::Logout,
                        SESSIONS_TABLE,
                        session.id,
                    );
                    AuditLogger::log(cursor.conn(), &entry).await?;

                    Ok::<_, AuthError>(session)
                })
            })
            .await?;

        info!("User {} logged out (session {})", session.username, session.id);
        Ok(session)
    }

    pub async fn create_session(&self, user: &User) -> AuthResult<Session> {
        self.sessions.create_session(user).await
    }

    pub async fn update_session_activity(&self, session_id: Uuid) -> AuthResult<()> {
        self.sessions.update_session_activity(session_id).await
    }

    pub async fn end_session(&self, session_id: Uuid) -> AuthResult<Session> {
        self.sessions.end_session(session_id).await
    }

    pub async fn list_active_sessions(&self) -> AuthResult<Vec<ActiveSession>> {
        self.sessions.list_active_sessions().await
    }

    /// Create an account on behalf of `actor`
    pub async fn create_user(&self, actor: &str, new_user: NewUser) -> AuthResult<User> {
        validate_new_user(&new_user).map_err(AuthError::Validation)?;
        let password_hash = hash_password(&new_user.password)?;
        let created_by = actor.to_string();

        let user = self
            .transactions
            .run(move |cursor| {
                let new_user = new_user.clone();
                let password_hash = password_hash.clone();
                let actor = created_by.clone();
                Box::pin(async move {
                    if UserRepository::username_exists(cursor.conn(), &new_user.username).await? {
                        return Err(AuthError::UsernameTaken(new_user.username));
                    }

                    let user =
                        UserRepository::create(cursor.conn(), &new_user, &password_hash, &actor)
                            .await
                            .map_err(|e| insert_error(e, &new_user.username))?;

                    let entry = AuditEntry::new(&actor, AuditAction::Insert, USERS_TABLE, user.id)
                        .with_new(&user)?
                        .with_notes(format!(
                            "Created new {} user: {}",
                            user.role, user.full_name
                        ));
                    AuditLogger::log(cursor.conn(), &entry).await?;

                    Ok::<_, AuthError>(user)
                })
            })
            .await?;

        info!("User {} created by {}", user.username, actor);
        Ok(user)
    }

    /// Update an account that the caller read at `expected_version`.
    ///
    /// Fails with `DatabaseError::VersionConflict` when someone else changed
    /// the account in the meantime.
    pub async fn update_user(
        &self,
        actor: &str,
        id: i64,
        expected_version: i32,
        changes: UpdateUser,
    ) -> AuthResult<User> {
        if changes.is_empty() {
            return Err(AuthError::Validation("Nothing to update".to_string()));
        }
        validate_update(&changes).map_err(AuthError::Validation)?;

        let password_hash = changes
            .password
            .as_deref()
            .map(hash_password)
            .transpose()?;
        let changed_by = actor.to_string();
        let table = self.users_table.clone();

        let user = self
            .transactions
            .run(move |cursor| {
                let changes = changes.clone();
                let password_hash = password_hash.clone();
                let actor = changed_by.clone();
                let table = table.clone();
                Box::pin(async move {
                    require_version(cursor.conn(), &table, id, expected_version).await?;

                    let before = UserRepository::find_by_id(cursor.conn(), id)
                        .await?
                        .ok_or_else(|| DatabaseError::RecordNotFound {
                            table: table.name().to_string(),
                            id,
                        })?;

                    UserRepository::update(cursor.conn(), id, &changes, password_hash.as_deref())
                        .await?;
                    let version = increment_version(cursor.conn(), &table, id).await?;

                    let after = UserRepository::find_by_id(cursor.conn(), id)
                        .await?
                        .ok_or_else(|| DatabaseError::RecordNotFound {
                            table: table.name().to_string(),
                            id,
                        })?;
                    debug!(id, version, "User row updated");

                    let notes = if changes.password.is_some() {
                        format!("Updated user: {} (password changed)", after.username)
                    } else {
                        format!("Updated user: {}", after.username)
                    };
                    let entry = AuditEntry::new(&actor, AuditAction::Update, table.name(), id)
                        .with_old(&before)?
                        .with_new(&after)?
                        .with_notes(notes);
                    AuditLogger::log(cursor.conn(), &entry).await?;

                    Ok::<_, AuthError>(after)
                })
            })
            .await?;

        info!(
            "User {} updated by {} to version {}",
            user.username, actor, user.version
        );
        Ok(user)
    }

    /// All accounts, newest first
    pub async fn list_users(&self) -> AuthResult<Vec<User>> {
        self.transactions
            .pool()
            .with_cursor(false, |cursor| {
                Box::pin(async move {
                    let users = UserRepository::list(cursor.conn()).await?;
                    Ok::<_, AuthError>(users)
                })
            })
            .await
    }

    pub async fn find_user(&self, id: i64) -> AuthResult<Option<User>> {
        self.transactions
            .pool()
            .with_cursor(false, move |cursor| {
                Box::pin(async move {
                    let user = UserRepository::find_by_id(cursor.conn(), id).await?;
                    Ok::<_, AuthError>(user)
                })
            })
            .await
    }

    pub async fn count_users(&self) -> AuthResult<i64> {
        self.transactions
            .pool()
            .with_cursor(false, |cursor| {
                Box::pin(async move {
                    let count = UserRepository::count(cursor.conn()).await?;
                    Ok::<_, AuthError>(count)
                })
            })
            .await
    }
}
