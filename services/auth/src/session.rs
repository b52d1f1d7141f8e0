//! Login session tracking in the `user_sessions` table

use common::TransactionManager;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{AuthError, AuthResult};
use crate::models::{ActiveSession, Session, User};
use crate::repositories::SessionRepository;

/// Session manager for opening, refreshing and closing user sessions
#[derive(Clone)]
pub struct SessionManager {
    transactions: TransactionManager,
}

impl SessionManager {
    /// Create a new session manager
    pub fn new(transactions: TransactionManager) -> Self {
        Self { transactions }
    }

    /// Create a new session for a user
    pub async fn create_session(&self, user: &User) -> AuthResult<Session> {
        info!("Creating session for user: {}", user.username);

        let user = user.clone();
        self.transactions
            .run(move |cursor| {
                let user = user.clone();
                Box::pin(async move {
                    let session = SessionRepository::create(cursor.conn(), &user).await?;
                    Ok::<_, AuthError>(session)
                })
            })
            .await
    }

    /// Get a session by id, active or not
    pub async fn get_session(&self, session_id: Uuid) -> AuthResult<Option<Session>> {
        self.transactions
            .pool()
            .with_cursor(false, move |cursor| {
                Box::pin(async move {
                    let session = SessionRepository::find(cursor.conn(), session_id).await?;
                    Ok::<_, AuthError>(session)
                })
            })
            .await
    }

    /// Record activity on an open session
    pub async fn update_session_activity(&self, session_id: Uuid) -> AuthResult<()> {
        debug!("Updating activity for session: {}", session_id);

        self.transactions
            .run(move |cursor| {
                Box::pin(async move {
                    if SessionRepository::touch(cursor.conn(), session_id).await? {
                        Ok::<_, AuthError>(())
                    } else {
                        Err(AuthError::SessionNotFound)
                    }
                })
            })
            .await
    }

    /// Close a session and return it as closed
    pub async fn end_session(&self, session_id: Uuid) -> AuthResult<Session> {
        info!("Ending session: {}", session_id);

        self.transactions
            .run(move |cursor| {
                Box::pin(async move {
                    let session = SessionRepository::end(cursor.conn(), session_id).await?;
                    session.ok_or(AuthError::SessionNotFound)
                })
            })
            .await
    }

    /// Check if a session exists and is still open
    pub async fn is_session_valid(&self, session_id: Uuid) -> AuthResult<bool> {
        Ok(self
            .get_session(session_id)
            .await?
            .is_some_and(|session| session.is_active))
    }

    /// Open sessions with user details, newest login first
    pub async fn list_active_sessions(&self) -> AuthResult<Vec<ActiveSession>> {
        self.transactions
            .pool()
            .with_cursor(false, |cursor| {
                Box::pin(async move {
                    let sessions = SessionRepository::list_active(cursor.conn()).await?;
                    Ok::<_, AuthError>(sessions)
                })
            })
            .await
    }
}
