//! Integration tests for accounts and sessions
//!
//! These tests run against the PostgreSQL database named by
//! `CMMS_TEST_DATABASE_URL`. When the variable is unset they return early.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use auth::{AuthError, NewUser, UpdateUser, UserManager, UserRole};
use common::{
    ConnectionPool, DatabaseConfig, DatabaseError, RetryConfig, TransactionManager, migrations,
};
use serial_test::serial;
use sqlx::Row;

static SEQUENCE: AtomicU32 = AtomicU32::new(0);

/// Username that no other test run has used
fn unique_username(prefix: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    format!(
        "{}_{:x}{}",
        prefix,
        nanos,
        SEQUENCE.fetch_add(1, Ordering::SeqCst)
    )
}

async fn test_manager() -> Option<(UserManager, ConnectionPool)> {
    let Ok(url) = std::env::var("CMMS_TEST_DATABASE_URL") else {
        eprintln!("CMMS_TEST_DATABASE_URL not set, skipping database test");
        return None;
    };

    let config = DatabaseConfig {
        min_connections: 1,
        max_connections: 8,
        acquire_timeout_secs: 5,
        shutdown_timeout_secs: 1,
        ..DatabaseConfig::from_url(url)
    };
    let pool = ConnectionPool::new();
    pool.initialize(&config).await.expect("initialize pool");
    migrations::run(&pool).await.expect("run migrations");

    let transactions = TransactionManager::new(pool.clone(), RetryConfig::new());
    let manager = UserManager::new(transactions).expect("user manager");
    Some((manager, pool))
}

async fn audit_count(pool: &ConnectionPool, table: &str, record_id: &str, action: &str) -> i64 {
    let mut conn = pool.acquire().await.expect("acquire");
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM audit_log WHERE table_name = $1 AND record_id = $2 AND action = $3",
    )
    .bind(table)
    .bind(record_id)
    .bind(action)
    .fetch_one(&mut *conn)
    .await
    .expect("count audit entries");
    pool.release(conn);
    count
}

#[tokio::test]
async fn test_invalid_input_is_rejected_before_touching_the_store() {
    // The pool is never initialized, so reaching the store would fail differently.
    let manager = UserManager::new(TransactionManager::new(
        ConnectionPool::new(),
        RetryConfig::new(),
    ))
    .unwrap();

    let short_password = NewUser::new("bob", "Bob Smith", UserRole::Technician, "pw");
    assert!(matches!(
        manager.create_user("admin", short_password).await,
        Err(AuthError::Validation(_))
    ));

    let no_name = NewUser::new("bob", "", UserRole::Technician, "right");
    assert!(matches!(
        manager.create_user("admin", no_name).await,
        Err(AuthError::Validation(_))
    ));

    assert!(matches!(
        manager.update_user("admin", 1, 1, UpdateUser::default()).await,
        Err(AuthError::Validation(_))
    ));

    assert!(matches!(
        manager.authenticate("bob", "right").await,
        Err(AuthError::Database(DatabaseError::NotInitialized))
    ));
}

#[tokio::test]
async fn test_authenticate_wrong_then_right_password() {
    let Some((manager, pool)) = test_manager().await else {
        return;
    };
    let username = unique_username("bob");

    let created = manager
        .create_user(
            "admin",
            NewUser::new(&username, "Bob Smith", UserRole::Technician, "right"),
        )
        .await
        .unwrap();
    assert_eq!(created.version, 1);
    assert!(created.last_login.is_none());
    assert_eq!(created.created_by.as_deref(), Some("admin"));

    assert!(matches!(
        manager.authenticate(&username, "wrong").await,
        Err(AuthError::InvalidCredentials)
    ));
    assert!(matches!(
        manager.authenticate("nobody_by_that_name", "right").await,
        Err(AuthError::InvalidCredentials)
    ));

    let user = manager.authenticate(&username, "right").await.unwrap();
    assert_eq!(user.id, created.id);
    assert_eq!(user.full_name, "Bob Smith");
    assert_eq!(user.role, UserRole::Technician);
    assert!(user.last_login.is_none());
    assert_eq!(user.version, 1);
    assert_eq!(user.updated_date, created.updated_date);

    let stored = manager.find_user(created.id).await.unwrap().unwrap();
    assert_eq!(stored, created);

    let snapshot = serde_json::to_value(&user).unwrap();
    assert!(snapshot.get("password_hash").is_none());

    let record_id = created.id.to_string();
    assert_eq!(audit_count(&pool, "users", &record_id, "INSERT").await, 1);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_login_stamp_is_a_versioned_change() {
    let Some((manager, pool)) = test_manager().await else {
        return;
    };
    let username = unique_username("gwen");

    let created = manager
        .create_user(
            "admin",
            NewUser::new(&username, "Gwen Black", UserRole::Technician, "right"),
        )
        .await
        .unwrap();

    let (user, session) = manager.login(&username, "right").await.unwrap();
    assert!(user.last_login.is_some());
    assert_eq!(user.version, created.version + 1);
    assert!(user.updated_date > created.updated_date);

    let stored = manager.find_user(created.id).await.unwrap().unwrap();
    assert_eq!(stored, user);

    // An editor holding the pre-login version must re-read the account.
    let stale = manager
        .update_user(
            "admin",
            created.id,
            created.version,
            UpdateUser {
                notes: Some("night shift".to_string()),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(
        stale,
        Err(AuthError::Database(DatabaseError::VersionConflict {
            expected: 1,
            current: 2,
            ..
        }))
    ));

    manager.logout(session.id).await.unwrap();
    pool.shutdown().await;
}

#[tokio::test]
async fn test_empty_email_clears_the_stored_address() {
    let Some((manager, pool)) = test_manager().await else {
        return;
    };
    let username = unique_username("hank");

    let created = manager
        .create_user(
            "admin",
            NewUser::new(&username, "Hank Green", UserRole::Technician, "right")
                .with_email("hank@plant.example.com"),
        )
        .await
        .unwrap();
    assert_eq!(created.email.as_deref(), Some("hank@plant.example.com"));

    let untouched = manager
        .update_user(
            "admin",
            created.id,
            created.version,
            UpdateUser {
                notes: Some("keeps email".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(untouched.email, created.email);

    let cleared = manager
        .update_user(
            "admin",
            created.id,
            untouched.version,
            UpdateUser {
                email: Some(String::new()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(cleared.email, None);

    let never_set = manager
        .create_user(
            "admin",
            NewUser::new(unique_username("ivy"), "Ivy Stone", UserRole::Technician, "right")
                .with_email(""),
        )
        .await
        .unwrap();
    assert_eq!(never_set.email, cleared.email);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_inactive_account_cannot_sign_in() {
    let Some((manager, pool)) = test_manager().await else {
        return;
    };
    let username = unique_username("carol");

    let user = manager
        .create_user(
            "admin",
            NewUser::new(&username, "Carol Jones", UserRole::Manager, "right"),
        )
        .await
        .unwrap();

    let deactivated = manager
        .update_user(
            "admin",
            user.id,
            user.version,
            UpdateUser {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!deactivated.is_active);

    assert!(matches!(
        manager.authenticate(&username, "right").await,
        Err(AuthError::InvalidCredentials)
    ));

    pool.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_username_is_rejected() {
    let Some((manager, pool)) = test_manager().await else {
        return;
    };
    let username = unique_username("dup");

    manager
        .create_user(
            "admin",
            NewUser::new(&username, "First", UserRole::Technician, "right"),
        )
        .await
        .unwrap();

    let result = manager
        .create_user(
            "admin",
            NewUser::new(&username, "Second", UserRole::Technician, "right"),
        )
        .await;
    assert!(matches!(result, Err(AuthError::UsernameTaken(name)) if name == username));

    pool.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_creates_of_one_username_have_one_winner() {
    let Some((manager, pool)) = test_manager().await else {
        return;
    };
    let username = unique_username("race");

    let mut handles = Vec::new();
    for n in 0..5 {
        let manager = manager.clone();
        let username = username.clone();
        handles.push(tokio::spawn(async move {
            manager
                .create_user(
                    "admin",
                    NewUser::new(username, format!("Racer {}", n), UserRole::Technician, "right"),
                )
                .await
        }));
    }

    let mut created = 0;
    let mut taken = 0;
    for handle in handles {
        match handle.await.expect("task panicked") {
            Ok(_) => created += 1,
            Err(AuthError::UsernameTaken(_)) => taken += 1,
            Err(other) => panic!("unexpected error: {}", other),
        }
    }
    assert_eq!(created, 1);
    assert_eq!(taken, 4);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_update_user_detects_stale_version() {
    let Some((manager, pool)) = test_manager().await else {
        return;
    };
    let username = unique_username("dave");

    let user = manager
        .create_user(
            "admin",
            NewUser::new(&username, "Dave Brown", UserRole::Technician, "right"),
        )
        .await
        .unwrap();

    let promoted = manager
        .update_user(
            "manager_a",
            user.id,
            1,
            UpdateUser {
                role: Some(UserRole::Manager),
                password: Some("changed".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(promoted.version, 2);
    assert_eq!(promoted.role, UserRole::Manager);
    assert_eq!(promoted.full_name, "Dave Brown");

    let stale = manager
        .update_user(
            "manager_b",
            user.id,
            1,
            UpdateUser {
                full_name: Some("David Brown".to_string()),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(
        stale,
        Err(AuthError::Database(DatabaseError::VersionConflict {
            expected: 1,
            current: 2,
            ..
        }))
    ));

    let current = manager.find_user(user.id).await.unwrap().unwrap();
    assert_eq!(current.full_name, "Dave Brown");
    assert_eq!(current.version, 2);

    assert!(matches!(
        manager.authenticate(&username, "right").await,
        Err(AuthError::InvalidCredentials)
    ));
    manager.authenticate(&username, "changed").await.unwrap();

    let record_id = user.id.to_string();
    assert_eq!(audit_count(&pool, "users", &record_id, "UPDATE").await, 1);

    let mut conn = pool.acquire().await.unwrap();
    let row = sqlx::query(
        "SELECT old_values, new_values FROM audit_log \
         WHERE table_name = 'users' AND record_id = $1 AND action = 'UPDATE'",
    )
    .bind(&record_id)
    .fetch_one(&mut *conn)
    .await
    .unwrap();
    let old_values: serde_json::Value = row.get("old_values");
    let new_values: serde_json::Value = row.get("new_values");
    assert_eq!(old_values["role"], "Technician");
    assert_eq!(new_values["role"], "Manager");
    assert_eq!(new_values["version"], 2);
    assert!(new_values.get("password_hash").is_none());
    pool.release(conn);

    let missing = manager
        .update_user(
            "admin",
            i64::MAX,
            1,
            UpdateUser {
                notes: Some("ghost".to_string()),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(
        missing,
        Err(AuthError::Database(DatabaseError::RecordNotFound { .. }))
    ));

    pool.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_session_lifecycle() {
    let Some((manager, pool)) = test_manager().await else {
        return;
    };
    let username = unique_username("erin");

    manager
        .create_user(
            "admin",
            NewUser::new(&username, "Erin White", UserRole::Manager, "right"),
        )
        .await
        .unwrap();

    assert!(matches!(
        manager.login(&username, "wrong").await,
        Err(AuthError::InvalidCredentials)
    ));

    let (user, session) = manager.login(&username, "right").await.unwrap();
    assert_eq!(session.user_id, user.id);
    assert!(session.is_active);
    assert!(session.logout_time.is_none());
    assert!(manager.sessions().is_session_valid(session.id).await.unwrap());

    let active = manager.list_active_sessions().await.unwrap();
    let listed = active
        .iter()
        .find(|s| s.id == session.id)
        .expect("session listed as active");
    assert_eq!(listed.full_name, "Erin White");
    assert_eq!(listed.role, UserRole::Manager);
    assert!(
        active
            .windows(2)
            .all(|pair| pair[0].login_time >= pair[1].login_time)
    );

    manager.update_session_activity(session.id).await.unwrap();

    let closed = manager.logout(session.id).await.unwrap();
    assert!(!closed.is_active);
    assert!(closed.logout_time.is_some());
    assert!(closed.last_activity >= session.last_activity);
    assert!(!manager.sessions().is_session_valid(session.id).await.unwrap());

    assert!(matches!(
        manager.update_session_activity(session.id).await,
        Err(AuthError::SessionNotFound)
    ));
    assert!(matches!(
        manager.logout(session.id).await,
        Err(AuthError::SessionNotFound)
    ));

    let record_id = session.id.to_string();
    assert_eq!(audit_count(&pool, "user_sessions", &record_id, "LOGIN").await, 1);
    assert_eq!(audit_count(&pool, "user_sessions", &record_id, "LOGOUT").await, 1);

    let unlisted = manager.list_active_sessions().await.unwrap();
    assert!(unlisted.iter().all(|s| s.id != session.id));

    pool.shutdown().await;
}

#[tokio::test]
async fn test_plain_sessions_are_not_audited() {
    let Some((manager, pool)) = test_manager().await else {
        return;
    };
    let username = unique_username("finn");

    let user = manager
        .create_user(
            "admin",
            NewUser::new(&username, "Finn Gray", UserRole::Technician, "right"),
        )
        .await
        .unwrap();

    let session = manager.create_session(&user).await.unwrap();
    let ended = manager.end_session(session.id).await.unwrap();
    assert!(!ended.is_active);
    assert!(matches!(
        manager.end_session(session.id).await,
        Err(AuthError::SessionNotFound)
    ));

    let record_id = session.id.to_string();
    assert_eq!(audit_count(&pool, "user_sessions", &record_id, "LOGIN").await, 0);

    let listed = manager.list_users().await.unwrap();
    assert!(listed.iter().any(|u| u.id == user.id));

    pool.shutdown().await;
}
