//! Input validation utilities

use regex::Regex;
use std::sync::OnceLock;

use crate::models::{NewUser, UpdateUser};

/// Shortest password accepted for an account
pub const MIN_PASSWORD_LENGTH: usize = 4;

/// Validate username
pub fn validate_username(username: &str) -> Result<(), String> {
    if username.is_empty() {
        return Err("Username is required".to_string());
    }

    if username.len() < 3 {
        return Err("Username must be at least 3 characters long".to_string());
    }

    if username.len() > 32 {
        return Err("Username must be at most 32 characters long".to_string());
    }

    static USERNAME_REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = USERNAME_REGEX.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9_.-]+$").expect("Failed to compile username regex")
    });

    if !regex.is_match(username) {
        return Err(
            "Username can only contain letters, numbers, dots, dashes and underscores".to_string(),
        );
    }

    Ok(())
}

/// Validate full name
pub fn validate_full_name(full_name: &str) -> Result<(), String> {
    if full_name.trim().is_empty() {
        return Err("Full name is required".to_string());
    }

    if full_name.len() > 128 {
        return Err("Full name must be at most 128 characters long".to_string());
    }

    Ok(())
}

/// Validate email
pub fn validate_email(email: &str) -> Result<(), String> {
    if email.len() > 254 {
        return Err("Email must be at most 254 characters long".to_string());
    }

    static EMAIL_REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = EMAIL_REGEX.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$")
            .expect("Failed to compile email regex")
    });

    if !regex.is_match(email) {
        return Err("Invalid email format".to_string());
    }

    Ok(())
}

/// Validate password
pub fn validate_password(password: &str) -> Result<(), String> {
    if password.is_empty() {
        return Err("Password is required".to_string());
    }

    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(format!(
            "Password must be at least {} characters long",
            MIN_PASSWORD_LENGTH
        ));
    }

    if password.len() > 128 {
        return Err("Password must be at most 128 characters long".to_string());
    }

    Ok(())
}

/// Validate a new account before it is stored
pub fn validate_new_user(new_user: &NewUser) -> Result<(), String> {
    validate_username(&new_user.username)?;
    validate_full_name(&new_user.full_name)?;
    if let Some(email) = new_user.email.as_deref().filter(|e| !e.is_empty()) {
        validate_email(email)?;
    }
    validate_password(&new_user.password)
}

/// Validate the fields an update sets
pub fn validate_update(changes: &UpdateUser) -> Result<(), String> {
    if let Some(full_name) = &changes.full_name {
        validate_full_name(full_name)?;
    }
    if let Some(email) = changes.email.as_deref().filter(|e| !e.is_empty()) {
        validate_email(email)?;
    }
    if let Some(password) = &changes.password {
        validate_password(password)?;
    }
    Ok(())
}
