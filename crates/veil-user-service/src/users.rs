//! In-memory user store with argon2 password hashing.
//!
//! Persistence beyond the process lifetime is out of scope; the store is
//! a concurrency-safe map keyed by username.

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;
use veil_identity::{Error, Result};

/// A registered user.
#[derive(Debug, Clone)]
pub struct User {
    /// Stable user id.
    pub id: Uuid,
    /// Unique username.
    pub username: String,
    /// Contact address, unvalidated.
    pub email: String,
    password_hash: String,
}

/// Concurrency-safe user registry.
#[derive(Debug, Default)]
pub struct UserStore {
    users: Mutex<HashMap<String, User>>,
}

impl UserStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new user, hashing the password with argon2.
    pub fn register(&self, username: &str, email: &str, password: &str) -> Result<User> {
        if username.is_empty() || password.is_empty() {
            return Err(Error::Config(
                "username and password are required".to_string(),
            ));
        }

        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| Error::Internal(format!("password hashing failed: {e}")))?
            .to_string();

        let user = User {
            id: Uuid::new_v4(),
            username: username.to_string(),
            email: email.to_string(),
            password_hash,
        };

        let mut users = self
            .users
            .lock()
            .map_err(|_| Error::Internal("user store lock poisoned".to_string()))?;
        if users.contains_key(username) {
            return Err(Error::Config(format!("username already taken: {username}")));
        }
        users.insert(username.to_string(), user.clone());

        info!(username = %username, user_id = %user.id, "user registered");
        Ok(user)
    }

    /// Checks a username/password pair, returning the user on success.
    pub fn authenticate(&self, username: &str, password: &str) -> Option<User> {
        let users = self.users.lock().ok()?;
        let user = users.get(username)?;

        let parsed = PasswordHash::new(&user.password_hash).ok()?;
        if Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
        {
            info!(username = %username, "user authenticated");
            Some(user.clone())
        } else {
            warn!(username = %username, "authentication failed");
            None
        }
    }

    /// Looks a user up by id.
    pub fn get(&self, id: Uuid) -> Option<User> {
        let users = self.users.lock().ok()?;
        users.values().find(|u| u.id == id).cloned()
    }
}
