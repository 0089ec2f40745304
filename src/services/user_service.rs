//! Local user accounts and the signed-in session.
//!
//! Passwords are stored as Argon2id PHC strings.
use std::sync::Arc;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::Utc;
use fuzzy_matcher::{skim::SkimMatcherV2, FuzzyMatcher};
use log::{debug, info, warn};

use crate::{
    generate_id,
    validation::{validate_email, validate_password, validate_username},
    KeyValueStore, MemoError, RecordCollection, Result, StorageErrorCode, User, UserProfile,
};

pub const USERS_KEY: &str = "users";
pub const CURRENT_USER_KEY: &str = "current_user";

/// Hash a password using Argon2id. Returns a PHC-format string.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| {
            MemoError::storage(
                StorageErrorCode::InvalidFormat,
                format!("Failed to hash password: {}", e),
            )
        })?;
    Ok(hash.to_string())
}

/// Verify a password against a PHC-format hash string.
pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed_hash = PasswordHash::new(hash).map_err(|e| {
        MemoError::storage(
            StorageErrorCode::CorruptedData,
            format!("Invalid password hash: {}", e),
        )
    })?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

pub struct UserService {
    kv: Arc<KeyValueStore>,
    users: RecordCollection<User>,
}

impl UserService {
    pub fn new(kv: Arc<KeyValueStore>) -> Self {
        UserService {
            users: RecordCollection::new(Arc::clone(&kv), USERS_KEY),
            kv,
        }
    }

    fn all(&self, operation: &'static str) -> Result<Vec<User>> {
        self.users
            .load_all()
            .map_err(|e| e.in_operation(operation, None))
    }

    /// Creates an active account. Usernames are unique ignoring case and
    /// emails are stored case-folded.
    pub fn register(&self, username: &str, email: &str, password: &str) -> Result<UserProfile> {
        let username = username.trim();
        let email = email.trim().to_lowercase();
        validate_username(username).map_err(MemoError::validation)?;
        validate_email(&email).map_err(MemoError::validation)?;
        validate_password(password).map_err(MemoError::validation)?;

        let existing = self.all("registerUser")?;
        if existing
            .iter()
            .any(|u| u.username.eq_ignore_ascii_case(username))
        {
            return Err(MemoError::validation("Username is already taken"));
        }
        if existing.iter().any(|u| u.email == email) {
            return Err(MemoError::validation("Email is already registered"));
        }

        let user = User {
            id: generate_id(),
            username: username.to_string(),
            email,
            password_hash: hash_password(password)?,
            created_at: Utc::now(),
            last_login_at: None,
            is_active: true,
        };
        self.users
            .upsert(&user)
            .map_err(|e| e.in_operation("registerUser", Some(&user.id)))?;

        info!("Registered user {}", user.username);
        Ok(UserProfile::from(&user))
    }

    /// Checks credentials, stamps the login time and makes the user current.
    pub fn authenticate(&self, username: &str, password: &str) -> Result<UserProfile> {
        let invalid = || MemoError::validation("Invalid username or password");

        let mut user = self
            .all("authenticate")?
            .into_iter()
            .find(|u| u.username.eq_ignore_ascii_case(username.trim()))
            .ok_or_else(invalid)?;

        if !verify_password(password, &user.password_hash)? {
            warn!("Failed login for {}", user.username);
            return Err(invalid());
        }
        if !user.is_active {
            return Err(MemoError::validation("This account has been deactivated"));
        }

        user.last_login_at = Some(Utc::now());
        self.users
            .upsert(&user)
            .map_err(|e| e.in_operation("authenticate", Some(&user.id)))?;
        self.set_current_user(&user.id)?;

        debug!("User {} signed in", user.username);
        Ok(UserProfile::from(&user))
    }

    pub fn get(&self, id: &str) -> Result<Option<UserProfile>> {
        Ok(self
            .users
            .find(id)
            .map_err(|e| e.in_operation("getUser", Some(id)))?
            .as_ref()
            .map(UserProfile::from))
    }

    pub fn find_by_username(&self, username: &str) -> Result<Option<UserProfile>> {
        Ok(self
            .all("findUser")?
            .iter()
            .find(|u| u.username.eq_ignore_ascii_case(username))
            .map(UserProfile::from))
    }

    pub fn list(&self) -> Result<Vec<UserProfile>> {
        Ok(self.all("listUsers")?.iter().map(UserProfile::from).collect())
    }

    /// Deactivated users cannot sign in. Signs them out if current.
    pub fn deactivate(&self, id: &str) -> Result<UserProfile> {
        let mut user = self
            .users
            .find(id)
            .map_err(|e| e.in_operation("deactivateUser", Some(id)))?
            .ok_or_else(|| MemoError::not_found("deactivateUser", id))?;

        user.is_active = false;
        self.users
            .upsert(&user)
            .map_err(|e| e.in_operation("deactivateUser", Some(id)))?;

        if self.current_user_id()?.as_deref() == Some(id) {
            self.logout()?;
        }
        info!("Deactivated user {}", user.username);
        Ok(UserProfile::from(&user))
    }

    fn current_user_id(&self) -> Result<Option<String>> {
        self.kv
            .get::<String>(CURRENT_USER_KEY)
            .map_err(|e| e.in_operation("currentUser", None))
    }

    pub fn current_user(&self) -> Result<Option<UserProfile>> {
        match self.current_user_id()? {
            Some(id) => self.get(&id),
            None => Ok(None),
        }
    }

    pub fn set_current_user(&self, id: &str) -> Result<()> {
        if self.get(id)?.is_none() {
            return Err(MemoError::not_found("setCurrentUser", id));
        }
        self.kv
            .set(CURRENT_USER_KEY, id)
            .map_err(|e| e.in_operation("setCurrentUser", Some(id)))
    }

    pub fn logout(&self) -> Result<()> {
        self.kv
            .remove(CURRENT_USER_KEY)
            .map_err(|e| e.in_operation("logout", None))
    }

    /// Active users whose name fuzzily matches `query`, best first. An empty
    /// query lists users alphabetically.
    pub fn search_for_mention(&self, query: &str, limit: usize) -> Result<Vec<UserProfile>> {
        let query = query.trim().trim_start_matches('@');
        let mut active: Vec<User> = self
            .all("searchUsers")?
            .into_iter()
            .filter(|u| u.is_active)
            .collect();

        if query.is_empty() {
            active.sort_by(|a, b| a.username.to_lowercase().cmp(&b.username.to_lowercase()));
            return Ok(active.iter().take(limit).map(UserProfile::from).collect());
        }

        let matcher = SkimMatcherV2::default();
        let mut scored: Vec<(i64, &User)> = active
            .iter()
            .filter_map(|u| matcher.fuzzy_match(&u.username, query).map(|score| (score, u)))
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(_, u)| UserProfile::from(u))
            .collect())
    }
}
