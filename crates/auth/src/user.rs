//! User account record and its state transitions.
//!
//! Transitions are pure: they inspect a `UserRecord` and return the `UserPatch`
//! to persist (or a `DomainError`). Persisting the patch is the store's job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use taskboard_core::{DomainError, DomainResult, Entity, UserId, UserSnapshot};

use crate::Role;

// ─────────────────────────────────────────────────────────────────────────────
// Record
// ─────────────────────────────────────────────────────────────────────────────

/// Authoritative user account document.
///
/// # Invariants
/// - `email` and `username` are unique across accounts (enforced by the store).
/// - `verify_token` is `Some` exactly while the account awaits verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub email: String,
    pub username: String,
    pub display_name: String,
    pub avatar: Option<String>,
    pub password_hash: String,
    pub role: Role,
    pub is_active: bool,
    pub verify_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity for UserRecord {
    type Id = UserId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl UserRecord {
    /// Copy of the fields that comments duplicate.
    pub fn snapshot(&self) -> UserSnapshot {
        UserSnapshot {
            user_id: self.id,
            email: self.email.clone(),
            username: self.username.clone(),
            display_name: self.display_name.clone(),
            avatar: self.avatar.clone(),
        }
    }

    pub fn to_public(&self) -> PublicUser {
        PublicUser {
            id: self.id,
            email: self.email.clone(),
            username: self.username.clone(),
            display_name: self.display_name.clone(),
            avatar: self.avatar.clone(),
            is_active: self.is_active,
            role: self.role,
        }
    }

    /// Decide the verification transition for a presented token.
    pub fn verification_patch(&self, token: &str) -> DomainResult<UserPatch> {
        if self.is_active {
            return Err(DomainError::conflict("account is already active"));
        }
        match self.verify_token.as_deref() {
            Some(expected) if expected == token => Ok(UserPatch::new().activate()),
            _ => Err(DomainError::unauthorized("invalid verification token")),
        }
    }

    /// Inactive accounts cannot obtain tokens.
    pub fn ensure_can_sign_in(&self) -> DomainResult<()> {
        if !self.is_active {
            return Err(DomainError::unauthorized("account is not active"));
        }
        Ok(())
    }

    /// Apply a patch in place (used by in-memory stores and tests).
    pub fn apply(&mut self, patch: &UserPatch, now: DateTime<Utc>) {
        if let Some(display_name) = &patch.display_name {
            self.display_name = display_name.clone();
        }
        if let Some(avatar) = &patch.avatar {
            self.avatar = Some(avatar.clone());
        }
        if let Some(password_hash) = &patch.password_hash {
            self.password_hash = password_hash.clone();
        }
        if let Some(is_active) = patch.is_active {
            self.is_active = is_active;
        }
        if let Some(verify_token) = &patch.verify_token {
            self.verify_token = verify_token.clone();
        }
        self.updated_at = now;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Creation
// ─────────────────────────────────────────────────────────────────────────────

/// A user about to be inserted. The store assigns id and timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUser {
    pub email: String,
    pub username: String,
    pub display_name: String,
    pub password_hash: String,
    pub role: Role,
    pub verify_token: String,
}

impl NewUser {
    /// Build a self-registered, not-yet-verified client account.
    ///
    /// Username and initial display name are the local part of the email.
    pub fn register(email: &str, password_hash: String, verify_token: String) -> DomainResult<Self> {
        let email = normalize_email(email)?;
        let username = email
            .split('@')
            .next()
            .unwrap_or_default()
            .to_string();

        Ok(Self {
            email,
            display_name: username.clone(),
            username,
            password_hash,
            role: Role::Client,
            verify_token,
        })
    }

    pub fn into_record(self, id: UserId, now: DateTime<Utc>) -> UserRecord {
        UserRecord {
            id,
            email: self.email,
            username: self.username,
            display_name: self.display_name,
            avatar: None,
            password_hash: self.password_hash,
            role: self.role,
            is_active: false,
            verify_token: Some(self.verify_token),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Trim, lowercase, and sanity-check an email address.
pub fn normalize_email(email: &str) -> DomainResult<String> {
    let email = email.trim().to_lowercase();
    let Some((local, domain)) = email.split_once('@') else {
        return Err(DomainError::validation("invalid email format"));
    };
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return Err(DomainError::validation("invalid email format"));
    }
    Ok(email)
}

// ─────────────────────────────────────────────────────────────────────────────
// Updates & lookups
// ─────────────────────────────────────────────────────────────────────────────

/// Partial update of a user record. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPatch {
    pub display_name: Option<String>,
    pub avatar: Option<String>,
    pub password_hash: Option<String>,
    pub is_active: Option<bool>,
    /// `Some(None)` clears the token.
    pub verify_token: Option<Option<String>>,
}

impl UserPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn avatar(mut self, url: impl Into<String>) -> Self {
        self.avatar = Some(url.into());
        self
    }

    pub fn password_hash(mut self, hash: impl Into<String>) -> Self {
        self.password_hash = Some(hash.into());
        self
    }

    pub fn activate(mut self) -> Self {
        self.is_active = Some(true);
        self.verify_token = Some(None);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Unique field used to look a user up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserLookup {
    Id(UserId),
    Email(String),
    Username(String),
}

impl UserLookup {
    pub fn matches(&self, user: &UserRecord) -> bool {
        match self {
            UserLookup::Id(id) => user.id == *id,
            UserLookup::Email(email) => user.email.eq_ignore_ascii_case(email),
            UserLookup::Username(username) => user.username == *username,
        }
    }
}

/// Caller-facing view of a user (no credentials).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicUser {
    pub id: UserId,
    pub email: String,
    pub username: String,
    pub display_name: String,
    pub avatar: Option<String>,
    pub is_active: bool,
    pub role: Role,
}
