//! Denormalized user data carried into other documents.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::UserId;
use crate::value_object::ValueObject;

/// Point-in-time copy of the user fields that other documents duplicate.
///
/// Captured right after a profile update and never changed afterwards: every
/// retry of a propagation job re-applies exactly this value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSnapshot {
    pub user_id: UserId,
    pub email: String,
    pub username: String,
    pub display_name: String,
    #[serde(default)]
    pub avatar: Option<String>,
}

impl ValueObject for UserSnapshot {}

impl UserSnapshot {
    /// Reject snapshots that would blank out comment authorship.
    pub fn validate(&self) -> DomainResult<()> {
        if self.display_name.trim().is_empty() {
            return Err(DomainError::validation("snapshot display name cannot be empty"));
        }
        if let Some(avatar) = &self.avatar {
            if avatar.trim().is_empty() {
                return Err(DomainError::validation("snapshot avatar cannot be blank"));
            }
        }
        Ok(())
    }
}
