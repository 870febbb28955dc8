//! User account storage.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use taskboard_auth::{NewUser, UserLookup, UserPatch, UserRecord};
use taskboard_core::UserId;

use super::error::StoreError;

/// Point lookups and partial updates of user records.
///
/// Email is unique; `insert` fails with `Conflict` when it is taken.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn find_one_by(&self, lookup: &UserLookup) -> Result<Option<UserRecord>, StoreError>;

    async fn insert(&self, user: NewUser) -> Result<UserRecord, StoreError>;

    /// Apply a patch and return the updated record.
    async fn update(&self, user_id: UserId, patch: &UserPatch) -> Result<UserRecord, StoreError>;
}

/// In-memory account store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryAccountStore {
    users: RwLock<HashMap<UserId, UserRecord>>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> StoreError {
        StoreError::unavailable("account map lock poisoned")
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn find_one_by(&self, lookup: &UserLookup) -> Result<Option<UserRecord>, StoreError> {
        let users = self.users.read().map_err(|_| Self::poisoned())?;
        if let UserLookup::Id(id) = lookup {
            return Ok(users.get(id).cloned());
        }
        Ok(users.values().find(|u| lookup.matches(u)).cloned())
    }

    async fn insert(&self, user: NewUser) -> Result<UserRecord, StoreError> {
        let mut users = self.users.write().map_err(|_| Self::poisoned())?;
        if users.values().any(|u| u.email.eq_ignore_ascii_case(&user.email)) {
            return Err(StoreError::conflict(format!("email {} is taken", user.email)));
        }

        let record = user.into_record(UserId::new(), Utc::now());
        users.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update(&self, user_id: UserId, patch: &UserPatch) -> Result<UserRecord, StoreError> {
        let mut users = self.users.write().map_err(|_| Self::poisoned())?;
        let user = users
            .get_mut(&user_id)
            .ok_or_else(|| StoreError::not_found(format!("user {user_id}")))?;
        user.apply(patch, Utc::now());
        Ok(user.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_user(email: &str) -> NewUser {
        NewUser::register(email, "hash".to_string(), "token".to_string()).unwrap()
    }

    #[tokio::test]
    async fn insert_then_find_by_each_field() {
        let store = InMemoryAccountStore::new();
        let user = store.insert(new_user("alice@example.com")).await.unwrap();

        for lookup in [
            UserLookup::Id(user.id),
            UserLookup::Email("ALICE@example.com".to_string()),
            UserLookup::Username("alice".to_string()),
        ] {
            let found = store.find_one_by(&lookup).await.unwrap();
            assert_eq!(found.map(|u| u.id), Some(user.id), "{lookup:?}");
        }
        assert!(store
            .find_one_by(&UserLookup::Username("bob".to_string()))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn duplicate_email_conflicts() {
        let store = InMemoryAccountStore::new();
        store.insert(new_user("alice@example.com")).await.unwrap();

        let result = store.insert(new_user("alice@example.com")).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn update_applies_patch() {
        let store = InMemoryAccountStore::new();
        let user = store.insert(new_user("alice@example.com")).await.unwrap();

        let updated = store
            .update(user.id, &UserPatch::new().display_name("Alicia").activate())
            .await
            .unwrap();

        assert_eq!(updated.display_name, "Alicia");
        assert!(updated.is_active);
        assert_eq!(updated.verify_token, None);
    }

    #[tokio::test]
    async fn update_unknown_user_is_not_found() {
        let store = InMemoryAccountStore::new();
        let result = store.update(UserId::new(), &UserPatch::new().display_name("x")).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }
}
