//! Card storage and the bulk comment-author refresh.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use taskboard_boards::{Card, CommentUpdateSummary};
use taskboard_core::{CardId, UserSnapshot};

use super::error::StoreError;

/// Cards with embedded comments.
#[async_trait]
pub trait CommentStore: Send + Sync {
    async fn insert_card(&self, card: Card) -> Result<(), StoreError>;

    async fn get_card(&self, card_id: CardId) -> Result<Option<Card>, StoreError>;

    async fn remove_card(&self, card_id: CardId) -> Result<(), StoreError>;

    /// Overwrite display name and avatar on every comment authored by the
    /// snapshot's user, across all cards. Idempotent; zero matches is fine.
    async fn update_many_comments(
        &self,
        snapshot: &UserSnapshot,
    ) -> Result<CommentUpdateSummary, StoreError>;
}

/// In-memory comment store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryCommentStore {
    cards: RwLock<HashMap<CardId, Card>>,
}

impl InMemoryCommentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> StoreError {
        StoreError::unavailable("card map lock poisoned")
    }
}

#[async_trait]
impl CommentStore for InMemoryCommentStore {
    async fn insert_card(&self, card: Card) -> Result<(), StoreError> {
        let mut cards = self.cards.write().map_err(|_| Self::poisoned())?;
        if cards.contains_key(&card.id) {
            return Err(StoreError::conflict(format!("card {} exists", card.id)));
        }
        cards.insert(card.id, card);
        Ok(())
    }

    async fn get_card(&self, card_id: CardId) -> Result<Option<Card>, StoreError> {
        let cards = self.cards.read().map_err(|_| Self::poisoned())?;
        Ok(cards.get(&card_id).cloned())
    }

    async fn remove_card(&self, card_id: CardId) -> Result<(), StoreError> {
        let mut cards = self.cards.write().map_err(|_| Self::poisoned())?;
        cards
            .remove(&card_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(format!("card {card_id}")))
    }

    async fn update_many_comments(
        &self,
        snapshot: &UserSnapshot,
    ) -> Result<CommentUpdateSummary, StoreError> {
        let mut cards = self.cards.write().map_err(|_| Self::poisoned())?;
        let mut summary = CommentUpdateSummary::default();

        for card in cards.values_mut().filter(|c| c.has_comments_by(snapshot.user_id)) {
            let refresh = card.refresh_author(snapshot);
            summary.record(card.id, refresh);
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use taskboard_core::{BoardId, UserId};

    fn snapshot(user_id: UserId, name: &str) -> UserSnapshot {
        UserSnapshot {
            user_id,
            email: format!("{}@example.com", name.to_lowercase()),
            username: name.to_lowercase(),
            display_name: name.to_string(),
            avatar: None,
        }
    }

    #[tokio::test]
    async fn update_many_spans_cards() {
        let store = InMemoryCommentStore::new();
        let alice = snapshot(UserId::new(), "Alice");
        let board = BoardId::new();

        let mut ids = Vec::new();
        for title in ["one", "two"] {
            let mut card = Card::new(CardId::new(), board, title).unwrap();
            card.add_comment(&alice, "hi", Utc::now()).unwrap();
            ids.push(card.id);
            store.insert_card(card).await.unwrap();
        }

        let renamed = UserSnapshot {
            display_name: "Alicia".to_string(),
            ..alice
        };
        let summary = store.update_many_comments(&renamed).await.unwrap();

        assert_eq!(summary.matched_count, 2);
        assert_eq!(summary.updated_comments.len(), 2);
        for id in ids {
            let card = store.get_card(id).await.unwrap().unwrap();
            assert_eq!(card.comments[0].user_display_name, "Alicia");
        }
    }

    #[tokio::test]
    async fn removed_card_is_gone() {
        let store = InMemoryCommentStore::new();
        let card = Card::new(CardId::new(), BoardId::new(), "t").unwrap();
        let id = card.id;
        store.insert_card(card).await.unwrap();

        store.remove_card(id).await.unwrap();
        assert!(store.get_card(id).await.unwrap().is_none());
        assert!(matches!(store.remove_card(id).await, Err(StoreError::NotFound(_))));
    }
}
