//! Cards, their embedded comments, and refreshing comment authors after a
//! profile change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use taskboard_core::{BoardId, CardId, DomainError, DomainResult, Entity, UserId, UserSnapshot};

/// A comment embedded in a card.
///
/// Author fields are a denormalized copy of the commenter's profile, taken when
/// the comment was written and refreshed later by propagation jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardComment {
    pub user_id: UserId,
    pub user_email: String,
    pub user_display_name: String,
    pub user_avatar: Option<String>,
    pub content: String,
    pub commented_at: DateTime<Utc>,
}

/// Card document. Comments are kept newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub id: CardId,
    pub board_id: BoardId,
    pub title: String,
    pub comments: Vec<CardComment>,
}

impl Entity for Card {
    type Id = CardId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// Where a comment lives: card plus position in the card's comment list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentRef {
    pub card_id: CardId,
    pub position: usize,
}

/// Outcome of refreshing one card.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorRefresh {
    /// Comments authored by the user.
    pub matched: usize,
    /// Positions whose author fields actually changed.
    pub changed: Vec<usize>,
}

/// Outcome of refreshing every card for one user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentUpdateSummary {
    pub matched_count: usize,
    pub updated_comments: Vec<CommentRef>,
}

impl CommentUpdateSummary {
    /// Fold one card's refresh into the running summary.
    pub fn record(&mut self, card_id: CardId, refresh: AuthorRefresh) {
        self.matched_count += refresh.matched;
        self.updated_comments.extend(
            refresh
                .changed
                .into_iter()
                .map(|position| CommentRef { card_id, position }),
        );
    }
}

impl Card {
    pub fn new(id: CardId, board_id: BoardId, title: impl Into<String>) -> DomainResult<Self> {
        let title = title.into();
        if title.trim().is_empty() {
            return Err(DomainError::validation("card title cannot be empty"));
        }
        Ok(Self {
            id,
            board_id,
            title: title.trim().to_string(),
            comments: Vec::new(),
        })
    }

    /// Add a comment on top, copying the author's current profile.
    pub fn add_comment(
        &mut self,
        author: &UserSnapshot,
        content: impl Into<String>,
        at: DateTime<Utc>,
    ) -> DomainResult<()> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(DomainError::validation("comment cannot be empty"));
        }
        self.comments.insert(
            0,
            CardComment {
                user_id: author.user_id,
                user_email: author.email.clone(),
                user_display_name: author.display_name.clone(),
                user_avatar: author.avatar.clone(),
                content,
                commented_at: at,
            },
        );
        Ok(())
    }

    pub fn has_comments_by(&self, user_id: UserId) -> bool {
        self.comments.iter().any(|c| c.user_id == user_id)
    }

    /// Overwrite author display name and avatar on this user's comments.
    ///
    /// Idempotent: a second call with the same snapshot matches the same
    /// comments and changes none of them.
    pub fn refresh_author(&mut self, snapshot: &UserSnapshot) -> AuthorRefresh {
        let mut refresh = AuthorRefresh::default();

        for (position, comment) in self.comments.iter_mut().enumerate() {
            if comment.user_id != snapshot.user_id {
                continue;
            }
            refresh.matched += 1;

            if comment.user_display_name != snapshot.display_name
                || comment.user_avatar != snapshot.avatar
            {
                comment.user_display_name = snapshot.display_name.clone();
                comment.user_avatar = snapshot.avatar.clone();
                refresh.changed.push(position);
            }
        }

        refresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(user_id: UserId, name: &str, avatar: Option<&str>) -> UserSnapshot {
        UserSnapshot {
            user_id,
            email: format!("{}@example.com", name.to_lowercase()),
            username: name.to_lowercase(),
            display_name: name.to_string(),
            avatar: avatar.map(str::to_string),
        }
    }

    fn card() -> Card {
        Card::new(CardId::new(), BoardId::new(), "Ship it").unwrap()
    }

    #[test]
    fn comments_are_kept_newest_first() {
        let alice = snapshot(UserId::new(), "Alice", None);
        let mut card = card();
        card.add_comment(&alice, "first", Utc::now()).unwrap();
        card.add_comment(&alice, "second", Utc::now()).unwrap();

        assert_eq!(card.comments[0].content, "second");
        assert_eq!(card.comments[1].content, "first");
    }

    #[test]
    fn refresh_touches_only_the_author() {
        let alice_id = UserId::new();
        let alice = snapshot(alice_id, "Alice", None);
        let bob = snapshot(UserId::new(), "Bob", Some("https://cdn/bob.png"));

        let mut card = card();
        card.add_comment(&alice, "hi", Utc::now()).unwrap();
        card.add_comment(&bob, "hello", Utc::now()).unwrap();

        let refresh = card.refresh_author(&snapshot(alice_id, "Alicia", Some("https://cdn/a.png")));

        assert_eq!(refresh.matched, 1);
        assert_eq!(refresh.changed, vec![1]);
        assert_eq!(card.comments[1].user_display_name, "Alicia");
        assert_eq!(card.comments[1].user_avatar.as_deref(), Some("https://cdn/a.png"));
        assert_eq!(card.comments[0].user_display_name, "Bob");
    }

    #[test]
    fn refresh_is_a_no_op_without_matches() {
        let mut card = card();
        card.add_comment(&snapshot(UserId::new(), "Bob", None), "hello", Utc::now())
            .unwrap();
        let before = card.clone();

        let refresh = card.refresh_author(&snapshot(UserId::new(), "Alice", None));

        assert_eq!(refresh, AuthorRefresh::default());
        assert_eq!(card, before);
    }

    #[test]
    fn second_refresh_changes_nothing() {
        let alice_id = UserId::new();
        let mut card = card();
        card.add_comment(&snapshot(alice_id, "Alice", None), "hi", Utc::now())
            .unwrap();

        let renamed = snapshot(alice_id, "Alicia", None);
        assert_eq!(card.refresh_author(&renamed).changed.len(), 1);

        let again = card.refresh_author(&renamed);
        assert_eq!(again.matched, 1);
        assert!(again.changed.is_empty());
    }

    #[test]
    fn empty_comment_is_rejected() {
        let mut card = card();
        let result = card.add_comment(&snapshot(UserId::new(), "Alice", None), "  ", Utc::now());
        assert!(matches!(result, Err(DomainError::Validation(_))));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        fn authors() -> Vec<UserId> {
            (0..3).map(|_| UserId::new()).collect()
        }

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 256,
                ..ProptestConfig::default()
            })]

            /// Property: refreshing twice with the same snapshot leaves the card
            /// exactly as refreshing once, and never touches other authors.
            #[test]
            fn refresh_is_idempotent(
                picks in prop::collection::vec(0usize..3, 0..20),
                new_name in "[A-Za-z][A-Za-z ]{0,15}",
                with_avatar in any::<bool>(),
            ) {
                let ids = authors();
                let mut card = card();
                for (i, pick) in picks.iter().enumerate() {
                    let author = snapshot(ids[*pick], &format!("User{pick}"), None);
                    card.add_comment(&author, format!("comment {i}"), Utc::now()).unwrap();
                }

                let avatar = with_avatar.then_some("https://cdn/new.png");
                let target = snapshot(ids[0], &new_name, avatar);

                let mut once = card.clone();
                once.refresh_author(&target);

                let mut twice = once.clone();
                let second = twice.refresh_author(&target);

                prop_assert_eq!(&once, &twice);
                prop_assert!(second.changed.is_empty());

                for (before, after) in card.comments.iter().zip(once.comments.iter()) {
                    if before.user_id == ids[0] {
                        prop_assert_eq!(&after.user_display_name, &new_name);
                        prop_assert_eq!(after.user_avatar.as_deref(), avatar);
                    } else {
                        prop_assert_eq!(before, after);
                    }
                }
            }
        }
    }
}
