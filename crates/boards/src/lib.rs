//! Board cards and the comments embedded in them.

pub mod card;

pub use card::{AuthorRefresh, Card, CardComment, CommentRef, CommentUpdateSummary};
