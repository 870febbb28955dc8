//! Account and comment storage behind traits, with in-memory and Postgres backends.

pub mod accounts;
pub mod comments;
pub mod error;
pub mod postgres;

pub use accounts::{AccountStore, InMemoryAccountStore};
pub use comments::{CommentStore, InMemoryCommentStore};
pub use error::StoreError;
pub use postgres::{PostgresAccountStore, PostgresCommentStore, migrate};
