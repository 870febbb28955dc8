//! `taskboard-core`: shared kernel for the account and board domains.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod entity;
pub mod error;
pub mod id;
pub mod snapshot;
pub mod value_object;

pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{BoardId, CardId, UserId};
pub use snapshot::UserSnapshot;
pub use value_object::ValueObject;
