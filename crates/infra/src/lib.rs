//! Infrastructure layer: job queue, stores, external services, config, and the
//! account service that ties them together.

pub mod account_service;
pub mod config;
pub mod external;
pub mod jobs;
pub mod propagation;
pub mod stores;

pub use account_service::{AccountError, AccountService, AccountSettings, SignInResult};
pub use config::{AppConfig, ConfigError};
pub use propagation::{UPDATE_COMMENTS_QUEUE, register_comment_propagation};
