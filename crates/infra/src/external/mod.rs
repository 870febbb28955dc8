//! External service clients/adapters.

pub mod mailer;
pub mod uploads;

pub use mailer::{HttpMailer, HttpMailerConfig, InMemoryMailer, LoggingMailer, MailError, Mailer, SentMail};
pub use uploads::{AvatarUploader, InMemoryAvatarUploader, LocalAvatarUploader, UploadError};
