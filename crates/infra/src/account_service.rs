//! Account orchestration: registration, verification, sign-in, token refresh
//! and profile updates.
//!
//! Profile updates that change the display name or avatar enqueue one comment
//! propagation job and return without waiting for it.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use taskboard_auth::{
    NewUser, PasswordError, PasswordHasher, ProfileUpdate, PublicUser, Role, TokenError,
    TokenIssuer, TokenKind, UserLookup, UserPatch, UserRecord, validate_password,
};
use taskboard_core::{DomainError, UserId};

use crate::external::{AvatarUploader, MailError, Mailer, UploadError};
use crate::jobs::{JobId, JobOptions, JobQueue};
use crate::propagation::UPDATE_COMMENTS_QUEUE;
use crate::stores::{AccountStore, StoreError};

/// Upload folder for avatars.
pub const AVATAR_FOLDER: &str = "users";

const VERIFICATION_SUBJECT: &str = "Taskboard: please verify your email before using the app";

#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("service misconfigured: {0}")]
    Misconfigured(String),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Password(#[from] PasswordError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Mail(#[from] MailError),

    #[error(transparent)]
    Upload(#[from] UploadError),
}

impl From<DomainError> for AccountError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg)
            | DomainError::InvalidId(msg)
            | DomainError::InvariantViolation(msg) => AccountError::Validation(msg),
            DomainError::NotFound(msg) => AccountError::NotFound(msg),
            DomainError::Conflict(msg) => AccountError::Conflict(msg),
            DomainError::Unauthorized(msg) => AccountError::Unauthorized(msg),
        }
    }
}

impl From<StoreError> for AccountError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => AccountError::NotFound(msg),
            StoreError::Conflict(msg) => AccountError::Conflict(msg),
            other => AccountError::Store(other),
        }
    }
}

/// Tokens plus the signed-in user.
#[derive(Debug, Clone, Serialize)]
pub struct SignInResult {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(flatten)]
    pub user: PublicUser,
}

#[derive(Debug, Clone)]
pub struct AccountSettings {
    /// Base URL of the web client, used in verification links
    pub website_domain: String,
    /// Retry policy for comment propagation jobs
    pub propagation: JobOptions,
}

impl AccountSettings {
    pub fn new(website_domain: impl Into<String>) -> Self {
        Self {
            website_domain: website_domain.into(),
            propagation: JobOptions::default(),
        }
    }
}

pub struct AccountService {
    accounts: Arc<dyn AccountStore>,
    queue: JobQueue,
    hasher: Arc<dyn PasswordHasher>,
    tokens: Arc<dyn TokenIssuer>,
    mailer: Arc<dyn Mailer>,
    uploader: Arc<dyn AvatarUploader>,
    settings: AccountSettings,
}

impl AccountService {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        queue: JobQueue,
        hasher: Arc<dyn PasswordHasher>,
        tokens: Arc<dyn TokenIssuer>,
        mailer: Arc<dyn Mailer>,
        uploader: Arc<dyn AvatarUploader>,
        settings: AccountSettings,
    ) -> Self {
        Self {
            accounts,
            queue,
            hasher,
            tokens,
            mailer,
            uploader,
            settings,
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn tokens(&self) -> &Arc<dyn TokenIssuer> {
        &self.tokens
    }

    /// Create an inactive account and mail its verification link.
    #[instrument(skip(self, password), err)]
    pub async fn register(&self, email: &str, password: &str) -> Result<PublicUser, AccountError> {
        validate_password(password)?;
        let draft = NewUser::register(email, String::new(), String::new())?;

        if self
            .accounts
            .find_one_by(&UserLookup::Email(draft.email.clone()))
            .await?
            .is_some()
        {
            return Err(AccountError::Conflict("email already exists".to_string()));
        }

        let new_user = NewUser {
            password_hash: self.hasher.hash(password).await?,
            verify_token: uuid::Uuid::new_v4().to_string(),
            ..draft
        };
        let user = self.accounts.insert(new_user).await?;

        let token = user.verify_token.as_deref().unwrap_or_default();
        let link = self.verification_link(&user.email, token)?;
        let html = format!(
            "<h3>Here is your verification link:</h3>\n<h3>{link}</h3>\n<h3>Sincerely,<br/> - the Taskboard team</h3>"
        );
        self.mailer.send(&user.email, VERIFICATION_SUBJECT, &html).await?;

        info!(user_id = %user.id, "account registered");
        Ok(user.to_public())
    }

    /// Activate an account with the token from its verification link.
    #[instrument(skip(self, token), err)]
    pub async fn verify_account(&self, email: &str, token: &str) -> Result<PublicUser, AccountError> {
        let user = self.find(UserLookup::Email(email.trim().to_lowercase())).await?;
        let patch = user.verification_patch(token)?;

        let user = self.accounts.update(user.id, &patch).await?;
        info!(user_id = %user.id, "account verified");
        Ok(user.to_public())
    }

    #[instrument(skip(self, password), err)]
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<SignInResult, AccountError> {
        let user = self.find(UserLookup::Email(email.trim().to_lowercase())).await?;
        user.ensure_can_sign_in()?;

        if !self.hasher.verify(password, &user.password_hash).await? {
            return Err(AccountError::Unauthorized(
                "email or password is incorrect".to_string(),
            ));
        }

        let pair = self.tokens.issue_pair(user.id, &user.email, Utc::now())?;
        info!(user_id = %user.id, "signed in");
        Ok(SignInResult {
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            user: user.to_public(),
        })
    }

    /// Mint a new access token from a valid refresh token.
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<String, AccountError> {
        let now = Utc::now();
        let claims = self
            .tokens
            .verify(TokenKind::Refresh, refresh_token, now)
            .map_err(|e| AccountError::Unauthorized(format!("refresh token rejected: {e}")))?;

        Ok(self.tokens.issue(TokenKind::Access, claims.sub, &claims.email, now)?)
    }

    /// Create an active admin account unless the email is already registered.
    pub async fn ensure_admin(&self, email: &str, password: &str) -> Result<PublicUser, AccountError> {
        validate_password(password)?;
        let draft = NewUser::register(email, String::new(), String::new())?;

        if let Some(existing) = self
            .accounts
            .find_one_by(&UserLookup::Email(draft.email.clone()))
            .await?
        {
            if existing.role != Role::Admin {
                warn!(user_id = %existing.id, "bootstrap admin email belongs to a non-admin account");
            }
            return Ok(existing.to_public());
        }

        let new_user = NewUser {
            password_hash: self.hasher.hash(password).await?,
            verify_token: uuid::Uuid::new_v4().to_string(),
            role: Role::Admin,
            ..draft
        };
        let user = self.accounts.insert(new_user).await?;
        let user = self.accounts.update(user.id, &UserPatch::new().activate()).await?;

        info!(user_id = %user.id, "bootstrap admin created");
        Ok(user.to_public())
    }

    pub async fn profile(&self, user_id: UserId) -> Result<PublicUser, AccountError> {
        Ok(self.find(UserLookup::Id(user_id)).await?.to_public())
    }

    /// Apply one profile update; enqueue comment propagation when it qualifies.
    #[instrument(skip(self, update), fields(user_id = %user_id), err)]
    pub async fn update(
        &self,
        user_id: UserId,
        update: ProfileUpdate,
    ) -> Result<PublicUser, AccountError> {
        let user = self.find(UserLookup::Id(user_id)).await?;
        user.ensure_can_sign_in()?;

        let propagate = update.requires_propagation();
        let patch = match update {
            ProfileUpdate::Avatar(upload) => {
                let url = self
                    .uploader
                    .upload(&upload.bytes, AVATAR_FOLDER, &upload.filename)
                    .await?;
                UserPatch::new().avatar(url)
            }
            ProfileUpdate::ChangePassword {
                current_password,
                new_password,
            } => {
                if !self.hasher.verify(&current_password, &user.password_hash).await? {
                    return Err(AccountError::Unauthorized(
                        "current password is incorrect".to_string(),
                    ));
                }
                validate_password(&new_password)?;
                UserPatch::new().password_hash(self.hasher.hash(&new_password).await?)
            }
            ProfileUpdate::General { display_name } => match display_name {
                Some(name) if !name.is_empty() => UserPatch::new().display_name(name),
                _ => UserPatch::new(),
            },
        };

        if patch.is_empty() {
            return Ok(user.to_public());
        }

        let updated = self.accounts.update(user_id, &patch).await?;
        if propagate {
            self.enqueue_propagation(&updated).await;
        }
        Ok(updated.to_public())
    }

    /// Enqueue a comment refresh. Failures are logged, never returned.
    async fn enqueue_propagation(&self, user: &UserRecord) -> Option<JobId> {
        match self
            .queue
            .enqueue(UPDATE_COMMENTS_QUEUE, &user.snapshot(), self.settings.propagation)
            .await
        {
            Ok(job_id) => {
                info!(user_id = %user.id, job_id = %job_id, "comment propagation enqueued");
                Some(job_id)
            }
            Err(err) => {
                error!(user_id = %user.id, error = %err, "failed to enqueue comment propagation");
                None
            }
        }
    }

    async fn find(&self, lookup: UserLookup) -> Result<UserRecord, AccountError> {
        self.accounts.find_one_by(&lookup).await?.ok_or_else(|| {
            warn!(?lookup, "account lookup missed");
            AccountError::NotFound("account not found".to_string())
        })
    }

    fn verification_link(&self, email: &str, token: &str) -> Result<String, AccountError> {
        let base = format!(
            "{}/account/verification",
            self.settings.website_domain.trim_end_matches('/')
        );
        reqwest::Url::parse_with_params(&base, &[("email", email), ("token", token)])
            .map(String::from)
            .map_err(|e| AccountError::Misconfigured(format!("website domain: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{InMemoryAvatarUploader, InMemoryMailer};
    use crate::jobs::{InMemoryJobStore, JobStatus, QueueConfig};
    use crate::stores::InMemoryAccountStore;
    use taskboard_auth::{AvatarUpload, BcryptPasswordHasher, Hs256TokenIssuer, TokenSettings};
    use taskboard_core::UserSnapshot;

    const PASSWORD: &str = "correct horse";

    struct Harness {
        service: AccountService,
        accounts: Arc<InMemoryAccountStore>,
        mailer: Arc<InMemoryMailer>,
        queue: JobQueue,
    }

    fn harness() -> Harness {
        let accounts = Arc::new(InMemoryAccountStore::new());
        let mailer = Arc::new(InMemoryMailer::new());
        let queue = JobQueue::new(InMemoryJobStore::arc(), QueueConfig::default());
        let tokens = Hs256TokenIssuer::new(
            TokenSettings {
                secret: b"access".to_vec(),
                lifetime: chrono::Duration::hours(1),
            },
            TokenSettings {
                secret: b"refresh".to_vec(),
                lifetime: chrono::Duration::days(14),
            },
        );

        let service = AccountService::new(
            accounts.clone(),
            queue.clone(),
            Arc::new(BcryptPasswordHasher::new(4)),
            Arc::new(tokens),
            mailer.clone(),
            Arc::new(InMemoryAvatarUploader::default()),
            AccountSettings::new("https://board.example.com/"),
        );

        Harness {
            service,
            accounts,
            mailer,
            queue,
        }
    }

    impl Harness {
        async fn active_user(&self, email: &str) -> PublicUser {
            let user = self.service.register(email, PASSWORD).await.unwrap();
            let token = self
                .accounts
                .find_one_by(&UserLookup::Id(user.id))
                .await
                .unwrap()
                .unwrap()
                .verify_token
                .unwrap();
            self.service.verify_account(email, &token).await.unwrap()
        }

        async fn queued_snapshots(&self) -> Vec<UserSnapshot> {
            self.queue
                .list(UPDATE_COMMENTS_QUEUE, Some(JobStatus::Waiting), 100)
                .await
                .unwrap()
                .iter()
                .map(|job| job.payload_as().unwrap())
                .collect()
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Registration & verification
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn register_creates_inactive_user_and_mails_link() {
        let h = harness();
        let user = h.service.register("Alice@Example.com", PASSWORD).await.unwrap();

        assert_eq!(user.email, "alice@example.com");
        assert_eq!(user.username, "alice");
        assert_eq!(user.display_name, "alice");
        assert!(!user.is_active);

        let record = h.accounts.find_one_by(&UserLookup::Id(user.id)).await.unwrap().unwrap();
        assert_ne!(record.password_hash, PASSWORD);
        let token = record.verify_token.unwrap();

        let mail = h.mailer.last_to("alice@example.com").unwrap();
        assert!(mail.html.contains(
            "https://board.example.com/account/verification?email=alice%40example.com&token="
        ));
        assert!(mail.html.contains(&token));
    }

    #[tokio::test]
    async fn duplicate_email_is_a_conflict() {
        let h = harness();
        h.service.register("alice@example.com", PASSWORD).await.unwrap();

        let again = h.service.register("ALICE@example.com", PASSWORD).await;
        assert!(matches!(again, Err(AccountError::Conflict(_))));
    }

    #[tokio::test]
    async fn short_password_is_rejected() {
        let h = harness();
        let result = h.service.register("alice@example.com", "short").await;
        assert!(matches!(result, Err(AccountError::Validation(_))));
    }

    #[tokio::test]
    async fn verification_checks_token_and_state() {
        let h = harness();
        let user = h.service.register("alice@example.com", PASSWORD).await.unwrap();
        let token = h
            .accounts
            .find_one_by(&UserLookup::Id(user.id))
            .await
            .unwrap()
            .unwrap()
            .verify_token
            .unwrap();

        assert!(matches!(
            h.service.verify_account("alice@example.com", "wrong").await,
            Err(AccountError::Unauthorized(_))
        ));
        assert!(matches!(
            h.service.verify_account("bob@example.com", &token).await,
            Err(AccountError::NotFound(_))
        ));

        let verified = h.service.verify_account("alice@example.com", &token).await.unwrap();
        assert!(verified.is_active);

        assert!(matches!(
            h.service.verify_account("alice@example.com", &token).await,
            Err(AccountError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn bootstrap_admin_is_active_and_idempotent() {
        let h = harness();
        let admin = h.service.ensure_admin("root@example.com", PASSWORD).await.unwrap();
        assert_eq!(admin.role, Role::Admin);
        assert!(admin.is_active);

        let again = h.service.ensure_admin("root@example.com", PASSWORD).await.unwrap();
        assert_eq!(again.id, admin.id);
        assert!(h.service.sign_in("root@example.com", PASSWORD).await.is_ok());
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sign-in & tokens
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn sign_in_requires_active_account_and_right_password() {
        let h = harness();
        h.service.register("alice@example.com", PASSWORD).await.unwrap();
        assert!(matches!(
            h.service.sign_in("alice@example.com", PASSWORD).await,
            Err(AccountError::Unauthorized(_))
        ));

        let h = harness();
        h.active_user("alice@example.com").await;
        assert!(matches!(
            h.service.sign_in("alice@example.com", "battery staple").await,
            Err(AccountError::Unauthorized(_))
        ));
        assert!(matches!(
            h.service.sign_in("nobody@example.com", PASSWORD).await,
            Err(AccountError::NotFound(_))
        ));

        let signed_in = h.service.sign_in("alice@example.com", PASSWORD).await.unwrap();
        let claims = h
            .service
            .tokens()
            .verify(TokenKind::Access, &signed_in.access_token, Utc::now())
            .unwrap();
        assert_eq!(claims.sub, signed_in.user.id);
    }

    #[tokio::test]
    async fn refresh_mints_access_token_from_refresh_token_only() {
        let h = harness();
        h.active_user("alice@example.com").await;
        let signed_in = h.service.sign_in("alice@example.com", PASSWORD).await.unwrap();

        let access = h.service.refresh_token(&signed_in.refresh_token).await.unwrap();
        let claims = h.service.tokens().verify(TokenKind::Access, &access, Utc::now()).unwrap();
        assert_eq!(claims.email, "alice@example.com");

        assert!(matches!(
            h.service.refresh_token(&signed_in.access_token).await,
            Err(AccountError::Unauthorized(_))
        ));
    }

    // ─────────────────────────────────────────────────────────────────────
    // Profile updates & propagation decision
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn password_change_enqueues_nothing() {
        let h = harness();
        let user = h.active_user("alice@example.com").await;

        h.service
            .update(
                user.id,
                ProfileUpdate::ChangePassword {
                    current_password: PASSWORD.to_string(),
                    new_password: "a much better one".to_string(),
                },
            )
            .await
            .unwrap();

        assert!(h.queued_snapshots().await.is_empty());
        assert!(h.service.sign_in("alice@example.com", "a much better one").await.is_ok());
    }

    #[tokio::test]
    async fn wrong_current_password_is_rejected() {
        let h = harness();
        let user = h.active_user("alice@example.com").await;

        let result = h
            .service
            .update(
                user.id,
                ProfileUpdate::ChangePassword {
                    current_password: "not it at all".to_string(),
                    new_password: "a much better one".to_string(),
                },
            )
            .await;

        assert!(matches!(result, Err(AccountError::Unauthorized(_))));
        assert!(h.queued_snapshots().await.is_empty());
    }

    #[tokio::test]
    async fn display_name_change_enqueues_one_job_per_call() {
        let h = harness();
        let user = h.active_user("alice@example.com").await;

        let updated = h
            .service
            .update(
                user.id,
                ProfileUpdate::General {
                    display_name: Some("Alicia".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.display_name, "Alicia");

        let queued = h.queued_snapshots().await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].user_id, user.id);
        assert_eq!(queued[0].display_name, "Alicia");

        h.service
            .update(
                user.id,
                ProfileUpdate::General {
                    display_name: Some("Ally".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(h.queued_snapshots().await.len(), 2);
    }

    #[tokio::test]
    async fn avatar_upload_enqueues_one_job() {
        let h = harness();
        let user = h.active_user("alice@example.com").await;

        let updated = h
            .service
            .update(
                user.id,
                ProfileUpdate::Avatar(AvatarUpload {
                    filename: "me.png".to_string(),
                    content_type: Some("image/png".to_string()),
                    bytes: b"png".to_vec(),
                }),
            )
            .await
            .unwrap();

        let avatar = updated.avatar.unwrap();
        assert!(avatar.contains("/users/"));

        let queued = h.queued_snapshots().await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].avatar.as_deref(), Some(avatar.as_str()));
    }

    #[tokio::test]
    async fn empty_general_update_enqueues_nothing() {
        let h = harness();
        let user = h.active_user("alice@example.com").await;

        let unchanged = h
            .service
            .update(user.id, ProfileUpdate::General { display_name: None })
            .await
            .unwrap();

        assert_eq!(unchanged, user);
        assert!(h.queued_snapshots().await.is_empty());
    }

    #[tokio::test]
    async fn enqueue_failure_does_not_fail_the_update() {
        let h = harness();
        let user = h.active_user("alice@example.com").await;
        h.queue.close();

        let updated = h
            .service
            .update(
                user.id,
                ProfileUpdate::General {
                    display_name: Some("Alicia".to_string()),
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.display_name, "Alicia");
        assert!(h.queued_snapshots().await.is_empty());
    }
}
