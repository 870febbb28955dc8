//! Service wiring: stores, job queue, collaborators, and the account service.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use taskboard_auth::{BcryptPasswordHasher, Hs256TokenIssuer, TokenIssuer, TokenSettings};
use taskboard_infra::config::{MailerConfig, TokenConfig};
use taskboard_infra::external::{
    AvatarUploader, HttpMailer, LocalAvatarUploader, LoggingMailer, Mailer,
};
use taskboard_infra::jobs::{InMemoryJobStore, JobQueue, JobStore};
use taskboard_infra::stores::{
    AccountStore, CommentStore, InMemoryAccountStore, InMemoryCommentStore, PostgresAccountStore,
    PostgresCommentStore, migrate,
};
use taskboard_infra::{AccountService, AccountSettings, AppConfig, register_comment_propagation};

#[cfg(feature = "redis")]
use taskboard_infra::jobs::RedisJobStore;
use sqlx::PgPool;

/// Shared state behind every route.
pub struct AppServices {
    pub accounts: AccountService,
    pub comments: Arc<dyn CommentStore>,
    pub queue: JobQueue,
    /// Directory served under `/uploads`
    pub upload_dir: PathBuf,
}

impl AppServices {
    pub fn builder(config: AppConfig) -> ServicesBuilder {
        ServicesBuilder {
            config,
            mailer: None,
            uploader: None,
        }
    }
}

/// Builds [`AppServices`] from configuration. Collaborators can be swapped
/// before `build`, which tests use to capture mail and uploads.
pub struct ServicesBuilder {
    config: AppConfig,
    mailer: Option<Arc<dyn Mailer>>,
    uploader: Option<Arc<dyn AvatarUploader>>,
}

struct Stores {
    accounts: Arc<dyn AccountStore>,
    comments: Arc<dyn CommentStore>,
    jobs: Arc<dyn JobStore>,
}

impl ServicesBuilder {
    pub fn mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = Some(mailer);
        self
    }

    pub fn uploader(mut self, uploader: Arc<dyn AvatarUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    /// Connect stores, register the propagation processor and create the
    /// bootstrap admin. The queue worker is not started.
    pub async fn build(self) -> anyhow::Result<AppServices> {
        let config = self.config;

        let stores = if config.use_persistent_stores {
            persistent_stores(&config).await?
        } else {
            in_memory_stores()
        };

        let queue = JobQueue::new(stores.jobs, config.queue.clone());
        register_comment_propagation(&queue, stores.comments.clone())
            .context("registering comment propagation")?;

        let tokens: Arc<dyn TokenIssuer> = Arc::new(Hs256TokenIssuer::new(
            token_settings(&config.access_token)?,
            token_settings(&config.refresh_token)?,
        ));

        let mailer: Arc<dyn Mailer> = match (self.mailer, &config.mailer) {
            (Some(mailer), _) => mailer,
            (None, MailerConfig::Log) => Arc::new(LoggingMailer),
            (None, MailerConfig::Http(http)) => Arc::new(HttpMailer::new(http.clone())),
        };
        let uploader: Arc<dyn AvatarUploader> = match self.uploader {
            Some(uploader) => uploader,
            None => Arc::new(LocalAvatarUploader::new(
                config.upload_dir.clone(),
                config.upload_base_url.clone(),
            )),
        };

        let accounts = AccountService::new(
            stores.accounts,
            queue.clone(),
            Arc::new(BcryptPasswordHasher::new(config.bcrypt_cost)),
            tokens,
            mailer,
            uploader,
            AccountSettings::new(config.website_domain.clone()),
        );

        if let Some(admin) = &config.admin {
            accounts
                .ensure_admin(&admin.email, &admin.password)
                .await
                .context("creating bootstrap admin")?;
        }

        Ok(AppServices {
            accounts,
            comments: stores.comments,
            queue,
            upload_dir: config.upload_dir,
        })
    }
}

fn token_settings(config: &TokenConfig) -> anyhow::Result<TokenSettings> {
    Ok(TokenSettings {
        secret: config.secret.clone().into_bytes(),
        lifetime: chrono::Duration::from_std(config.lifetime).context("token lifetime out of range")?,
    })
}

fn in_memory_stores() -> Stores {
    tracing::info!("using in-memory stores");
    let jobs: Arc<dyn JobStore> = InMemoryJobStore::arc();
    Stores {
        accounts: Arc::new(InMemoryAccountStore::new()),
        comments: Arc::new(InMemoryCommentStore::new()),
        jobs,
    }
}

async fn persistent_stores(config: &AppConfig) -> anyhow::Result<Stores> {
    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is required for persistent stores")?;

    let pool = PgPool::connect(database_url)
        .await
        .context("failed to connect to Postgres")?;
    migrate(&pool).await.context("failed to apply schema")?;

    #[cfg(feature = "redis")]
    let jobs: Arc<dyn JobStore> = Arc::new(
        RedisJobStore::connect(&config.redis_url)
            .await
            .context("failed to connect to Redis")?,
    );

    #[cfg(not(feature = "redis"))]
    let jobs: Arc<dyn JobStore> = {
        tracing::warn!(
            "USE_PERSISTENT_STORES=true but redis feature not enabled, jobs stay in memory"
        );
        InMemoryJobStore::arc()
    };

    tracing::info!("using Postgres stores");
    Ok(Stores {
        accounts: Arc::new(PostgresAccountStore::new(pool.clone())),
        comments: Arc::new(PostgresCommentStore::new(pool)),
        jobs,
    })
}
