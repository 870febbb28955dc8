//! Configuration loading and representation.
//!
//! Everything comes from environment variables. Secrets have no defaults
//! unless `APP_ENV` is `dev` (the default), where insecure fallbacks are used
//! with a warning.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::external::HttpMailerConfig;
use crate::jobs::QueueConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Secret and lifetime of one token kind.
#[derive(Clone)]
pub struct TokenConfig {
    pub secret: String,
    pub lifetime: Duration,
}

impl std::fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenConfig")
            .field("secret", &"<redacted>")
            .field("lifetime", &self.lifetime)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum MailerConfig {
    /// Log messages instead of sending them
    Log,
    Http(HttpMailerConfig),
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub website_domain: String,
    pub access_token: TokenConfig,
    pub refresh_token: TokenConfig,
    pub bcrypt_cost: u32,
    /// Postgres + Redis when true, in-memory otherwise
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub redis_url: String,
    pub queue: QueueConfig,
    pub upload_dir: PathBuf,
    /// Public URL prefix the upload dir is served under
    pub upload_base_url: String,
    pub mailer: MailerConfig,
    /// Bootstrap admin account created at startup when both are set
    pub admin: Option<AdminConfig>,
}

#[derive(Clone)]
pub struct AdminConfig {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for AdminConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminConfig")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let dev = var("APP_ENV").is_none_or(|env| env == "dev");

        let secret = |name: &'static str, fallback: &str| -> Result<String, ConfigError> {
            match var(name) {
                Some(value) => Ok(value),
                None if dev => {
                    warn!(var = name, "not set; using insecure dev default");
                    Ok(fallback.to_string())
                }
                None => Err(ConfigError::Missing(name)),
            }
        };

        let access_token = TokenConfig {
            secret: secret("ACCESS_TOKEN_SECRET_SIGNATURE", "dev-access-secret")?,
            lifetime: Duration::from_secs(parse(&var, "ACCESS_TOKEN_SECRET_LIFE", 3600)?),
        };
        let refresh_token = TokenConfig {
            secret: secret("REFRESH_TOKEN_SECRET_SIGNATURE", "dev-refresh-secret")?,
            lifetime: Duration::from_secs(parse(&var, "REFRESH_TOKEN_SECRET_LIFE", 14 * 24 * 3600)?),
        };
        if access_token.secret == refresh_token.secret {
            warn!("access and refresh tokens share a secret");
        }

        let bind_addr = parse(&var, "BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?;
        let website_domain = var("WEBSITE_DOMAIN").unwrap_or_else(|| "http://localhost:5173".to_string());

        let use_persistent_stores = parse(&var, "USE_PERSISTENT_STORES", false)?;
        let database_url = var("DATABASE_URL");
        if use_persistent_stores && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let concurrency: usize = parse(&var, "QUEUE_CONCURRENCY", 4)?;
        if concurrency == 0 {
            return Err(ConfigError::Invalid {
                name: "QUEUE_CONCURRENCY",
                reason: "must be positive".to_string(),
            });
        }
        let queue = QueueConfig::default()
            .with_name("comment-propagation")
            .with_poll_interval(Duration::from_millis(parse(&var, "QUEUE_POLL_INTERVAL_MS", 100)?))
            .with_concurrency(concurrency)
            .with_lease(Duration::from_secs(parse(&var, "QUEUE_LEASE_SECS", 300)?));

        let mailer = match var("MAILER_API_KEY") {
            Some(api_key) => MailerConfig::Http(HttpMailerConfig {
                endpoint: var("MAILER_ENDPOINT")
                    .unwrap_or_else(|| "https://api.brevo.com/v3/smtp/email".to_string()),
                api_key,
                sender_name: var("MAILER_SENDER_NAME").unwrap_or_else(|| "Taskboard".to_string()),
                sender_email: var("MAILER_SENDER_EMAIL").ok_or(ConfigError::Missing("MAILER_SENDER_EMAIL"))?,
            }),
            None => MailerConfig::Log,
        };

        let admin = match (var("ADMIN_EMAIL"), var("ADMIN_PASSWORD")) {
            (Some(email), Some(password)) => Some(AdminConfig { email, password }),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::Missing("ADMIN_PASSWORD")),
            (None, Some(_)) => return Err(ConfigError::Missing("ADMIN_EMAIL")),
        };

        Ok(Self {
            bind_addr,
            website_domain,
            access_token,
            refresh_token,
            bcrypt_cost: parse(&var, "BCRYPT_COST", 10)?,
            use_persistent_stores,
            database_url,
            redis_url: var("REDIS_URL").unwrap_or_else(|| "redis://localhost:6379".to_string()),
            queue,
            upload_dir: var("UPLOAD_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("uploads")),
            upload_base_url: var("UPLOAD_BASE_URL")
                .unwrap_or_else(|| "http://localhost:8080/uploads".to_string()),
            mailer,
            admin,
        })
    }
}

fn parse<T>(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn dev_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.access_token.lifetime, Duration::from_secs(3600));
        assert!(!config.use_persistent_stores);
        assert_eq!(config.queue.concurrency, 4);
        assert!(matches!(config.mailer, MailerConfig::Log));
    }

    #[test]
    fn production_requires_secrets() {
        let result = load(&[("APP_ENV", "production")]);
        assert!(matches!(
            result,
            Err(ConfigError::Missing("ACCESS_TOKEN_SECRET_SIGNATURE"))
        ));
    }

    #[test]
    fn persistent_stores_need_database_url() {
        let result = load(&[("USE_PERSISTENT_STORES", "true")]);
        assert!(matches!(result, Err(ConfigError::Missing("DATABASE_URL"))));
    }

    #[test]
    fn bad_numbers_are_reported_by_name() {
        let result = load(&[("QUEUE_LEASE_SECS", "soon")]);
        assert!(matches!(
            result,
            Err(ConfigError::Invalid { name: "QUEUE_LEASE_SECS", .. })
        ));
        assert!(load(&[("QUEUE_CONCURRENCY", "0")]).is_err());
    }

    #[test]
    fn admin_needs_both_fields() {
        assert!(matches!(
            load(&[("ADMIN_EMAIL", "root@example.com")]),
            Err(ConfigError::Missing("ADMIN_PASSWORD"))
        ));
        let config = load(&[("ADMIN_EMAIL", "root@example.com"), ("ADMIN_PASSWORD", "secret-pass")]).unwrap();
        assert_eq!(config.admin.unwrap().email, "root@example.com");
    }

    #[test]
    fn http_mailer_is_selected_by_api_key() {
        let config = load(&[
            ("MAILER_API_KEY", "key"),
            ("MAILER_SENDER_EMAIL", "noreply@example.com"),
        ])
        .unwrap();
        match config.mailer {
            MailerConfig::Http(http) => assert_eq!(http.sender_email, "noreply@example.com"),
            MailerConfig::Log => panic!("expected http mailer"),
        }
    }
}
