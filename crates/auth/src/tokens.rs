//! Access/refresh token issuing and verification (HS256 JWT).

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use thiserror::Error;

use crate::claims::{TokenClaims, TokenValidationError, validate_claims};

/// Which secret/lifetime pair a token uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Access,
    Refresh,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("failed to sign token: {0}")]
    Sign(#[source] jsonwebtoken::errors::Error),

    #[error("invalid token: {0}")]
    Invalid(#[source] jsonwebtoken::errors::Error),

    #[error(transparent)]
    Claims(#[from] TokenValidationError),
}

/// Signs and verifies tokens. Implementations must be cheap to call from async code.
pub trait TokenIssuer: Send + Sync {
    fn issue(
        &self,
        kind: TokenKind,
        sub: taskboard_core::UserId,
        email: &str,
        now: DateTime<Utc>,
    ) -> Result<String, TokenError>;

    fn verify(&self, kind: TokenKind, token: &str, now: DateTime<Utc>) -> Result<TokenClaims, TokenError>;

    fn issue_pair(
        &self,
        sub: taskboard_core::UserId,
        email: &str,
        now: DateTime<Utc>,
    ) -> Result<TokenPair, TokenError> {
        Ok(TokenPair {
            access_token: self.issue(TokenKind::Access, sub, email, now)?,
            refresh_token: self.issue(TokenKind::Refresh, sub, email, now)?,
        })
    }
}

/// Secret + lifetime for one token kind.
#[derive(Clone)]
pub struct TokenSettings {
    pub secret: Vec<u8>,
    pub lifetime: chrono::Duration,
}

impl core::fmt::Debug for TokenSettings {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TokenSettings")
            .field("secret", &"<redacted>")
            .field("lifetime", &self.lifetime)
            .finish()
    }
}

/// HMAC-SHA256 issuer with independent access and refresh secrets.
#[derive(Debug, Clone)]
pub struct Hs256TokenIssuer {
    access: TokenSettings,
    refresh: TokenSettings,
}

impl Hs256TokenIssuer {
    pub fn new(access: TokenSettings, refresh: TokenSettings) -> Self {
        Self { access, refresh }
    }

    fn settings(&self, kind: TokenKind) -> &TokenSettings {
        match kind {
            TokenKind::Access => &self.access,
            TokenKind::Refresh => &self.refresh,
        }
    }
}

impl TokenIssuer for Hs256TokenIssuer {
    fn issue(
        &self,
        kind: TokenKind,
        sub: taskboard_core::UserId,
        email: &str,
        now: DateTime<Utc>,
    ) -> Result<String, TokenError> {
        let settings = self.settings(kind);
        let claims = TokenClaims::new(sub, email, now, settings.lifetime);
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(&settings.secret),
        )
        .map_err(TokenError::Sign)
    }

    fn verify(&self, kind: TokenKind, token: &str, now: DateTime<Utc>) -> Result<TokenClaims, TokenError> {
        let settings = self.settings(kind);

        // Time checks run against the caller's clock in `validate_claims`.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.leeway = 0;

        let data = jsonwebtoken::decode::<TokenClaims>(
            token,
            &DecodingKey::from_secret(&settings.secret),
            &validation,
        )
        .map_err(TokenError::Invalid)?;

        validate_claims(&data.claims, now)?;
        Ok(data.claims)
    }
}
