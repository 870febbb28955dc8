use std::sync::Arc;

use axum::{
    extract::{Extension, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use tracing::debug;

use taskboard_auth::{Role, TokenIssuer, TokenKind};

use crate::app::{errors, services::AppServices};
use crate::context::AuthContext;

#[derive(Clone)]
pub struct AuthState {
    pub tokens: Arc<dyn TokenIssuer>,
}

pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = extract_bearer(req.headers())?;

    let claims = state
        .tokens
        .verify(TokenKind::Access, token, Utc::now())
        .map_err(|e| {
            debug!(error = %e, "access token rejected");
            StatusCode::UNAUTHORIZED
        })?;

    req.extensions_mut()
        .insert(AuthContext::new(claims.sub, claims.email));

    Ok(next.run(req).await)
}

/// Admin gate. Must run inside [`auth_middleware`].
///
/// The role is read from the store on every request so a demotion takes
/// effect before the caller's token expires.
pub async fn require_admin(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(auth): Extension<AuthContext>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    match services.accounts.profile(auth.user_id()).await {
        Ok(user) if user.role == Role::Admin => next.run(req).await,
        Ok(_) => errors::json_error(StatusCode::FORBIDDEN, "forbidden", "admin role required"),
        Err(e) => errors::account_error_to_response(e),
    }
}

pub(crate) fn extract_bearer(headers: &HeaderMap) -> Result<&str, StatusCode> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let header = header.to_str().map_err(|_| StatusCode::UNAUTHORIZED)?;

    let header = header
        .strip_prefix("Bearer ")
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let token = header.trim();
    if token.is_empty() {
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use axum::http::header::AUTHORIZATION;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn bearer_token_is_extracted() {
        assert_eq!(extract_bearer(&headers("Bearer abc.def")).unwrap(), "abc.def");
    }

    #[test]
    fn missing_or_malformed_header_is_unauthorized() {
        assert_eq!(extract_bearer(&HeaderMap::new()), Err(StatusCode::UNAUTHORIZED));
        assert_eq!(extract_bearer(&headers("Basic abc")), Err(StatusCode::UNAUTHORIZED));
        assert_eq!(extract_bearer(&headers("Bearer   ")), Err(StatusCode::UNAUTHORIZED));
    }
}
