//! Account routes: registration, verification, sign-in, token refresh and
//! profile updates.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Extension, FromRequest, Multipart, Request},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
    routing::{get, post, put},
};

use taskboard_auth::{AvatarUpload, ProfileUpdate};
use taskboard_infra::external::uploads::MAX_UPLOAD_BYTES;

use crate::app::{dto, errors, services::AppServices};
use crate::context::AuthContext;

/// Header carrying the refresh token on `GET /refresh_token`.
pub const REFRESH_TOKEN_HEADER: &str = "x-refresh-token";

/// Multipart field holding the avatar image.
const AVATAR_FIELD: &str = "avatar";

// ─────────────────────────────────────────────────────────────────────────────
// Routers
// ─────────────────────────────────────────────────────────────────────────────

pub fn public_router() -> Router {
    Router::new()
        .route("/register", post(register))
        .route("/verify", put(verify))
        .route("/login", post(login))
        .route("/refresh_token", get(refresh_token))
}

pub fn protected_router() -> Router {
    Router::new()
        .route("/me", get(me))
        .route("/update", put(update))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES + 64 * 1024))
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// POST /v1/users/register
pub async fn register(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::RegisterRequest>,
) -> axum::response::Response {
    match services.accounts.register(&body.email, &body.password).await {
        Ok(user) => (StatusCode::CREATED, Json(user)).into_response(),
        Err(e) => errors::account_error_to_response(e),
    }
}

/// PUT /v1/users/verify
pub async fn verify(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::VerifyRequest>,
) -> axum::response::Response {
    match services.accounts.verify_account(&body.email, &body.token).await {
        Ok(user) => Json(user).into_response(),
        Err(e) => errors::account_error_to_response(e),
    }
}

/// POST /v1/users/login
pub async fn login(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::LoginRequest>,
) -> axum::response::Response {
    match services.accounts.sign_in(&body.email, &body.password).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => errors::account_error_to_response(e),
    }
}

/// GET /v1/users/refresh_token
///
/// The token comes from the `x-refresh-token` header, or failing that from a
/// JSON body `{"refresh_token": "..."}`.
pub async fn refresh_token(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    let from_header = headers
        .get(REFRESH_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    let token = match from_header {
        Some(token) => Some(token),
        None if body.is_empty() => None,
        None => match serde_json::from_slice::<dto::RefreshTokenRequest>(&body) {
            Ok(req) => req.refresh_token.filter(|t| !t.is_empty()),
            Err(e) => {
                return errors::json_error(StatusCode::BAD_REQUEST, "invalid_body", e.to_string());
            }
        },
    };

    let Some(token) = token else {
        return errors::json_error(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "refresh token is required",
        );
    };

    match services.accounts.refresh_token(&token).await {
        Ok(access_token) => Json(dto::RefreshTokenResponse { access_token }).into_response(),
        Err(e) => errors::account_error_to_response(e),
    }
}

/// GET /v1/users/me
pub async fn me(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(auth): Extension<AuthContext>,
) -> axum::response::Response {
    match services.accounts.profile(auth.user_id()).await {
        Ok(user) => Json(user).into_response(),
        Err(e) => errors::account_error_to_response(e),
    }
}

/// PUT /v1/users/update
///
/// Accepts a JSON body or `multipart/form-data` with an optional `avatar`
/// file. Returns as soon as the account is saved; comment propagation runs
/// in the background.
pub async fn update(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(auth): Extension<AuthContext>,
    req: Request,
) -> axum::response::Response {
    let is_multipart = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("multipart/form-data"));

    let update = if is_multipart {
        let multipart = match Multipart::from_request(req, &()).await {
            Ok(m) => m,
            Err(rejection) => return rejection.into_response(),
        };
        match read_multipart(multipart).await {
            Ok(update) => update,
            Err(response) => return response,
        }
    } else {
        match Json::<dto::UpdateProfileRequest>::from_request(req, &()).await {
            Ok(Json(body)) => {
                ProfileUpdate::from_request(None, body.current_password, body.new_password, body.display_name)
            }
            Err(rejection) => return rejection.into_response(),
        }
    };

    match services.accounts.update(auth.user_id(), update).await {
        Ok(user) => Json(user).into_response(),
        Err(e) => errors::account_error_to_response(e),
    }
}

async fn read_multipart(mut multipart: Multipart) -> Result<ProfileUpdate, axum::response::Response> {
    let mut avatar = None;
    let mut body = dto::UpdateProfileRequest::default();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return Err(e.into_response()),
        };
        let name = field.name().unwrap_or_default().to_string();

        if name == AVATAR_FIELD {
            let filename = field.file_name().unwrap_or("avatar").to_string();
            let content_type = field.content_type().map(str::to_string);
            let bytes = field.bytes().await.map_err(IntoResponse::into_response)?;
            if !bytes.is_empty() {
                avatar = Some(AvatarUpload {
                    filename,
                    content_type,
                    bytes: bytes.to_vec(),
                });
            }
            continue;
        }

        let value = field.text().await.map_err(IntoResponse::into_response)?;
        match name.as_str() {
            "display_name" => body.display_name = Some(value),
            "current_password" => body.current_password = Some(value),
            "new_password" => body.new_password = Some(value),
            _ => {}
        }
    }

    Ok(ProfileUpdate::from_request(
        avatar,
        body.current_password,
        body.new_password,
        body.display_name,
    ))
}
