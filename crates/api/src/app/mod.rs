//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: stores, job queue and account service wiring
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Where `LocalAvatarUploader` files are served; the default
/// `UPLOAD_BASE_URL` points here.
pub const UPLOADS_PATH: &str = "/uploads";

/// Build the full HTTP router (public entrypoint used by `main.rs`).
///
/// Starting the queue worker is left to the caller.
pub fn build_app(services: Arc<services::AppServices>) -> Router {
    let auth_state = middleware::AuthState {
        tokens: services.accounts.tokens().clone(),
    };
    let authenticated = axum::middleware::from_fn_with_state(auth_state, middleware::auth_middleware);

    let users = routes::users::public_router().merge(
        routes::users::protected_router().layer(authenticated.clone()),
    );

    // Layers run bottom-up: auth populates the context the admin gate reads.
    let admin = routes::admin::router()
        .layer(axum::middleware::from_fn(middleware::require_admin))
        .layer(authenticated);

    Router::new()
        .route("/health", get(routes::system::health))
        .nest("/v1/users", users)
        .nest("/v1/admin", admin)
        .nest(UPLOADS_PATH, routes::uploads::router())
        .layer(ServiceBuilder::new().layer(Extension(services)))
}
