//! Admin routes for inspecting and retrying background jobs.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use tracing::info;

use taskboard_infra::jobs::JobId;

use crate::app::{dto, errors, services::AppServices};
use crate::context::AuthContext;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

pub fn router() -> Router {
    Router::new()
        .route("/queues/:name/stats", get(queue_stats))
        .route("/queues/:name/jobs", get(list_jobs))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/retry", post(retry_job))
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// GET /v1/admin/queues/:name/stats
pub async fn queue_stats(
    Extension(services): Extension<Arc<AppServices>>,
    Path(name): Path<String>,
) -> axum::response::Response {
    match services.queue.stats(&name).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// GET /v1/admin/queues/:name/jobs?status=failed&limit=50
pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Path(name): Path<String>,
    Query(query): Query<dto::ListJobsQuery>,
) -> axum::response::Response {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT);
    match services.queue.list(&name, query.status, limit).await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// GET /v1/admin/jobs/:id
pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.queue.get(job_id).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("job {job_id} not found")),
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// POST /v1/admin/jobs/:id/retry - Put a failed job back in the queue
pub async fn retry_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.queue.retry_failed(job_id).await {
        Ok(job) => {
            info!(job_id = %job.id, queue = %job.queue, admin_id = %auth.user_id(), "failed job requeued");
            (StatusCode::ACCEPTED, Json(job)).into_response()
        }
        Err(e) => errors::queue_error_to_response(e),
    }
}

fn parse_job_id(raw: &str) -> Result<JobId, axum::response::Response> {
    raw.parse::<JobId>()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"))
}
