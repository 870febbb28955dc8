use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use tracing::error;

use taskboard_infra::AccountError;
use taskboard_infra::external::UploadError;
use taskboard_infra::jobs::{JobStoreError, QueueError};
use taskboard_infra::stores::StoreError;

pub fn account_error_to_response(err: AccountError) -> axum::response::Response {
    match err {
        AccountError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        AccountError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        AccountError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        AccountError::Unauthorized(msg) => json_error(StatusCode::UNAUTHORIZED, "unauthorized", msg),
        AccountError::Upload(UploadError::Rejected(msg)) => {
            json_error(StatusCode::BAD_REQUEST, "upload_rejected", msg)
        }
        AccountError::Mail(e) => {
            error!(error = %e, "mail delivery failed");
            json_error(StatusCode::BAD_GATEWAY, "mail_error", "could not send email")
        }
        AccountError::Store(StoreError::Unavailable { message, .. }) => {
            error!(error = %message, "store unavailable");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", "storage is unavailable")
        }
        other => {
            error!(error = %other, "request failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "internal error")
        }
    }
}

pub fn queue_error_to_response(err: QueueError) -> axum::response::Response {
    match err {
        QueueError::Store(JobStoreError::NotFound(id)) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found"))
        }
        QueueError::Store(e @ JobStoreError::InvalidState { .. }) => {
            json_error(StatusCode::CONFLICT, "invalid_state", e.to_string())
        }
        QueueError::Closed => json_error(StatusCode::SERVICE_UNAVAILABLE, "queue_closed", "queue is closed"),
        other => {
            error!(error = %other, "queue request failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "queue_error", other.to_string())
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
