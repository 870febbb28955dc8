//! Serves stored avatars back under the public upload URL.

use std::path::Path as FsPath;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Extension, Path},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use tracing::warn;

use crate::app::{errors, services::AppServices};

pub fn router() -> Router {
    Router::new().route("/:folder/:file", get(download))
}

/// GET /uploads/:folder/:file
pub async fn download(
    Extension(services): Extension<Arc<AppServices>>,
    Path((folder, file)): Path<(String, String)>,
) -> axum::response::Response {
    if !is_plain_segment(&folder) || !is_plain_segment(&file) {
        return errors::json_error(StatusCode::BAD_REQUEST, "invalid_path", "invalid file path");
    }

    let path = services.upload_dir.join(&folder).join(&file);
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let content_type = content_type_for(&file);
            ([(header::CONTENT_TYPE, content_type)], bytes).into_response()
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            errors::json_error(StatusCode::NOT_FOUND, "not_found", "file not found")
        }
        Err(e) => {
            warn!(folder, file, error = %e, "upload read failed");
            errors::json_error(StatusCode::NOT_FOUND, "not_found", "file not found")
        }
    }
}

/// One path segment with no separators or parent references.
fn is_plain_segment(segment: &str) -> bool {
    !segment.is_empty()
        && !segment.starts_with('.')
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn content_type_for(file: &str) -> String {
    mime_guess::from_path(FsPath::new(file))
        .first_or_octet_stream()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_traversal_and_separators() {
        assert!(is_plain_segment("0192c1a0-7d3e-7c4b-9d2a-1f2e3d4c5b6a.png"));
        assert!(is_plain_segment("users"));

        assert!(!is_plain_segment(""));
        assert!(!is_plain_segment(".."));
        assert!(!is_plain_segment(".env"));
        assert!(!is_plain_segment("a/b"));
        assert!(!is_plain_segment("a\\b"));
        assert!(!is_plain_segment("a%2Fb"));
    }

    #[test]
    fn content_type_follows_extension() {
        assert_eq!(content_type_for("me.png"), "image/png");
        assert_eq!(content_type_for("me.jpg"), "image/jpeg");
        assert_eq!(content_type_for("blob"), "application/octet-stream");
    }
}
