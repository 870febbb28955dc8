//! Refreshing the author fields duplicated into card comments.
//!
//! A profile change that touches the display name or avatar enqueues one job
//! on [`UPDATE_COMMENTS_QUEUE`] carrying the user's new [`UserSnapshot`]. The
//! processor registered here rewrites every matching comment. Rewriting is
//! idempotent, so at-least-once delivery and retries are safe.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, info};

use taskboard_core::UserSnapshot;

use crate::jobs::{Job, JobError, JobProcessor, JobQueue, QueueError};
use crate::stores::{CommentStore, StoreError};

/// Queue carrying comment-author refresh jobs.
pub const UPDATE_COMMENTS_QUEUE: &str = "update_cards_comments";

/// Processor for [`UPDATE_COMMENTS_QUEUE`].
pub struct CommentPropagationProcessor {
    comments: Arc<dyn CommentStore>,
}

impl CommentPropagationProcessor {
    pub fn new(comments: Arc<dyn CommentStore>) -> Self {
        Self { comments }
    }
}

#[async_trait]
impl JobProcessor for CommentPropagationProcessor {
    async fn process(&self, job: &Job) -> Result<Value, JobError> {
        let snapshot: UserSnapshot = job.payload_as()?;
        snapshot
            .validate()
            .map_err(|e| JobError::validation(e.to_string()))?;

        let summary = self
            .comments
            .update_many_comments(&snapshot)
            .await
            .map_err(|e| match e {
                StoreError::NotFound(what) => JobError::not_found(what),
                other => JobError::transient("update comments", other),
            })?;

        serde_json::to_value(&summary).map_err(|e| JobError::validation(e.to_string()))
    }
}

/// Register the processor and the logging listeners. Call once at startup.
pub fn register_comment_propagation(
    queue: &JobQueue,
    comments: Arc<dyn CommentStore>,
) -> Result<(), QueueError> {
    queue.register_processor(UPDATE_COMMENTS_QUEUE, CommentPropagationProcessor::new(comments))?;

    queue.on_completed(UPDATE_COMMENTS_QUEUE, |job, result| {
        let matched = result.get("matched_count").and_then(Value::as_u64).unwrap_or(0);
        info!(
            queue = UPDATE_COMMENTS_QUEUE,
            job_id = %job.id,
            attempts = job.attempt,
            matched,
            "comment authors refreshed"
        );
    });
    queue.on_failed(UPDATE_COMMENTS_QUEUE, |job, err| {
        error!(
            queue = UPDATE_COMMENTS_QUEUE,
            job_id = %job.id,
            attempts = job.attempt,
            error_kind = err.kind(),
            error = %err.report(),
            "comment author refresh gave up"
        );
    });
    Ok(())
}
