//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued (first run or retry), waiting to be claimed
    Waiting,
    /// Claimed by a worker and executing
    Active,
    /// Processor succeeded
    Completed,
    /// Exhausted its attempts
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Waiting,
        JobStatus::Active,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry
    #[default]
    Fixed,
    /// Exponential backoff: delay * 2^(attempt - 1)
    Exponential,
}

/// Delay inserted between a failed attempt and its retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    pub strategy: BackoffStrategy,
    pub delay: Duration,
    /// Cap for exponential growth
    pub max_delay: Duration,
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            delay,
            max_delay: delay,
        }
    }

    pub fn exponential(delay: Duration, max_delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            delay,
            max_delay,
        }
    }

    /// Delay after the given failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        match self.strategy {
            BackoffStrategy::Fixed => self.delay,
            BackoffStrategy::Exponential => {
                let factor = 2_u32.saturating_pow(attempt - 1);
                self.delay.saturating_mul(factor).min(self.max_delay)
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::fixed(Duration::from_millis(1000))
    }
}

/// Per-job retry configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Total attempts, first run included. Must be positive.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

impl JobOptions {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be positive".to_string());
        }
        if self.backoff.strategy == BackoffStrategy::Exponential
            && self.backoff.max_delay < self.backoff.delay
        {
            return Err("max_delay must not be shorter than the base delay".to_string());
        }
        Ok(())
    }

    /// Check if another attempt is allowed after `attempt` attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Why a processor attempt failed.
///
/// The variant says what kind of failure it was; the original cause, when
/// there is one, stays reachable through `std::error::Error::source`.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Payload or input is malformed.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Something the job depends on does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A store call failed in a way that may succeed later.
    #[error("transient store error: {message}")]
    TransientStore {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },

    /// The processor panicked or its task was cancelled.
    #[error("processor crashed: {0}")]
    Crashed(String),

    /// The worker holding the final attempt stopped renewing it.
    #[error("lease expired during attempt {attempt}")]
    LeaseExpired { attempt: u32 },
}

impl JobError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn transient<E>(msg: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::TransientStore {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Validation(_) => "validation",
            JobError::NotFound(_) => "not_found",
            JobError::TransientStore { .. } => "transient_store",
            JobError::Crashed(_) => "crashed",
            JobError::LeaseExpired { .. } => "lease_expired",
        }
    }

    /// Message plus the chain of sources, for logs and job history.
    pub fn report(&self) -> String {
        let mut out = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            out.push_str(": ");
            out.push_str(&cause.to_string());
            source = cause.source();
        }
        out
    }
}

/// A queued unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,
    /// Queue the job belongs to (routes it to that queue's processor)
    pub queue: String,
    /// JSON payload, never modified after creation
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub options: JobOptions,
    /// Attempts started so far (0 until first claimed)
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest time the job may be claimed (set by backoff)
    pub scheduled_at: Option<DateTime<Utc>>,
    /// While active: when the claim lapses and another worker may take over
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Processor result, once completed
    pub result: Option<serde_json::Value>,
    /// Execution history, one record per finished attempt
    pub history: Vec<JobAttemptRecord>,
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl Job {
    pub fn new(queue: impl Into<String>, payload: serde_json::Value, options: JobOptions) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            queue: queue.into(),
            payload,
            status: JobStatus::Waiting,
            options,
            attempt: 0,
            created_at: now,
            updated_at: now,
            scheduled_at: None,
            lease_expires_at: None,
            last_error: None,
            result: None,
            history: Vec::new(),
        }
    }

    /// Decode the payload into the processor's input type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| JobError::validation(format!("malformed payload: {e}")))
    }

    /// Check if a worker may claim the job at `now`.
    ///
    /// Waiting jobs are claimable once their backoff elapsed; active jobs only
    /// once their lease lapsed (the worker holding them is presumed dead).
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Waiting => self.scheduled_at.is_none_or(|at| now >= at),
            JobStatus::Active => self.lease_expires_at.is_some_and(|at| now >= at),
            JobStatus::Completed | JobStatus::Failed => false,
        }
    }

    /// Check if the job's last allowed attempt was lost with its worker.
    ///
    /// Such a job must not be claimed again; see [`Job::mark_abandoned`].
    pub fn is_abandoned(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Active
            && self.lease_expires_at.is_some_and(|at| now >= at)
            && !self.options.should_retry(self.attempt)
    }

    /// Fail a job whose final attempt never settled.
    ///
    /// The lost attempt is recorded as starting when it was claimed.
    pub fn mark_abandoned(&mut self) -> JobError {
        let err = JobError::LeaseExpired { attempt: self.attempt };
        let claimed_at = self.updated_at;
        self.mark_failed(&err, claimed_at);
        err
    }

    /// Mark job as claimed by a worker.
    pub fn mark_active(&mut self, lease: Duration) {
        let now = Utc::now();
        self.status = JobStatus::Active;
        self.attempt += 1;
        self.scheduled_at = None;
        self.lease_expires_at = Some(after(now, lease));
        self.updated_at = now;
    }

    /// Mark job as completed.
    pub fn mark_completed(&mut self, result: serde_json::Value, started_at: DateTime<Utc>) {
        let now = Utc::now();
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.lease_expires_at = None;
        self.updated_at = now;
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at: now,
            success: true,
            error: None,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
    }

    /// Record a failed attempt: back to waiting after backoff, or failed for good.
    ///
    /// Returns the retry delay when another attempt is scheduled.
    pub fn mark_failed(&mut self, error: &JobError, started_at: DateTime<Utc>) -> Option<Duration> {
        let now = Utc::now();
        let report = error.report();
        self.updated_at = now;
        self.lease_expires_at = None;
        self.last_error = Some(report.clone());
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at: now,
            success: false,
            error: Some(report),
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });

        if self.options.should_retry(self.attempt) {
            let delay = self.options.backoff.delay_for_attempt(self.attempt);
            self.scheduled_at = Some(after(now, delay));
            self.status = JobStatus::Waiting;
            Some(delay)
        } else {
            self.scheduled_at = None;
            self.status = JobStatus::Failed;
            None
        }
    }

    /// Put a failed job back in line with a fresh attempt budget.
    pub fn reset_for_retry(&mut self) {
        self.status = JobStatus::Waiting;
        self.attempt = 0;
        self.scheduled_at = None;
        self.lease_expires_at = None;
        self.last_error = None;
        self.updated_at = Utc::now();
        self.history.clear();
    }
}

/// `now + d`, saturating instead of overflowing.
pub(crate) fn after(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_are_three_attempts_one_second_apart() {
        let options = JobOptions::default();
        assert_eq!(options.max_attempts, 3);
        assert_eq!(options.backoff.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(options.backoff.delay_for_attempt(2), Duration::from_millis(1000));
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let backoff = Backoff::exponential(Duration::from_millis(100), Duration::from_secs(10));

        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let backoff = Backoff::exponential(Duration::from_millis(100), Duration::from_millis(300));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(300));
        assert_eq!(backoff.delay_for_attempt(40), Duration::from_millis(300));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let options = JobOptions::new(3, Backoff::default());

        assert!(options.should_retry(0));
        assert!(options.should_retry(1));
        assert!(options.should_retry(2));
        assert!(!options.should_retry(3));
    }

    #[test]
    fn zero_attempts_is_invalid() {
        assert!(JobOptions::new(0, Backoff::default()).validate().is_err());
        assert!(JobOptions::default().validate().is_ok());
    }

    #[test]
    fn job_lifecycle() {
        let mut job = Job::new("test", serde_json::json!({"key": "value"}), JobOptions::default());

        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.attempt, 0);
        assert!(job.is_claimable(Utc::now()));

        job.mark_active(Duration::from_secs(30));
        assert_eq!(job.status, JobStatus::Active);
        assert_eq!(job.attempt, 1);
        assert!(!job.is_claimable(Utc::now()));

        let started = Utc::now();
        job.mark_completed(serde_json::json!({"matched_count": 2}), started);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.history.len(), 1);
        assert!(job.history[0].success);
        assert!(!job.is_claimable(Utc::now()));
    }

    #[test]
    fn job_failure_and_retry() {
        let payload = serde_json::json!({});
        let mut job = Job::new("test", payload.clone(), JobOptions::new(2, Backoff::fixed(Duration::from_secs(60))));

        job.mark_active(Duration::from_secs(30));
        let delay = job.mark_failed(&JobError::validation("error 1"), Utc::now());

        assert_eq!(delay, Some(Duration::from_secs(60)));
        assert_eq!(job.status, JobStatus::Waiting);
        assert!(!job.is_claimable(Utc::now()));

        job.mark_active(Duration::from_secs(30));
        let delay = job.mark_failed(&JobError::validation("error 2"), Utc::now());

        assert_eq!(delay, None);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.history.len(), 2);
        assert_eq!(job.payload, payload);
        assert_eq!(job.last_error.as_deref(), Some("validation failed: error 2"));
    }

    #[test]
    fn expired_lease_makes_active_job_claimable() {
        let mut job = Job::new("test", serde_json::json!({}), JobOptions::default());
        job.mark_active(Duration::ZERO);
        assert!(job.is_claimable(Utc::now()));
    }

    #[test]
    fn lapsed_final_attempt_is_abandoned() {
        let mut job = Job::new("test", serde_json::json!({}), JobOptions::new(2, Backoff::default()));

        job.mark_active(Duration::ZERO);
        assert!(!job.is_abandoned(Utc::now()), "a second attempt is still allowed");

        job.mark_active(Duration::ZERO);
        assert!(job.is_abandoned(Utc::now()));

        let err = job.mark_abandoned();
        assert_eq!(err.kind(), "lease_expired");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt, 2);
        assert_eq!(job.lease_expires_at, None);
        assert_eq!(job.history.len(), 1);
        assert_eq!(job.history[0].attempt, 2);
        assert_eq!(job.last_error.as_deref(), Some("lease expired during attempt 2"));
        assert!(!job.is_claimable(Utc::now()));
    }

    #[test]
    fn reset_clears_attempt_budget() {
        let mut job = Job::new("test", serde_json::json!({}), JobOptions::new(1, Backoff::default()));
        job.mark_active(Duration::from_secs(30));
        job.mark_failed(&JobError::not_found("card"), Utc::now());
        assert_eq!(job.status, JobStatus::Failed);

        job.reset_for_retry();
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.attempt, 0);
        assert!(job.history.is_empty());
    }

    #[test]
    fn error_report_includes_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "socket timed out");
        let err = JobError::transient("update cards", io);

        assert_eq!(err.kind(), "transient_store");
        assert_eq!(err.report(), "transient store error: update cards: socket timed out");
    }

    #[test]
    fn malformed_payload_is_a_validation_error() {
        #[derive(Debug, Deserialize)]
        struct Needs {
            #[allow(dead_code)]
            user_id: Uuid,
        }

        let job = Job::new("test", serde_json::json!({"display_name": "x"}), JobOptions::default());
        assert!(matches!(job.payload_as::<Needs>(), Err(JobError::Validation(_))));
    }
}
