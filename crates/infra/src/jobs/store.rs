//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::types::{Job, JobId, JobStatus};

/// Durable job storage shared by producers and workers.
///
/// `claim_next` must be atomic: two workers calling it concurrently (even from
/// different processes) never receive the same job while its lease holds.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job.
    async fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError>;

    /// Get a job by ID.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Settle the attempt `job.attempt` with the job's new state.
    ///
    /// Fenced: the write only lands while the stored job is still active on
    /// that same attempt. Otherwise fails with [`JobStoreError::LeaseLost`]
    /// and leaves the stored job untouched.
    async fn update(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Claim the next claimable job of a queue, marking it active under a lease.
    /// Returns None if no jobs are available.
    ///
    /// An active job whose lease lapsed on its last allowed attempt is not run
    /// again: the store fails it in the same step and returns it with status
    /// [`JobStatus::Failed`].
    async fn claim_next(&self, queue: &str, lease: Duration) -> Result<Option<Job>, JobStoreError>;

    /// List jobs of a queue, optionally filtered by status, oldest first.
    async fn list(
        &self,
        queue: &str,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Retry a failed job (move back to waiting with a fresh attempt budget).
    async fn retry_failed(&self, job_id: JobId) -> Result<Job, JobStoreError>;

    /// Get per-status counts for a queue.
    async fn stats(&self, queue: &str) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {job_id} is {status}, expected {expected}")]
    InvalidState {
        job_id: JobId,
        status: JobStatus,
        expected: JobStatus,
    },
    #[error("job {job_id} lease lost: attempt {attempt} is no longer current")]
    LeaseLost { job_id: JobId, attempt: u32 },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus) {
        self.add(status, 1);
    }

    pub fn add(&mut self, status: JobStatus, n: usize) {
        match status {
            JobStatus::Waiting => self.waiting += n,
            JobStatus::Active => self.active += n,
            JobStatus::Completed => self.completed += n,
            JobStatus::Failed => self.failed += n,
        }
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::Storage("job map lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("job map lock poisoned".to_string()))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut jobs = self.write()?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.get(&job_id).cloned())
    }

    async fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.write()?;
        let stored = jobs.get_mut(&job.id).ok_or(JobStoreError::NotFound(job.id))?;
        if stored.status != JobStatus::Active || stored.attempt != job.attempt {
            return Err(JobStoreError::LeaseLost {
                job_id: job.id,
                attempt: job.attempt,
            });
        }
        *stored = job.clone();
        Ok(())
    }

    async fn claim_next(&self, queue: &str, lease: Duration) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.write()?;
        let now = Utc::now();

        // Oldest claimable job first
        let next = jobs
            .values()
            .filter(|j| j.queue == queue && j.is_claimable(now))
            .min_by_key(|j| (j.scheduled_at.unwrap_or(j.created_at), j.created_at))
            .map(|j| j.id);

        Ok(next.and_then(|id| {
            jobs.get_mut(&id).map(|job| {
                if job.is_abandoned(now) {
                    job.mark_abandoned();
                } else {
                    job.mark_active(lease);
                }
                job.clone()
            })
        }))
    }

    async fn list(
        &self,
        queue: &str,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.read()?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.queue == queue && status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();

        result.sort_by_key(|j| j.created_at);
        result.truncate(limit);
        Ok(result)
    }

    async fn retry_failed(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        let mut jobs = self.write()?;
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;

        if job.status != JobStatus::Failed {
            return Err(JobStoreError::InvalidState {
                job_id,
                status: job.status,
                expected: JobStatus::Failed,
            });
        }

        job.reset_for_retry();
        Ok(job.clone())
    }

    async fn stats(&self, queue: &str) -> Result<JobStats, JobStoreError> {
        let jobs = self.read()?;
        let mut stats = JobStats::default();
        for job in jobs.values().filter(|j| j.queue == queue) {
            stats.record(job.status);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{Backoff, JobError, JobOptions};

    const LEASE: Duration = Duration::from_secs(30);

    fn job(queue: &str) -> Job {
        Job::new(queue, serde_json::json!({}), JobOptions::default())
    }

    #[tokio::test]
    async fn enqueue_and_claim() {
        let store = InMemoryJobStore::new();

        let job_id = store.enqueue(job("comments")).await.unwrap();

        let claimed = store.claim_next("comments", LEASE).await.unwrap().unwrap();
        assert_eq!(claimed.id, job_id);
        assert_eq!(claimed.status, JobStatus::Active);
        assert_eq!(claimed.attempt, 1);

        // No more jobs
        assert!(store.claim_next("comments", LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_rejected() {
        let store = InMemoryJobStore::new();
        let job = job("comments");
        store.enqueue(job.clone()).await.unwrap();

        assert!(matches!(
            store.enqueue(job).await,
            Err(JobStoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn queues_are_isolated() {
        let store = InMemoryJobStore::new();
        store.enqueue(job("comments")).await.unwrap();

        assert!(store.claim_next("emails", LEASE).await.unwrap().is_none());
        assert!(store.claim_next("comments", LEASE).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn claims_oldest_first() {
        let store = InMemoryJobStore::new();
        let first = store.enqueue(job("comments")).await.unwrap();
        let second = store.enqueue(job("comments")).await.unwrap();

        assert_eq!(store.claim_next("comments", LEASE).await.unwrap().unwrap().id, first);
        assert_eq!(store.claim_next("comments", LEASE).await.unwrap().unwrap().id, second);
    }

    #[tokio::test]
    async fn backoff_hides_job_until_due() {
        let store = InMemoryJobStore::new();
        let mut job = Job::new(
            "comments",
            serde_json::json!({}),
            JobOptions::new(3, Backoff::fixed(Duration::from_secs(60))),
        );
        store.enqueue(job.clone()).await.unwrap();

        job = store.claim_next("comments", LEASE).await.unwrap().unwrap();
        job.mark_failed(&JobError::validation("boom"), Utc::now());
        store.update(&job).await.unwrap();

        assert_eq!(store.stats("comments").await.unwrap().waiting, 1);
        assert!(store.claim_next("comments", LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn due_retry_is_claimed_as_next_attempt() {
        let store = InMemoryJobStore::new();
        let job = Job::new(
            "comments",
            serde_json::json!({}),
            JobOptions::new(3, Backoff::fixed(Duration::ZERO)),
        );
        store.enqueue(job).await.unwrap();

        let mut job = store.claim_next("comments", LEASE).await.unwrap().unwrap();
        job.mark_failed(&JobError::validation("boom"), Utc::now());
        store.update(&job).await.unwrap();

        let retried = store.claim_next("comments", LEASE).await.unwrap().unwrap();
        assert_eq!(retried.attempt, 2);
        assert_eq!(retried.history.len(), 1);
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed() {
        let store = InMemoryJobStore::new();
        let job_id = store.enqueue(job("comments")).await.unwrap();

        let first = store.claim_next("comments", Duration::ZERO).await.unwrap().unwrap();
        let second = store.claim_next("comments", LEASE).await.unwrap().unwrap();

        assert_eq!(first.id, job_id);
        assert_eq!(second.id, job_id);
        assert_eq!(second.attempt, 2);
        assert!(store.claim_next("comments", LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lapsed_final_attempt_is_failed_not_reclaimed() {
        let store = InMemoryJobStore::new();
        let job = Job::new("comments", serde_json::json!({}), JobOptions::new(2, Backoff::default()));
        let job_id = store.enqueue(job).await.unwrap();

        store.claim_next("comments", Duration::ZERO).await.unwrap().unwrap();
        let last = store.claim_next("comments", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(last.attempt, 2);

        let settled = store.claim_next("comments", LEASE).await.unwrap().unwrap();
        assert_eq!(settled.id, job_id);
        assert_eq!(settled.status, JobStatus::Failed);
        assert_eq!(settled.attempt, 2);
        assert_eq!(settled.last_error.as_deref(), Some("lease expired during attempt 2"));

        assert!(store.claim_next("comments", LEASE).await.unwrap().is_none());
        assert_eq!(store.stats("comments").await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn update_from_superseded_attempt_is_rejected() {
        let store = InMemoryJobStore::new();
        store.enqueue(job("comments")).await.unwrap();

        let mut stale = store.claim_next("comments", Duration::ZERO).await.unwrap().unwrap();
        let current = store.claim_next("comments", LEASE).await.unwrap().unwrap();
        assert_eq!(current.attempt, 2);

        stale.mark_completed(serde_json::json!({}), Utc::now());
        assert!(matches!(
            store.update(&stale).await,
            Err(JobStoreError::LeaseLost { attempt: 1, .. })
        ));

        let stored = store.get(current.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Active);
        assert_eq!(stored.attempt, 2);
    }

    #[tokio::test]
    async fn settled_job_cannot_be_settled_again() {
        let store = InMemoryJobStore::new();
        store.enqueue(job("comments")).await.unwrap();

        let mut job = store.claim_next("comments", LEASE).await.unwrap().unwrap();
        job.mark_completed(serde_json::json!({}), Utc::now());
        store.update(&job).await.unwrap();

        assert!(matches!(
            store.update(&job).await,
            Err(JobStoreError::LeaseLost { .. })
        ));
    }

    #[tokio::test]
    async fn retry_failed_flow() {
        let store = InMemoryJobStore::new();
        let job = Job::new("comments", serde_json::json!({}), JobOptions::new(1, Backoff::default()));
        let job_id = store.enqueue(job).await.unwrap();

        // Only failed jobs can be retried
        assert!(matches!(
            store.retry_failed(job_id).await,
            Err(JobStoreError::InvalidState { .. })
        ));

        let mut claimed = store.claim_next("comments", LEASE).await.unwrap().unwrap();
        claimed.mark_failed(&JobError::validation("test error"), Utc::now());
        store.update(&claimed).await.unwrap();
        assert_eq!(store.stats("comments").await.unwrap().failed, 1);

        let retried = store.retry_failed(job_id).await.unwrap();
        assert_eq!(retried.status, JobStatus::Waiting);
        assert_eq!(retried.attempt, 0);
        assert!(store.claim_next("comments", LEASE).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stats_and_listing() {
        let store = InMemoryJobStore::new();

        for i in 0..5 {
            let job = Job::new("comments", serde_json::json!({"i": i}), JobOptions::default());
            store.enqueue(job).await.unwrap();
        }

        let stats = store.stats("comments").await.unwrap();
        assert_eq!(stats.waiting, 5);

        store.claim_next("comments", LEASE).await.unwrap();
        store.claim_next("comments", LEASE).await.unwrap();

        let stats = store.stats("comments").await.unwrap();
        assert_eq!(stats.waiting, 3);
        assert_eq!(stats.active, 2);

        let active = store.list("comments", Some(JobStatus::Active), 10).await.unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(store.list("comments", None, 4).await.unwrap().len(), 4);
    }
}
