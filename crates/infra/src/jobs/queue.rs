//! Named work queue client: producers enqueue, a worker task claims and runs jobs
//! with retry and backoff, listeners observe settled jobs.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::store::{JobStats, JobStore, JobStoreError};
use super::types::{Job, JobError, JobId, JobOptions, JobStatus};

/// Runs the jobs of one queue.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &Job) -> Result<Value, JobError>;
}

/// Adapts an async closure into a [`JobProcessor`].
pub struct FnProcessor<F>(pub F);

#[async_trait]
impl<F, Fut> JobProcessor for FnProcessor<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
{
    async fn process(&self, job: &Job) -> Result<Value, JobError> {
        (self.0)(job.clone()).await
    }
}

pub type CompletedListener = Arc<dyn Fn(&Job, &Value) + Send + Sync>;
pub type FailedListener = Arc<dyn Fn(&Job, &JobError) + Send + Sync>;

/// Queue client errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("invalid job options: {0}")]
    InvalidOptions(String),

    #[error("a processor is already registered for queue {0}")]
    ProcessorAlreadyRegistered(String),

    #[error("no processor registered for queue {0}")]
    NoProcessor(String),

    #[error("queue client is closed")]
    Closed,

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Name for logging
    pub name: String,
    /// How often to poll the store when not woken
    pub poll_interval: Duration,
    /// Maximum concurrent jobs
    pub concurrency: usize,
    /// How long a claim holds before another worker may take the job over
    pub lease: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "queue-worker".to_string(),
            poll_interval: Duration::from_millis(100),
            concurrency: 4,
            lease: Duration::from_secs(300),
        }
    }
}

impl QueueConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }
}

/// How one attempt settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Failed, another attempt scheduled after the delay
    Retrying(Duration),
    /// Failed with no attempts left
    Failed,
    /// Another worker took the job over first; nothing was recorded
    LeaseLost,
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_completed: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

struct QueueInner {
    store: Arc<dyn JobStore>,
    config: QueueConfig,
    processors: RwLock<HashMap<String, Arc<dyn JobProcessor>>>,
    completed: RwLock<HashMap<String, Vec<CompletedListener>>>,
    failed: RwLock<HashMap<String, Vec<FailedListener>>>,
    wake: Notify,
    closed: AtomicBool,
}

/// Client for the job queues backed by one [`JobStore`].
///
/// Cheap to clone; clones share processors, listeners and the worker wake-up.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("config", &self.inner.config)
            .field("queues", &self.inner.queue_names())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                store,
                config,
                processors: RwLock::new(HashMap::new()),
                completed: RwLock::new(HashMap::new()),
                failed: RwLock::new(HashMap::new()),
                wake: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Persist a job and wake the worker. Does not wait for execution.
    pub async fn enqueue<T: Serialize + ?Sized>(
        &self,
        queue: &str,
        payload: &T,
        options: JobOptions,
    ) -> Result<JobId, QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        options.validate().map_err(QueueError::InvalidOptions)?;

        let job = Job::new(queue, serde_json::to_value(payload)?, options);
        let job_id = self.inner.store.enqueue(job).await?;
        self.inner.wake.notify_one();

        debug!(queue, job_id = %job_id, "job enqueued");
        Ok(job_id)
    }

    /// Register the processor for a queue. One per queue name.
    pub fn register_processor<P>(&self, queue: &str, processor: P) -> Result<(), QueueError>
    where
        P: JobProcessor + 'static,
    {
        let mut processors = self
            .inner
            .processors
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if processors.contains_key(queue) {
            return Err(QueueError::ProcessorAlreadyRegistered(queue.to_string()));
        }
        processors.insert(queue.to_string(), Arc::new(processor));
        drop(processors);

        info!(worker = %self.inner.config.name, queue, "processor registered");
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Observe jobs that completed.
    pub fn on_completed<F>(&self, queue: &str, listener: F)
    where
        F: Fn(&Job, &Value) + Send + Sync + 'static,
    {
        self.inner
            .completed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(queue.to_string())
            .or_default()
            .push(Arc::new(listener));
    }

    /// Observe jobs that failed with no attempts left.
    pub fn on_failed<F>(&self, queue: &str, listener: F)
    where
        F: Fn(&Job, &JobError) + Send + Sync + 'static,
    {
        self.inner
            .failed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(queue.to_string())
            .or_default()
            .push(Arc::new(listener));
    }

    pub async fn get(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.inner.store.get(job_id).await?)
    }

    pub async fn list(
        &self,
        queue: &str,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, QueueError> {
        Ok(self.inner.store.list(queue, status, limit).await?)
    }

    pub async fn stats(&self, queue: &str) -> Result<JobStats, QueueError> {
        Ok(self.inner.store.stats(queue).await?)
    }

    /// Put a failed job back in line with a fresh attempt budget.
    pub async fn retry_failed(&self, job_id: JobId) -> Result<Job, QueueError> {
        let job = self.inner.store.retry_failed(job_id).await?;
        self.inner.wake.notify_one();
        info!(queue = %job.queue, job_id = %job_id, "failed job requeued");
        Ok(job)
    }

    /// Stop accepting new jobs. Running workers keep draining until shut down.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            info!(worker = %self.inner.config.name, "queue client closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Claim and run one ready job of `queue` on the calling task.
    ///
    /// Returns `None` when nothing is ready.
    pub async fn process_next(&self, queue: &str) -> Result<Option<JobOutcome>, QueueError> {
        let processor = self
            .inner
            .processor(queue)
            .ok_or_else(|| QueueError::NoProcessor(queue.to_string()))?;

        match self.inner.store.claim_next(queue, self.inner.config.lease).await? {
            Some(job) => Ok(Some(self.inner.execute(job, processor).await?)),
            None => Ok(None),
        }
    }

    /// Spawn the worker task.
    pub fn start(&self) -> QueueWorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));

        let join = tokio::spawn(worker_loop(self.inner.clone(), shutdown_rx, stats.clone()));

        QueueWorkerHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }
}

impl QueueInner {
    fn processor(&self, queue: &str) -> Option<Arc<dyn JobProcessor>> {
        self.processors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue)
            .cloned()
    }

    fn queue_names(&self) -> Vec<String> {
        self.processors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn completed_listeners(&self, queue: &str) -> Vec<CompletedListener> {
        self.completed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue)
            .cloned()
            .unwrap_or_default()
    }

    fn failed_listeners(&self, queue: &str) -> Vec<FailedListener> {
        self.failed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue)
            .cloned()
            .unwrap_or_default()
    }

    /// Run one claimed job and persist how it settled.
    ///
    /// Listeners fire only once the settled state is stored; if the store write
    /// fails the lease lapses and the job is delivered again. A write rejected
    /// because another worker took the job over fires nothing.
    async fn execute(
        self: &Arc<Self>,
        mut job: Job,
        processor: Arc<dyn JobProcessor>,
    ) -> Result<JobOutcome, QueueError> {
        if job.status == JobStatus::Failed {
            return Ok(self.report_abandoned(&job));
        }

        let started = Utc::now();
        debug!(queue = %job.queue, job_id = %job.id, attempt = job.attempt, "running job");

        let attempt = {
            let job = job.clone();
            tokio::spawn(async move { processor.process(&job).await }).await
        };
        let result = attempt.unwrap_or_else(|err| Err(crashed(err)));

        match result {
            Ok(value) => {
                job.mark_completed(value.clone(), started);
                if !self.settle(&job).await? {
                    return Ok(JobOutcome::LeaseLost);
                }

                debug!(queue = %job.queue, job_id = %job.id, attempt = job.attempt, "job completed");
                for listener in self.completed_listeners(&job.queue) {
                    listener(&job, &value);
                }
                Ok(JobOutcome::Completed)
            }
            Err(err) => {
                let retry = job.mark_failed(&err, started);
                if !self.settle(&job).await? {
                    return Ok(JobOutcome::LeaseLost);
                }

                match retry {
                    Some(delay) => {
                        warn!(
                            queue = %job.queue,
                            job_id = %job.id,
                            attempt = job.attempt,
                            max_attempts = job.options.max_attempts,
                            error_kind = err.kind(),
                            error = %err.report(),
                            retry_in_ms = delay.as_millis() as u64,
                            "job attempt failed, retrying"
                        );
                        self.wake_after(delay);
                        Ok(JobOutcome::Retrying(delay))
                    }
                    None => {
                        error!(
                            queue = %job.queue,
                            job_id = %job.id,
                            attempts = job.attempt,
                            error_kind = err.kind(),
                            error = %err.report(),
                            "job failed, no attempts left"
                        );
                        for listener in self.failed_listeners(&job.queue) {
                            listener(&job, &err);
                        }
                        Ok(JobOutcome::Failed)
                    }
                }
            }
        }
    }

    /// Store the settled job. `Ok(false)` when the attempt was superseded.
    async fn settle(&self, job: &Job) -> Result<bool, QueueError> {
        match self.store.update(job).await {
            Ok(()) => Ok(true),
            Err(JobStoreError::LeaseLost { job_id, attempt }) => {
                warn!(
                    queue = %job.queue,
                    job_id = %job_id,
                    attempt,
                    "lease lost before the attempt settled, result dropped"
                );
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// The store failed a job whose last attempt never settled.
    fn report_abandoned(&self, job: &Job) -> JobOutcome {
        let err = JobError::LeaseExpired { attempt: job.attempt };
        error!(
            queue = %job.queue,
            job_id = %job.id,
            attempts = job.attempt,
            error_kind = err.kind(),
            "job lease expired on its last attempt, giving up"
        );
        for listener in self.failed_listeners(&job.queue) {
            listener(job, &err);
        }
        JobOutcome::Failed
    }

    /// Wake the worker once a backoff delay has passed.
    fn wake_after(self: &Arc<Self>, delay: Duration) {
        let inner: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = inner.upgrade() {
                inner.wake.notify_one();
            }
        });
    }
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct QueueWorkerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl QueueWorkerHandle {
    /// Stop claiming new jobs and wait for in-flight ones to settle.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.join.await {
            error!(error = %err, "queue worker task ended abnormally");
        }
    }

    /// Get current worker statistics.
    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Turn a processor task that panicked or was cancelled into a job error.
fn crashed(err: JoinError) -> JobError {
    if !err.is_panic() {
        return JobError::Crashed("processor task was cancelled".to_string());
    }
    let panic = err.into_panic();
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic with a non-string payload".to_string());
    JobError::Crashed(message)
}

async fn worker_loop(
    inner: Arc<QueueInner>,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<WorkerStats>>,
) {
    let name = inner.config.name.clone();
    let permits = Arc::new(Semaphore::new(inner.config.concurrency.max(1)));
    let mut in_flight: JoinSet<()> = JoinSet::new();
    let started = Instant::now();

    info!(worker = %name, concurrency = inner.config.concurrency, "queue worker started");

    while !*shutdown.borrow() {
        stats.lock().unwrap_or_else(PoisonError::into_inner).uptime_secs =
            started.elapsed().as_secs();

        let mut claimed = false;
        'queues: for queue in inner.queue_names() {
            loop {
                let Ok(permit) = permits.clone().try_acquire_owned() else {
                    break 'queues;
                };
                let Some(processor) = inner.processor(&queue) else {
                    break;
                };

                let job = match inner.store.claim_next(&queue, inner.config.lease).await {
                    Ok(Some(job)) => job,
                    Ok(None) => break,
                    Err(err) => {
                        error!(worker = %name, queue = %queue, error = %err, "failed to claim job");
                        break;
                    }
                };
                claimed = true;

                debug!(worker = %name, queue = %queue, job_id = %job.id, "claimed job");
                let inner = inner.clone();
                let stats = stats.clone();
                in_flight.spawn(async move {
                    let _permit = permit;
                    let job_id = job.id;
                    let queue = job.queue.clone();

                    stats.lock().unwrap_or_else(PoisonError::into_inner).current_running += 1;
                    let outcome = inner.execute(job, processor).await;

                    let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
                    s.current_running = s.current_running.saturating_sub(1);
                    s.jobs_processed += 1;
                    match outcome {
                        Ok(JobOutcome::Completed) => s.jobs_completed += 1,
                        Ok(JobOutcome::Retrying(_)) => s.jobs_retried += 1,
                        Ok(JobOutcome::Failed) => s.jobs_failed += 1,
                        Ok(JobOutcome::LeaseLost) => {}
                        Err(err) => {
                            error!(queue = %queue, job_id = %job_id, error = %err, "failed to settle job");
                        }
                    }
                });
            }
        }

        if claimed {
            continue;
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = inner.wake.notified() => {}
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(err) = joined {
                    error!(worker = %name, error = %err, "job task panicked");
                }
            }
            _ = tokio::time::sleep(inner.config.poll_interval) => {}
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Err(err) = joined {
            error!(worker = %name, error = %err, "job task panicked");
        }
    }

    info!(worker = %name, "queue worker stopped");
}
