//! Durable background job queue with bounded retries and backoff.
//!
//! ## Components
//!
//! - `Job`: payload plus lifecycle (`waiting -> active -> completed | failed`)
//! - `JobStore`: persistence with atomic, lease-based claiming
//! - `JobQueue`: client used by producers, processors and listeners
//! - `QueueWorkerHandle`: controls the spawned worker task
//!
//! Delivery is at-least-once: a job whose worker dies is re-claimed once its
//! lease lapses, so processors must be idempotent.

pub mod queue;
pub mod store;
pub mod types;

#[cfg(feature = "redis")]
pub mod redis_store;

pub use queue::{
    FnProcessor, JobOutcome, JobProcessor, JobQueue, QueueConfig, QueueError, QueueWorkerHandle,
    WorkerStats,
};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{
    Backoff, BackoffStrategy, Job, JobAttemptRecord, JobError, JobId, JobOptions, JobStatus,
};

#[cfg(feature = "redis")]
pub use redis_store::RedisJobStore;
