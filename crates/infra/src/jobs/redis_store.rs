//! Redis-backed job store (durable, shared by every worker process).
//!
//! ## Key layout
//!
//! - `{prefix}:job:{id}`: the job, as JSON
//! - `{prefix}:job:{id}:attempt`: the attempt the current claim runs; bumped
//!   by every claim, settling writes are fenced on it
//! - `{prefix}:{queue}:waiting`: sorted set, score = earliest run time (ms)
//! - `{prefix}:{queue}:active`: sorted set, score = lease expiry (ms)
//! - `{prefix}:{queue}:completed` / `:failed`: sorted set, score = settle time (ms)
//!
//! The sorted sets are the source of truth for claiming. A claim moves the id
//! into the active set inside a Lua script, so two workers never hold the same
//! job while its lease is live. Enqueue and settle writes are scripts too, so
//! a job is never stored outside a status set.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use tracing::{debug, instrument};

use super::store::{JobStats, JobStore, JobStoreError};
use super::types::{Job, JobId, JobStatus};

/// Default key prefix
const DEFAULT_PREFIX: &str = "taskboard:jobs";

/// Insert a new job and index it as waiting, or do nothing if the id exists.
const ENQUEUE_SCRIPT: &str = r#"
if not redis.call('SET', KEYS[1], ARGV[1], 'NX') then
  return 0
end
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[3])
return 1
"#;

/// Re-claim an expired active job, else take the oldest ready waiting one.
/// Bumping the attempt counter fences off the previous holder right away.
const CLAIM_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local id = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now, 'LIMIT', 0, 1)[1]
if id then
  redis.call('ZREM', KEYS[2], id)
else
  id = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', now, 'LIMIT', 0, 1)[1]
  if not id then
    return false
  end
  redis.call('ZREM', KEYS[1], id)
end
redis.call('ZADD', KEYS[2], now + tonumber(ARGV[2]), id)
redis.call('INCR', ARGV[3] .. id .. ':attempt')
return redis.call('GET', ARGV[3] .. id)
"#;

/// Store a settled job, only while it is active on the expected attempt.
///
/// KEYS: job, attempt counter, active set, target set, then every status set.
/// ARGV: expected attempt, job JSON, member, target score.
const SETTLE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 'missing'
end
if tonumber(redis.call('GET', KEYS[2])) ~= tonumber(ARGV[1])
  or not redis.call('ZSCORE', KEYS[3], ARGV[3]) then
  return 'stale'
end
redis.call('SET', KEYS[1], ARGV[2])
for i = 5, #KEYS do
  redis.call('ZREM', KEYS[i], ARGV[3])
end
redis.call('ZADD', KEYS[4], ARGV[4], ARGV[3])
return 'ok'
"#;

#[derive(Clone)]
pub struct RedisJobStore {
    conn: MultiplexedConnection,
    prefix: String,
    enqueue: redis::Script,
    claim: redis::Script,
    settle: redis::Script,
}

impl std::fmt::Debug for RedisJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisJobStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisJobStore {
    /// Connect using the default key prefix.
    pub async fn connect(redis_url: &str) -> Result<Self, JobStoreError> {
        Self::connect_with_prefix(redis_url, DEFAULT_PREFIX).await
    }

    pub async fn connect_with_prefix(
        redis_url: &str,
        prefix: impl Into<String>,
    ) -> Result<Self, JobStoreError> {
        let client = redis::Client::open(redis_url).map_err(storage)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(storage)?;

        Ok(Self {
            conn,
            prefix: prefix.into(),
            enqueue: redis::Script::new(ENQUEUE_SCRIPT),
            claim: redis::Script::new(CLAIM_SCRIPT),
            settle: redis::Script::new(SETTLE_SCRIPT),
        })
    }

    fn job_key_prefix(&self) -> String {
        format!("{}:job:", self.prefix)
    }

    fn job_key(&self, job_id: JobId) -> String {
        format!("{}{}", self.job_key_prefix(), job_id)
    }

    fn attempt_key(&self, job_id: JobId) -> String {
        format!("{}:attempt", self.job_key(job_id))
    }

    fn status_key(&self, queue: &str, status: JobStatus) -> String {
        format!("{}:{}:{}", self.prefix, queue, status.as_str())
    }

    async fn load(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.job_key(job_id))
            .query_async(&mut conn)
            .await
            .map_err(storage)?;

        raw.map(|raw| decode(&raw)).transpose()
    }

    /// Write the job and move its id into the sorted set matching its status.
    async fn save(&self, job: &Job) -> Result<(), JobStoreError> {
        let json = serde_json::to_string(job).map_err(storage)?;
        let member = job.id.to_string();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SET")
            .arg(self.job_key(job.id))
            .arg(json)
            .ignore();
        pipe.cmd("SET")
            .arg(self.attempt_key(job.id))
            .arg(job.attempt)
            .ignore();
        for status in JobStatus::ALL {
            pipe.cmd("ZREM")
                .arg(self.status_key(&job.queue, status))
                .arg(&member)
                .ignore();
        }
        pipe.cmd("ZADD")
            .arg(self.status_key(&job.queue, job.status))
            .arg(index_score(job))
            .arg(&member)
            .ignore();

        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn).await.map_err(storage)
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, queue = %job.queue))]
    async fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let json = serde_json::to_string(&job).map_err(storage)?;
        let mut conn = self.conn.clone();

        let created: bool = self
            .enqueue
            .key(self.job_key(job.id))
            .key(self.status_key(&job.queue, job.status))
            .arg(json)
            .arg(index_score(&job))
            .arg(job.id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(storage)?;
        if !created {
            return Err(JobStoreError::AlreadyExists(job.id));
        }

        debug!("job stored");
        Ok(job.id)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.load(job_id).await
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, attempt = job.attempt))]
    async fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let json = serde_json::to_string(job).map_err(storage)?;
        let mut conn = self.conn.clone();

        let mut invocation = self.settle.prepare_invoke();
        invocation
            .key(self.job_key(job.id))
            .key(self.attempt_key(job.id))
            .key(self.status_key(&job.queue, JobStatus::Active))
            .key(self.status_key(&job.queue, job.status));
        for status in JobStatus::ALL {
            invocation.key(self.status_key(&job.queue, status));
        }
        invocation
            .arg(job.attempt)
            .arg(json)
            .arg(job.id.to_string())
            .arg(index_score(job));

        let reply: String = invocation.invoke_async(&mut conn).await.map_err(storage)?;
        match reply.as_str() {
            "ok" => Ok(()),
            "missing" => Err(JobStoreError::NotFound(job.id)),
            _ => Err(JobStoreError::LeaseLost {
                job_id: job.id,
                attempt: job.attempt,
            }),
        }
    }

    #[instrument(skip(self))]
    async fn claim_next(&self, queue: &str, lease: Duration) -> Result<Option<Job>, JobStoreError> {
        let mut conn = self.conn.clone();
        let now = Utc::now().timestamp_millis();
        let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX / 2);

        let raw: Option<String> = self
            .claim
            .key(self.status_key(queue, JobStatus::Waiting))
            .key(self.status_key(queue, JobStatus::Active))
            .arg(now)
            .arg(lease_ms)
            .arg(self.job_key_prefix())
            .invoke_async(&mut conn)
            .await
            .map_err(storage)?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        // Only a lapsed lease leaves a claimed job active in its stored form
        let mut job = decode(&raw)?;
        if job.status == JobStatus::Active && !job.options.should_retry(job.attempt) {
            job.mark_abandoned();
        } else {
            job.mark_active(lease);
        }
        self.save(&job).await?;
        Ok(Some(job))
    }

    async fn list(
        &self,
        queue: &str,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let statuses: Vec<JobStatus> = match status {
            Some(status) => vec![status],
            None => JobStatus::ALL.to_vec(),
        };

        let mut conn = self.conn.clone();
        let mut ids: Vec<String> = Vec::new();
        for status in statuses {
            let page: Vec<String> = redis::cmd("ZRANGE")
                .arg(self.status_key(queue, status))
                .arg(0)
                .arg(limit as i64 - 1)
                .query_async(&mut conn)
                .await
                .map_err(storage)?;
            ids.extend(page);
        }
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids
            .iter()
            .map(|id| format!("{}{}", self.job_key_prefix(), id))
            .collect();
        let raws: Vec<Option<String>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(storage)?;

        let mut jobs = raws
            .into_iter()
            .flatten()
            .map(|raw| decode(&raw))
            .collect::<Result<Vec<_>, _>>()?;
        jobs.sort_by_key(|j| j.created_at);
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn retry_failed(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        let mut job = self
            .load(job_id)
            .await?
            .ok_or(JobStoreError::NotFound(job_id))?;

        if job.status != JobStatus::Failed {
            return Err(JobStoreError::InvalidState {
                job_id,
                status: job.status,
                expected: JobStatus::Failed,
            });
        }

        job.reset_for_retry();
        self.save(&job).await?;
        Ok(job)
    }

    async fn stats(&self, queue: &str) -> Result<JobStats, JobStoreError> {
        let mut pipe = redis::pipe();
        for status in JobStatus::ALL {
            pipe.cmd("ZCARD").arg(self.status_key(queue, status));
        }

        let mut conn = self.conn.clone();
        let counts: Vec<usize> = pipe.query_async(&mut conn).await.map_err(storage)?;

        let mut stats = JobStats::default();
        for (status, count) in JobStatus::ALL.into_iter().zip(counts) {
            stats.add(status, count);
        }
        Ok(stats)
    }
}

fn storage(err: impl std::fmt::Display) -> JobStoreError {
    JobStoreError::Storage(err.to_string())
}

fn decode(raw: &str) -> Result<Job, JobStoreError> {
    serde_json::from_str(raw).map_err(storage)
}

/// Sorted-set score for the job's current status.
fn index_score(job: &Job) -> i64 {
    let at: DateTime<Utc> = match job.status {
        JobStatus::Waiting => job.scheduled_at.unwrap_or(job.created_at),
        JobStatus::Active => job.lease_expires_at.unwrap_or(job.updated_at),
        JobStatus::Completed | JobStatus::Failed => job.updated_at,
    };
    at.timestamp_millis()
}
