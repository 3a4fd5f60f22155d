//! Redis-compatible implementation of the FinTask [`QueueBackend`].
//!
//! # Layout
//!
//! - `job:{id}` — the whole [`Job`] as a JSON string.
//! - `queue:{kind}:{priority}` — a sorted set of pending job ids for that
//!   (kind, priority) tier, scored by `scheduled_at` (or enqueue time).
//! - `workers:{worker_id}` — the whole [`WorkerRecord`] as a JSON string.
//! - `active_workers` — a set of worker ids, for `reap_stale`/`query_stats`.
//! - `wjobs:{worker_id}` — a set of job ids currently owned by that worker.
//!
//! Claim is done with a single Lua script so that "pop from the sorted set
//! and flip the job to `claimed`" is atomic even under concurrent callers —
//! the two-step `ZRANGE` + `ZREM` pattern is a known race if done as
//! separate round trips.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::Pool;
use fintask_core::{
    retry_decision, BackendError, Job, JobState, Priority, QueueBackend, QueueStats, RetryDecision,
    RetryParams, WorkerRecord, WorkerStats, WorkerStatus,
};
use redis::AsyncCommands;
use serde_json::Value;
use std::collections::HashMap;

const CLAIM_SCRIPT: &str = r#"
local worker_id = ARGV[1]
local max_n = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local claimed = {}
for i, key in ipairs(KEYS) do
    if #claimed >= max_n then break end
    local remaining = max_n - #claimed
    local ids = redis.call('ZRANGEBYSCORE', key, '-inf', now, 'LIMIT', 0, remaining)
    for _, id in ipairs(ids) do
        if #claimed >= max_n then break end
        local raw = redis.call('GET', 'job:' .. id)
        if raw then
            local job = cjson.decode(raw)
            if job.state == 'pending' then
                job.state = 'claimed'
                job.claimed_by = worker_id
                redis.call('SET', 'job:' .. id, cjson.encode(job))
                redis.call('ZREM', key, id)
                redis.call('SADD', 'wjobs:' .. worker_id, id)
                table.insert(claimed, id)
            else
                redis.call('ZREM', key, id)
            end
        else
            redis.call('ZREM', key, id)
        end
    end
end
return claimed
"#;

fn map_redis_err(err: redis::RedisError) -> BackendError {
    BackendError::Unavailable(err.into())
}

fn map_pool_err(err: deadpool_redis::PoolError) -> BackendError {
    BackendError::Unavailable(err.into())
}

fn job_to_json(job: &Job) -> Result<String, BackendError> {
    serde_json::to_string(job).map_err(|e| BackendError::Serialization(e.into()))
}

fn job_from_json(raw: &str) -> Result<Job, BackendError> {
    serde_json::from_str(raw).map_err(|e| BackendError::Serialization(e.into()))
}

fn worker_to_json(worker: &WorkerRecord) -> Result<String, BackendError> {
    serde_json::to_string(worker).map_err(|e| BackendError::Serialization(e.into()))
}

fn worker_from_json(raw: &str) -> Result<WorkerRecord, BackendError> {
    serde_json::from_str(raw).map_err(|e| BackendError::Serialization(e.into()))
}

fn priority_tier(priority: Priority) -> &'static str {
    match priority {
        Priority::High => "high",
        Priority::Normal => "normal",
        Priority::Low => "low",
    }
}

fn queue_key(kind: &str, priority: Priority) -> String {
    format!("queue:{kind}:{}", priority_tier(priority))
}

fn job_key(id: &str) -> String {
    format!("job:{id}")
}

fn worker_key(id: &str) -> String {
    format!("workers:{id}")
}

fn wjobs_key(worker_id: &str) -> String {
    format!("wjobs:{worker_id}")
}

fn schedule_score(job: &Job) -> f64 {
    job.scheduled_at.unwrap_or_else(Utc::now).timestamp() as f64
}

/// Redis-compatible queue backend. Cheap to clone: wraps a connection pool.
#[derive(Clone)]
pub struct RedisBackend {
    pool: Pool,
    retry: RetryParams,
}

impl RedisBackend {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            retry: RetryParams::default(),
        }
    }

    pub fn with_retry_params(pool: Pool, retry: RetryParams) -> Self {
        Self { pool, retry }
    }

    async fn requeue_or_terminate(
        &self,
        conn: &mut deadpool_redis::Connection,
        job: &mut Job,
        now: DateTime<Utc>,
        terminal: JobState,
    ) -> Result<(), BackendError> {
        match retry_decision(job.attempts, job.max_attempts, &self.retry) {
            RetryDecision::Requeue { delay_secs } => {
                job.state = JobState::Pending;
                job.claimed_by = None;
                job.claim_deadline = None;
                job.scheduled_at = Some(now + chrono::Duration::seconds(delay_secs as i64));
                conn.set::<_, _, ()>(job_key(&job.id), job_to_json(job)?)
                    .await
                    .map_err(map_redis_err)?;
                conn.zadd::<_, _, _, ()>(queue_key(&job.kind, job.priority), &job.id, schedule_score(job))
                    .await
                    .map_err(map_redis_err)?;
            }
            RetryDecision::Terminal => {
                job.state = terminal;
                job.claimed_by = None;
                job.claim_deadline = None;
                conn.set::<_, _, ()>(job_key(&job.id), job_to_json(job)?)
                    .await
                    .map_err(map_redis_err)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl QueueBackend for RedisBackend {
    async fn register_worker(&self, worker: WorkerRecord) -> Result<(), BackendError> {
        let mut conn = self.pool.get().await.map_err(map_pool_err)?;
        conn.set::<_, _, ()>(worker_key(&worker.worker_id), worker_to_json(&worker)?)
            .await
            .map_err(map_redis_err)?;
        conn.sadd::<_, _, ()>("active_workers", &worker.worker_id)
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    async fn update_worker_status(
        &self,
        worker_id: &str,
        status: WorkerStatus,
    ) -> Result<(), BackendError> {
        let mut conn = self.pool.get().await.map_err(map_pool_err)?;
        let raw: Option<String> = conn.get(worker_key(worker_id)).await.map_err(map_redis_err)?;
        let raw = raw.ok_or_else(|| BackendError::NotFound(format!("worker {worker_id}")))?;
        let mut worker = worker_from_json(&raw)?;
        worker.status = status;
        conn.set::<_, _, ()>(worker_key(worker_id), worker_to_json(&worker)?)
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    async fn heartbeat(&self, worker_id: &str, now: DateTime<Utc>) -> Result<(), BackendError> {
        let mut conn = self.pool.get().await.map_err(map_pool_err)?;
        let raw: Option<String> = conn.get(worker_key(worker_id)).await.map_err(map_redis_err)?;
        let raw = raw.ok_or_else(|| BackendError::NotFound(format!("worker {worker_id}")))?;
        let mut worker = worker_from_json(&raw)?;
        worker.last_heartbeat = now;
        conn.set::<_, _, ()>(worker_key(worker_id), worker_to_json(&worker)?)
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    async fn unregister_worker(&self, worker_id: &str) -> Result<(), BackendError> {
        self.update_worker_status(worker_id, WorkerStatus::Stopped).await
    }

    async fn enqueue(&self, job: Job) -> Result<String, BackendError> {
        let mut conn = self.pool.get().await.map_err(map_pool_err)?;
        let id = job.id.clone();
        conn.set::<_, _, ()>(job_key(&id), job_to_json(&job)?)
            .await
            .map_err(map_redis_err)?;
        if job.state == JobState::Pending {
            conn.zadd::<_, _, _, ()>(queue_key(&job.kind, job.priority), &id, schedule_score(&job))
                .await
                .map_err(map_redis_err)?;
        }
        Ok(id)
    }

    async fn claim(
        &self,
        worker_id: &str,
        kinds: &[String],
        capabilities: &[String],
        required_capabilities: &HashMap<String, Vec<String>>,
        max_n: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, BackendError> {
        let mut conn = self.pool.get().await.map_err(map_pool_err)?;

        // Priority tiers first, so claim order is globally priority-major
        // even though several kinds' keys are interleaved within a tier.
        let mut keys = Vec::new();
        for priority in [Priority::High, Priority::Normal, Priority::Low] {
            for kind in kinds {
                keys.push(queue_key(kind, priority));
            }
        }

        // Overfetch since capability filtering happens client-side.
        let overfetch = (max_n as i64) * 4;
        let claimed_ids: Vec<String> = redis::Script::new(CLAIM_SCRIPT)
            .key(keys)
            .arg(worker_id)
            .arg(overfetch)
            .arg(now.timestamp())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_err)?;

        // The Lua script's `claimed_ids` come back ordered by `KEYS`, i.e.
        // priority-tier-major then kind-major within a tier — not globally
        // by `scheduled_at` across kinds sharing a tier. Decode every
        // overfetched job and sort into true claim order *before* deciding
        // which to keep, mirroring the sort-then-take order in
        // `fintask-testing`'s in-memory backend.
        let mut candidates = Vec::with_capacity(claimed_ids.len());
        for id in claimed_ids {
            let raw: Option<String> = conn.get(job_key(&id)).await.map_err(map_redis_err)?;
            let Some(raw) = raw else { continue };
            candidates.push(job_from_json(&raw)?);
        }
        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| {
                    let sa = a.scheduled_at.unwrap_or(DateTime::<Utc>::MIN_UTC);
                    let sb = b.scheduled_at.unwrap_or(DateTime::<Utc>::MIN_UTC);
                    sa.cmp(&sb)
                })
                .then_with(|| a.id.cmp(&b.id))
        });

        let empty: Vec<String> = Vec::new();
        let mut claimed = Vec::with_capacity(max_n as usize);
        for mut job in candidates {
            let required = required_capabilities.get(&job.kind).unwrap_or(&empty);
            let has_capabilities = required
                .iter()
                .all(|tag| capabilities.iter().any(|c| c == tag));

            if has_capabilities && claimed.len() < max_n as usize {
                claimed.push(job);
            } else {
                job.state = JobState::Pending;
                job.claimed_by = None;
                conn.set::<_, _, ()>(job_key(&job.id), job_to_json(&job)?)
                    .await
                    .map_err(map_redis_err)?;
                conn.zadd::<_, _, _, ()>(queue_key(&job.kind, job.priority), &job.id, schedule_score(&job))
                    .await
                    .map_err(map_redis_err)?;
                conn.srem::<_, _, ()>(wjobs_key(worker_id), &job.id)
                    .await
                    .map_err(map_redis_err)?;
            }
        }
        Ok(claimed)
    }

    async fn start(&self, worker_id: &str, job_id: &str, now: DateTime<Utc>) -> Result<(), BackendError> {
        let mut conn = self.pool.get().await.map_err(map_pool_err)?;
        let raw: Option<String> = conn.get(job_key(job_id)).await.map_err(map_redis_err)?;
        let raw = raw.ok_or_else(|| BackendError::NotFound(format!("job {job_id}")))?;
        let mut job = job_from_json(&raw)?;
        if job.state != JobState::Claimed || job.claimed_by.as_deref() != Some(worker_id) {
            return Err(BackendError::StateConflict(format!(
                "job {job_id} is not Claimed by {worker_id}"
            )));
        }
        job.state = JobState::Running;
        job.started_at = Some(now);
        job.progress = 0;
        job.attempts += 1;
        conn.set::<_, _, ()>(job_key(job_id), job_to_json(&job)?)
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    async fn progress(
        &self,
        worker_id: &str,
        job_id: &str,
        pct: u8,
        message: Option<String>,
    ) -> Result<(), BackendError> {
        let mut conn = self.pool.get().await.map_err(map_pool_err)?;
        let raw: Option<String> = conn.get(job_key(job_id)).await.map_err(map_redis_err)?;
        let raw = raw.ok_or_else(|| BackendError::NotFound(format!("job {job_id}")))?;
        let mut job = job_from_json(&raw)?;
        if job.state != JobState::Running || job.claimed_by.as_deref() != Some(worker_id) {
            return Err(BackendError::StateConflict(format!(
                "job {job_id} is not Running under {worker_id}"
            )));
        }
        job.progress = pct.min(100);
        if let Some(msg) = message {
            job.status_message = Some(msg);
        }
        conn.set::<_, _, ()>(job_key(job_id), job_to_json(&job)?)
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    async fn complete(
        &self,
        worker_id: &str,
        job_id: &str,
        result: Value,
        now: DateTime<Utc>,
    ) -> Result<(), BackendError> {
        let mut conn = self.pool.get().await.map_err(map_pool_err)?;
        let raw: Option<String> = conn.get(job_key(job_id)).await.map_err(map_redis_err)?;
        let raw = raw.ok_or_else(|| BackendError::NotFound(format!("job {job_id}")))?;
        let mut job = job_from_json(&raw)?;
        if job.state != JobState::Running || job.claimed_by.as_deref() != Some(worker_id) {
            return Err(BackendError::StateConflict(format!(
                "job {job_id} is not Running under {worker_id}"
            )));
        }
        job.state = JobState::Completed;
        job.completed_at = Some(now);
        job.result = Some(result);
        job.progress = 100;
        job.claimed_by = None;
        conn.set::<_, _, ()>(job_key(job_id), job_to_json(&job)?)
            .await
            .map_err(map_redis_err)?;
        conn.srem::<_, _, ()>(wjobs_key(worker_id), job_id)
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    async fn fail(
        &self,
        worker_id: &str,
        job_id: &str,
        error_text: &str,
        now: DateTime<Utc>,
    ) -> Result<(), BackendError> {
        let mut conn = self.pool.get().await.map_err(map_pool_err)?;
        let raw: Option<String> = conn.get(job_key(job_id)).await.map_err(map_redis_err)?;
        let raw = raw.ok_or_else(|| BackendError::NotFound(format!("job {job_id}")))?;
        let mut job = job_from_json(&raw)?;
        if job.state != JobState::Running || job.claimed_by.as_deref() != Some(worker_id) {
            return Err(BackendError::StateConflict(format!(
                "job {job_id} is not Running under {worker_id}"
            )));
        }
        job.last_error = Some(error_text.to_string());
        job.failed_at = Some(now);
        self.requeue_or_terminate(&mut conn, &mut job, now, JobState::Failed).await?;
        conn.srem::<_, _, ()>(wjobs_key(worker_id), job_id)
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    async fn timeout(&self, worker_id: &str, job_id: &str, now: DateTime<Utc>) -> Result<(), BackendError> {
        let mut conn = self.pool.get().await.map_err(map_pool_err)?;
        let raw: Option<String> = conn.get(job_key(job_id)).await.map_err(map_redis_err)?;
        let raw = raw.ok_or_else(|| BackendError::NotFound(format!("job {job_id}")))?;
        let mut job = job_from_json(&raw)?;
        if job.state != JobState::Running || job.claimed_by.as_deref() != Some(worker_id) {
            return Err(BackendError::StateConflict(format!(
                "job {job_id} is not Running under {worker_id}"
            )));
        }
        job.last_error = Some("job execution timed out".to_string());
        job.failed_at = Some(now);
        self.requeue_or_terminate(&mut conn, &mut job, now, JobState::TimedOut).await?;
        conn.srem::<_, _, ()>(wjobs_key(worker_id), job_id)
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    async fn reap_stale(
        &self,
        now: DateTime<Utc>,
        stale_after: chrono::Duration,
    ) -> Result<u64, BackendError> {
        let mut conn = self.pool.get().await.map_err(map_pool_err)?;
        let worker_ids: Vec<String> = conn.smembers("active_workers").await.map_err(map_redis_err)?;

        let mut reclaimed = 0u64;
        for worker_id in worker_ids {
            let raw: Option<String> = conn.get(worker_key(&worker_id)).await.map_err(map_redis_err)?;
            let Some(raw) = raw else { continue };
            let mut worker = worker_from_json(&raw)?;
            if worker.status == WorkerStatus::Stopped || !worker.is_stale(now, stale_after) {
                continue;
            }
            worker.status = WorkerStatus::Stopped;
            conn.set::<_, _, ()>(worker_key(&worker_id), worker_to_json(&worker)?)
                .await
                .map_err(map_redis_err)?;

            let job_ids: Vec<String> = conn.smembers(wjobs_key(&worker_id)).await.map_err(map_redis_err)?;
            for job_id in job_ids {
                let raw: Option<String> = conn.get(job_key(&job_id)).await.map_err(map_redis_err)?;
                let Some(raw) = raw else { continue };
                let mut job = job_from_json(&raw)?;
                if !matches!(job.state, JobState::Claimed | JobState::Running) {
                    continue;
                }
                job.last_error = Some("worker lost".to_string());
                job.failed_at = Some(now);
                self.requeue_or_terminate(&mut conn, &mut job, now, JobState::Failed).await?;
                reclaimed += 1;
            }
            conn.del::<_, ()>(wjobs_key(&worker_id)).await.map_err(map_redis_err)?;
        }

        if reclaimed > 0 {
            tracing::warn!(reclaimed_jobs = reclaimed, "reaped stale workers and reclaimed their jobs");
        }
        Ok(reclaimed)
    }

    async fn query_stats(&self, window: Option<chrono::Duration>) -> Result<QueueStats, BackendError> {
        let mut conn = self.pool.get().await.map_err(map_pool_err)?;
        let since = window.map(|w| Utc::now() - w);

        let mut stats = QueueStats::default();
        let mut cursor: u64 = 0;
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg("job:*")
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await
                .map_err(map_redis_err)?;

            for key in keys {
                let raw: Option<String> = conn.get(&key).await.map_err(map_redis_err)?;
                let Some(raw) = raw else { continue };
                let job = job_from_json(&raw)?;
                if let Some(since) = since {
                    if job.started_at.map(|t| t < since).unwrap_or(false) {
                        continue;
                    }
                }
                match job.state {
                    JobState::Pending => stats.pending += 1,
                    JobState::Claimed => stats.claimed += 1,
                    JobState::Running => stats.running += 1,
                    JobState::Completed => stats.completed += 1,
                    JobState::Failed => stats.failed += 1,
                    JobState::TimedOut => stats.timed_out += 1,
                    JobState::Cancelled => stats.cancelled += 1,
                }
                *stats.by_kind.entry(job.kind.clone()).or_insert(0) += 1;
            }

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        let worker_ids: Vec<String> = conn.smembers("active_workers").await.map_err(map_redis_err)?;
        for worker_id in worker_ids {
            let raw: Option<String> = conn.get(worker_key(&worker_id)).await.map_err(map_redis_err)?;
            let Some(raw) = raw else { continue };
            let worker = worker_from_json(&raw)?;
            stats.workers.push(WorkerStats {
                worker_id: worker.worker_id,
                status: worker.status,
                current_running: worker.current_running,
                max_concurrent: worker.max_concurrent,
                last_heartbeat: worker.last_heartbeat,
            });
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fintask_core::Priority;

    #[test]
    fn queue_key_is_scoped_by_kind_and_priority_tier() {
        assert_eq!(queue_key("price_update", Priority::High), "queue:price_update:high");
        assert_eq!(queue_key("price_update", Priority::Low), "queue:price_update:low");
    }

    #[test]
    fn job_json_round_trips() {
        let job = Job::new("price_update", Priority::Normal, serde_json::json!({"a": 1}));
        let raw = job_to_json(&job).unwrap();
        let restored = job_from_json(&raw).unwrap();
        assert_eq!(restored.id, job.id);
        assert_eq!(restored.kind, job.kind);
        assert_eq!(restored.state, JobState::Pending);
    }

    #[test]
    fn schedule_score_defaults_to_now_when_unscheduled() {
        let job = Job::new("k", Priority::Normal, serde_json::json!({}));
        let before = Utc::now().timestamp() as f64;
        let score = schedule_score(&job);
        assert!(score >= before);
    }
}
