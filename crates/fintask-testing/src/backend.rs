use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fintask_core::{
    retry_decision, BackendError, Job, JobState, QueueBackend, QueueStats, RetryDecision,
    RetryParams, WorkerRecord, WorkerStats, WorkerStatus,
};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::Mutex;

struct State {
    jobs: HashMap<String, Job>,
    workers: HashMap<String, WorkerRecord>,
}

/// A single-process, `tokio::sync::Mutex`-guarded [`QueueBackend`]. Every
/// operation takes the same lock, so at-most-one-worker-per-job is
/// trivially satisfied — this crate exists to test the *policy* (retry,
/// ordering, eligibility, reaping) shared across all four real adapters,
/// not to test lock-free concurrency.
pub struct InMemoryBackend {
    state: Mutex<State>,
    retry: RetryParams,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                jobs: HashMap::new(),
                workers: HashMap::new(),
            }),
            retry: RetryParams::default(),
        }
    }

    pub fn with_retry_params(retry: RetryParams) -> Self {
        Self {
            state: Mutex::new(State {
                jobs: HashMap::new(),
                workers: HashMap::new(),
            }),
            retry,
        }
    }

    /// Test helper: snapshot a job by id without going through the trait.
    pub async fn get(&self, job_id: &str) -> Option<Job> {
        self.state.lock().await.jobs.get(job_id).cloned()
    }

    /// Test helper: number of jobs currently stored.
    pub async fn job_count(&self) -> usize {
        self.state.lock().await.jobs.len()
    }

    fn apply_retry_rule(job: &mut Job, params: &RetryParams, now: DateTime<Utc>, terminal: JobState) {
        match retry_decision(job.attempts, job.max_attempts, params) {
            RetryDecision::Requeue { delay_secs } => {
                job.state = JobState::Pending;
                job.claimed_by = None;
                job.claim_deadline = None;
                job.scheduled_at = Some(now + chrono::Duration::seconds(delay_secs as i64));
            }
            RetryDecision::Terminal => {
                job.state = terminal;
                job.claimed_by = None;
                job.claim_deadline = None;
            }
        }
    }
}

#[async_trait]
impl QueueBackend for InMemoryBackend {
    async fn register_worker(&self, worker: WorkerRecord) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        state.workers.insert(worker.worker_id.clone(), worker);
        Ok(())
    }

    async fn update_worker_status(
        &self,
        worker_id: &str,
        status: WorkerStatus,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        let worker = state
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| BackendError::NotFound(format!("worker {worker_id}")))?;
        worker.status = status;
        Ok(())
    }

    async fn heartbeat(&self, worker_id: &str, now: DateTime<Utc>) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        let worker = state
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| BackendError::NotFound(format!("worker {worker_id}")))?;
        worker.last_heartbeat = now;
        Ok(())
    }

    async fn unregister_worker(&self, worker_id: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        let worker = state
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| BackendError::NotFound(format!("worker {worker_id}")))?;
        worker.status = WorkerStatus::Stopped;
        Ok(())
    }

    async fn enqueue(&self, job: Job) -> Result<String, BackendError> {
        let mut state = self.state.lock().await;
        let id = job.id.clone();
        state.jobs.insert(id.clone(), job);
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
        let mut state = self.state.lock().await;
        let empty: Vec<String> = Vec::new();

        let mut eligible: Vec<String> = state
            .jobs
            .values()
            .filter(|job| {
                let required = required_capabilities.get(&job.kind).unwrap_or(&empty);
                job.is_eligible_for(now, kinds, capabilities, required)
            })
            .map(|job| job.id.clone())
            .collect();

        eligible.sort_by(|a, b| {
            let ja = &state.jobs[a];
            let jb = &state.jobs[b];
            jb.priority
                .cmp(&ja.priority)
                .then_with(|| {
                    let sa = ja.scheduled_at.unwrap_or(DateTime::<Utc>::MIN_UTC);
                    let sb = jb.scheduled_at.unwrap_or(DateTime::<Utc>::MIN_UTC);
                    sa.cmp(&sb)
                })
                .then_with(|| ja.id.cmp(&jb.id))
        });

        let mut claimed = Vec::new();
        for id in eligible.into_iter().take(max_n as usize) {
            let job = state.jobs.get_mut(&id).expect("id came from jobs map");
            job.state = JobState::Claimed;
            job.claimed_by = Some(worker_id.to_string());
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn start(&self, worker_id: &str, job_id: &str, now: DateTime<Utc>) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| BackendError::NotFound(format!("job {job_id}")))?;
        if job.state != JobState::Claimed || job.claimed_by.as_deref() != Some(worker_id) {
            return Err(BackendError::StateConflict(format!(
                "job {job_id} is not Claimed by {worker_id}"
            )));
        }
        job.state = JobState::Running;
        job.started_at = Some(now);
        job.progress = 0;
        job.attempts += 1;
        Ok(())
    }

    async fn progress(
        &self,
        worker_id: &str,
        job_id: &str,
        pct: u8,
        message: Option<String>,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| BackendError::NotFound(format!("job {job_id}")))?;
        if job.state != JobState::Running || job.claimed_by.as_deref() != Some(worker_id) {
            return Err(BackendError::StateConflict(format!(
                "job {job_id} is not Running under {worker_id}"
            )));
        }
        job.progress = pct.min(100);
        if let Some(msg) = message {
            job.status_message = Some(msg);
        }
        Ok(())
    }

    async fn complete(
        &self,
        worker_id: &str,
        job_id: &str,
        result: Value,
        now: DateTime<Utc>,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| BackendError::NotFound(format!("job {job_id}")))?;
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
        Ok(())
    }

    async fn fail(
        &self,
        worker_id: &str,
        job_id: &str,
        error_text: &str,
        now: DateTime<Utc>,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| BackendError::NotFound(format!("job {job_id}")))?;
        if job.state != JobState::Running || job.claimed_by.as_deref() != Some(worker_id) {
            return Err(BackendError::StateConflict(format!(
                "job {job_id} is not Running under {worker_id}"
            )));
        }
        job.last_error = Some(error_text.to_string());
        job.failed_at = Some(now);
        Self::apply_retry_rule(job, &self.retry, now, JobState::Failed);
        Ok(())
    }

    async fn timeout(&self, worker_id: &str, job_id: &str, now: DateTime<Utc>) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| BackendError::NotFound(format!("job {job_id}")))?;
        if job.state != JobState::Running || job.claimed_by.as_deref() != Some(worker_id) {
            return Err(BackendError::StateConflict(format!(
                "job {job_id} is not Running under {worker_id}"
            )));
        }
        job.last_error = Some("job execution timed out".to_string());
        job.failed_at = Some(now);
        Self::apply_retry_rule(job, &self.retry, now, JobState::TimedOut);
        Ok(())
    }

    async fn reap_stale(
        &self,
        now: DateTime<Utc>,
        stale_after: chrono::Duration,
    ) -> Result<u64, BackendError> {
        let mut state = self.state.lock().await;

        let stale_worker_ids: Vec<String> = state
            .workers
            .values()
            .filter(|w| w.status != WorkerStatus::Stopped && w.is_stale(now, stale_after))
            .map(|w| w.worker_id.clone())
            .collect();

        let mut reclaimed = 0u64;
        for worker_id in &stale_worker_ids {
            if let Some(worker) = state.workers.get_mut(worker_id) {
                worker.status = WorkerStatus::Stopped;
            }
            for job in state.jobs.values_mut() {
                if job.claimed_by.as_deref() != Some(worker_id.as_str()) {
                    continue;
                }
                if !matches!(job.state, JobState::Claimed | JobState::Running) {
                    continue;
                }
                job.last_error = Some("worker lost".to_string());
                job.failed_at = Some(now);
                Self::apply_retry_rule(job, &self.retry, now, JobState::Failed);
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn query_stats(&self, _window: Option<chrono::Duration>) -> Result<QueueStats, BackendError> {
        let state = self.state.lock().await;
        let mut stats = QueueStats::default();
        for job in state.jobs.values() {
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
        stats.workers = state
            .workers
            .values()
            .map(|w| WorkerStats {
                worker_id: w.worker_id.clone(),
                status: w.status,
                current_running: w.current_running,
                max_concurrent: w.max_concurrent,
                last_heartbeat: w.last_heartbeat,
            })
            .collect();
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fintask_core::Priority;

    fn empty_caps() -> HashMap<String, Vec<String>> {
        HashMap::new()
    }

    #[tokio::test]
    async fn at_most_one_worker_claims_a_job() {
        let backend = InMemoryBackend::new();
        let job = Job::new("price_update", Priority::Normal, serde_json::json!({}));
        let id = backend.enqueue(job).await.unwrap();

        let kinds = vec!["price_update".to_string()];
        let now = Utc::now();
        let c1 = backend
            .claim("w1", &kinds, &[], &empty_caps(), 10, now)
            .await
            .unwrap();
        let c2 = backend
            .claim("w2", &kinds, &[], &empty_caps(), 10, now)
            .await
            .unwrap();

        assert_eq!(c1.iter().map(|j| &j.id).collect::<Vec<_>>(), vec![&id]);
        assert!(c2.is_empty());
    }

    #[tokio::test]
    async fn claim_orders_by_priority_then_scheduled_at_then_id() {
        let backend = InMemoryBackend::new();
        let now = Utc::now();
        let low = Job::new("k", Priority::Low, serde_json::json!({}));
        let normal = Job::new("k", Priority::Normal, serde_json::json!({}));
        let high = Job::new("k", Priority::High, serde_json::json!({}));
        backend.enqueue(low.clone()).await.unwrap();
        backend.enqueue(normal.clone()).await.unwrap();
        backend.enqueue(high.clone()).await.unwrap();

        let claimed = backend
            .claim("w1", &["k".to_string()], &[], &empty_caps(), 10, now)
            .await
            .unwrap();

        assert_eq!(claimed[0].id, high.id);
        assert_eq!(claimed[1].id, normal.id);
        assert_eq!(claimed[2].id, low.id);
    }

    #[tokio::test]
    async fn round_trip_enqueue_claim_start_complete() {
        let backend = InMemoryBackend::new();
        let job = Job::new("price_update", Priority::Normal, serde_json::json!({"x": 1}));
        let id = backend.enqueue(job).await.unwrap();
        let now = Utc::now();

        let claimed = backend
            .claim("w1", &["price_update".to_string()], &[], &empty_caps(), 1, now)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        backend.start("w1", &id, now).await.unwrap();
        backend
            .complete("w1", &id, serde_json::json!({"ok": true}), now)
            .await
            .unwrap();

        let stored = backend.get(&id).await.unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.result, Some(serde_json::json!({"ok": true})));
    }

    #[tokio::test]
    async fn retry_bound_reaches_failed_after_exactly_max_attempts() {
        let backend = InMemoryBackend::with_retry_params(RetryParams {
            jitter_fraction: 0.0,
            ..RetryParams::default()
        });
        let job = Job::new("price_update", Priority::Normal, serde_json::json!({}))
            .with_max_attempts(2);
        let id = backend.enqueue(job).await.unwrap();

        for _ in 0..2 {
            let now = Utc::now();
            let claimed = backend
                .claim("w1", &["price_update".to_string()], &[], &empty_caps(), 1, now)
                .await
                .unwrap();
            assert_eq!(claimed.len(), 1, "job should be claimable for every attempt");
            backend.start("w1", &id, now).await.unwrap();
            backend.fail("w1", &id, "transient", now).await.unwrap();
        }

        let stored = backend.get(&id).await.unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(stored.attempts, 2);
        assert!(stored.last_error.is_some());

        let now = Utc::now();
        let claimed = backend
            .claim("w1", &["price_update".to_string()], &[], &empty_caps(), 1, now)
            .await
            .unwrap();
        assert!(claimed.is_empty(), "exhausted job must not be claimable again");
    }

    #[tokio::test]
    async fn reaper_is_idempotent() {
        let backend = InMemoryBackend::new();
        let worker = WorkerRecord::new("w1", "host-a", 1, vec!["k".into()], vec![], 1);
        backend.register_worker(worker).await.unwrap();
        let job = Job::new("k", Priority::Normal, serde_json::json!({}));
        let id = backend.enqueue(job).await.unwrap();
        let now = Utc::now();
        backend
            .claim("w1", &["k".to_string()], &[], &empty_caps(), 1, now)
            .await
            .unwrap();
        backend.start("w1", &id, now).await.unwrap();

        // make the worker stale
        backend.heartbeat("w1", now - chrono::Duration::minutes(10)).await.unwrap();

        let first = backend.reap_stale(now, chrono::Duration::minutes(5)).await.unwrap();
        let second = backend.reap_stale(now, chrono::Duration::minutes(5)).await.unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 0, "second pass reclaims nothing new");

        let stored = backend.get(&id).await.unwrap();
        assert_eq!(stored.state, JobState::Pending);
        assert_eq!(stored.attempts, 1);
        assert!(stored.claimed_by.is_none());
    }

    #[tokio::test]
    async fn progress_is_clamped_and_reset_on_retry() {
        let backend = InMemoryBackend::with_retry_params(RetryParams {
            jitter_fraction: 0.0,
            ..RetryParams::default()
        });
        let job = Job::new("k", Priority::Normal, serde_json::json!({})).with_max_attempts(2);
        let id = backend.enqueue(job).await.unwrap();
        let now = Utc::now();

        backend
            .claim("w1", &["k".to_string()], &[], &empty_caps(), 1, now)
            .await
            .unwrap();
        backend.start("w1", &id, now).await.unwrap();
        backend.progress("w1", &id, 250, None).await.unwrap();
        assert_eq!(backend.get(&id).await.unwrap().progress, 100);

        backend.fail("w1", &id, "retry me", now).await.unwrap();
        let retried_at = backend.get(&id).await.unwrap().scheduled_at.unwrap();
        assert!(retried_at > now);

        let claimed = backend
            .claim("w1", &["k".to_string()], &[], &empty_caps(), 1, retried_at)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        backend.start("w1", &id, retried_at).await.unwrap();
        assert_eq!(backend.get(&id).await.unwrap().progress, 0);
    }
}
