//! MQTT pub/sub implementation of the FinTask [`QueueBackend`], via
//! `rumqttc`'s MQTT5 client.
//!
//! # Wire layout
//!
//! - `jobs/queue/{priority}/{kind}` (QoS ≥ 1) — job bodies. Workers claim
//!   by subscribing to the MQTT5 shared subscription
//!   `$share/fintask-workers/jobs/queue/{priority}/{kind}`, so the broker
//!   hands each published job to exactly one subscriber in the group —
//!   that is what makes claim "exclusive" here, not anything this adapter
//!   does locally.
//! - `workers/register` (retained), `workers/heartbeat/{id}`,
//!   `workers/unregister`, `jobs/assign/{workerId}`,
//!   `jobs/completed/{id}`, `jobs/failed/{id}` — published for downstream
//!   observers; this adapter does not subscribe to its own worker topics.
//!
//! Like [`fintask_backend_amqp`](../fintask_backend_amqp), there is no
//! native query surface in MQTT, so job/worker records live in an
//! in-process [`DashMap`], populated as this process's own claims and
//! local mutations happen. A background task drains the `EventLoop` and
//! feeds received job publishes into per-topic buffers that `claim` reads.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use fintask_core::{
    retry_decision, BackendError, Job, JobState, Priority, QueueBackend, QueueStats, RetryDecision,
    RetryParams, WorkerRecord, WorkerStats, WorkerStatus,
};
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, EventLoop};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

fn priority_tier(priority: Priority) -> &'static str {
    match priority {
        Priority::High => "high",
        Priority::Normal => "normal",
        Priority::Low => "low",
    }
}

fn job_topic(kind: &str, priority: Priority) -> String {
    format!("jobs/queue/{}/{kind}", priority_tier(priority))
}

fn shared_topic(kind: &str, priority: Priority) -> String {
    format!("$share/fintask-workers/{}", job_topic(kind, priority))
}

struct Shared {
    client: AsyncClient,
    incoming: DashMap<String, AsyncMutex<VecDeque<Job>>>,
    subscribed: DashSet<String>,
    jobs: DashMap<String, Job>,
    workers: DashMap<String, WorkerRecord>,
    wjobs: DashMap<String, Vec<String>>,
    retry: RetryParams,
}

/// MQTT pub/sub queue backend. Cheap to clone: wraps an [`Arc`] of shared
/// state driven by a background event-loop task.
#[derive(Clone)]
pub struct MqttBackend {
    shared: Arc<Shared>,
}

impl MqttBackend {
    /// Spawns the background task draining `eventloop` and returns a
    /// ready-to-use backend. `client` and `eventloop` come from the same
    /// `rumqttc::v5::AsyncClient::new(...)` call.
    pub fn new(client: AsyncClient, eventloop: EventLoop) -> Self {
        Self::with_retry_params(client, eventloop, RetryParams::default())
    }

    /// Same as [`Self::new`] but with explicit retry/backoff knobs. The
    /// background drain task holds its own `Arc` clone of the shared state
    /// from the moment it is spawned, so retry params can't be patched in
    /// afterwards via `Arc::get_mut` — they must be supplied up front.
    pub fn with_retry_params(client: AsyncClient, mut eventloop: EventLoop, retry: RetryParams) -> Self {
        let shared = Arc::new(Shared {
            client,
            incoming: DashMap::new(),
            subscribed: DashSet::new(),
            jobs: DashMap::new(),
            workers: DashMap::new(),
            wjobs: DashMap::new(),
            retry,
        });

        let task_shared = shared.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let topic = String::from_utf8_lossy(&publish.topic).to_string();
                        match serde_json::from_slice::<Job>(&publish.payload) {
                            Ok(job) => {
                                task_shared
                                    .incoming
                                    .entry(topic)
                                    .or_insert_with(|| AsyncMutex::new(VecDeque::new()))
                                    .lock()
                                    .await
                                    .push_back(job);
                            }
                            Err(err) => {
                                tracing::warn!(%topic, error = %err, "dropping malformed job payload");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, "mqtt event loop error, retrying");
                    }
                }
            }
        });

        Self { shared }
    }

    async fn ensure_subscribed(&self, kind: &str, priority: Priority) -> Result<(), BackendError> {
        let topic = job_topic(kind, priority);
        if self.shared.subscribed.contains(&topic) {
            return Ok(());
        }
        self.shared
            .client
            .subscribe(shared_topic(kind, priority), QoS::AtLeastOnce)
            .await
            .map_err(|e| BackendError::Unavailable(e.into()))?;
        self.shared.subscribed.insert(topic);
        Ok(())
    }

    async fn publish_job(&self, job: &Job) -> Result<(), BackendError> {
        let body = serde_json::to_vec(job).map_err(|e| BackendError::Serialization(e.into()))?;
        self.shared
            .client
            .publish(job_topic(&job.kind, job.priority), QoS::AtLeastOnce, false, body)
            .await
            .map_err(|e| BackendError::Unavailable(e.into()))?;
        Ok(())
    }

    async fn publish_assignment(&self, worker_id: &str, job: &Job) -> Result<(), BackendError> {
        let body = serde_json::to_vec(job).map_err(|e| BackendError::Serialization(e.into()))?;
        self.shared
            .client
            .publish(format!("jobs/assign/{worker_id}"), QoS::AtLeastOnce, false, body)
            .await
            .map_err(|e| BackendError::Unavailable(e.into()))?;
        Ok(())
    }

    async fn publish_worker_event(&self, topic: String, worker: &WorkerRecord, retain: bool) -> Result<(), BackendError> {
        let body = serde_json::to_vec(worker).map_err(|e| BackendError::Serialization(e.into()))?;
        self.shared
            .client
            .publish(topic, QoS::AtLeastOnce, retain, body)
            .await
            .map_err(|e| BackendError::Unavailable(e.into()))?;
        Ok(())
    }

    fn apply_retry_rule(&self, job: &mut Job, now: DateTime<Utc>, terminal: JobState) {
        match retry_decision(job.attempts, job.max_attempts, &self.shared.retry) {
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
impl QueueBackend for MqttBackend {
    async fn register_worker(&self, worker: WorkerRecord) -> Result<(), BackendError> {
        self.publish_worker_event("workers/register".to_string(), &worker, true).await?;
        self.shared.workers.insert(worker.worker_id.clone(), worker);
        Ok(())
    }

    async fn update_worker_status(
        &self,
        worker_id: &str,
        status: WorkerStatus,
    ) -> Result<(), BackendError> {
        let mut worker = self
            .shared
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| BackendError::NotFound(format!("worker {worker_id}")))?;
        worker.status = status;
        let snapshot = worker.clone();
        drop(worker);
        self.publish_worker_event("workers/register".to_string(), &snapshot, true).await?;
        Ok(())
    }

    async fn heartbeat(&self, worker_id: &str, now: DateTime<Utc>) -> Result<(), BackendError> {
        let mut worker = self
            .shared
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| BackendError::NotFound(format!("worker {worker_id}")))?;
        worker.last_heartbeat = now;
        let snapshot = worker.clone();
        drop(worker);
        self.publish_worker_event(format!("workers/heartbeat/{worker_id}"), &snapshot, false)
            .await
    }

    async fn unregister_worker(&self, worker_id: &str) -> Result<(), BackendError> {
        self.update_worker_status(worker_id, WorkerStatus::Stopped).await?;
        self.shared
            .client
            .publish(
                "workers/unregister",
                QoS::AtLeastOnce,
                false,
                worker_id.as_bytes().to_vec(),
            )
            .await
            .map_err(|e| BackendError::Unavailable(e.into()))?;
        Ok(())
    }

    async fn enqueue(&self, job: Job) -> Result<String, BackendError> {
        let id = job.id.clone();
        self.publish_job(&job).await?;
        self.shared.jobs.insert(id.clone(), job);
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
        let empty: Vec<String> = Vec::new();
        let mut claimed = Vec::new();

        'priorities: for priority in [Priority::High, Priority::Normal, Priority::Low] {
            for kind in kinds {
                if claimed.len() >= max_n as usize {
                    break 'priorities;
                }
                self.ensure_subscribed(kind, priority).await?;
                let topic = job_topic(kind, priority);
                let entry = self
                    .shared
                    .incoming
                    .entry(topic)
                    .or_insert_with(|| AsyncMutex::new(VecDeque::new()));
                let mut buf = entry.lock().await;
                let snapshot_len = buf.len();
                for _ in 0..snapshot_len {
                    if claimed.len() >= max_n as usize {
                        break;
                    }
                    let Some(job) = buf.pop_front() else { break };
                    let required = required_capabilities.get(&job.kind).unwrap_or(&empty);
                    if job.is_eligible_for(now, kinds, capabilities, required) {
                        let mut claimed_job = job;
                        claimed_job.state = JobState::Claimed;
                        claimed_job.claimed_by = Some(worker_id.to_string());
                        self.shared.jobs.insert(claimed_job.id.clone(), claimed_job.clone());
                        self.shared
                            .wjobs
                            .entry(worker_id.to_string())
                            .or_default()
                            .push(claimed_job.id.clone());
                        claimed.push(claimed_job);
                    } else {
                        drop(buf);
                        self.publish_job(&job).await?;
                        buf = self
                            .shared
                            .incoming
                            .get(&job_topic(kind, priority))
                            .expect("topic buffer exists")
                            .lock()
                            .await;
                    }
                }
            }
        }

        claimed.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| {
                    let sa = a.scheduled_at.unwrap_or(DateTime::<Utc>::MIN_UTC);
                    let sb = b.scheduled_at.unwrap_or(DateTime::<Utc>::MIN_UTC);
                    sa.cmp(&sb)
                })
                .then_with(|| a.id.cmp(&b.id))
        });

        for job in &claimed {
            self.publish_assignment(worker_id, job).await?;
        }

        Ok(claimed)
    }

    async fn start(&self, worker_id: &str, job_id: &str, now: DateTime<Utc>) -> Result<(), BackendError> {
        let mut job = self
            .shared
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
        let mut job = self
            .shared
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
        {
            let mut job = self
                .shared
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
        }
        if let Some(mut list) = self.shared.wjobs.get_mut(worker_id) {
            list.retain(|id| id != job_id);
        }
        self.shared
            .client
            .publish(format!("jobs/completed/{job_id}"), QoS::AtLeastOnce, false, Vec::new())
            .await
            .map_err(|e| BackendError::Unavailable(e.into()))?;
        Ok(())
    }

    async fn fail(
        &self,
        worker_id: &str,
        job_id: &str,
        error_text: &str,
        now: DateTime<Utc>,
    ) -> Result<(), BackendError> {
        let snapshot = {
            let mut job = self
                .shared
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
            self.apply_retry_rule(&mut job, now, JobState::Failed);
            job.clone()
        };
        if let Some(mut list) = self.shared.wjobs.get_mut(worker_id) {
            list.retain(|id| id != job_id);
        }
        if snapshot.state == JobState::Pending {
            self.publish_job(&snapshot).await?;
        } else {
            self.shared
                .client
                .publish(format!("jobs/failed/{job_id}"), QoS::AtLeastOnce, false, error_text.as_bytes().to_vec())
                .await
                .map_err(|e| BackendError::Unavailable(e.into()))?;
        }
        Ok(())
    }

    async fn timeout(&self, worker_id: &str, job_id: &str, now: DateTime<Utc>) -> Result<(), BackendError> {
        self.fail(worker_id, job_id, "job execution timed out", now).await
    }

    async fn reap_stale(
        &self,
        now: DateTime<Utc>,
        stale_after: chrono::Duration,
    ) -> Result<u64, BackendError> {
        let stale_worker_ids: Vec<String> = self
            .shared
            .workers
            .iter()
            .filter(|entry| entry.status != WorkerStatus::Stopped && entry.is_stale(now, stale_after))
            .map(|entry| entry.worker_id.clone())
            .collect();

        let mut reclaimed = 0u64;
        for worker_id in &stale_worker_ids {
            if let Some(mut worker) = self.shared.workers.get_mut(worker_id) {
                worker.status = WorkerStatus::Stopped;
            }
            let job_ids = self.shared.wjobs.remove(worker_id).map(|(_, v)| v).unwrap_or_default();
            for job_id in job_ids {
                let snapshot = {
                    let Some(mut job) = self.shared.jobs.get_mut(&job_id) else { continue };
                    if !matches!(job.state, JobState::Claimed | JobState::Running) {
                        continue;
                    }
                    job.last_error = Some("worker lost".to_string());
                    job.failed_at = Some(now);
                    self.apply_retry_rule(&mut job, now, JobState::Failed);
                    job.clone()
                };
                if snapshot.state == JobState::Pending {
                    self.publish_job(&snapshot).await?;
                }
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn query_stats(&self, window: Option<chrono::Duration>) -> Result<QueueStats, BackendError> {
        let since = window.map(|w| Utc::now() - w);
        let mut stats = QueueStats::default();
        for entry in self.shared.jobs.iter() {
            let job = entry.value();
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
        for entry in self.shared.workers.iter() {
            let worker = entry.value();
            stats.workers.push(WorkerStats {
                worker_id: worker.worker_id.clone(),
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

    #[test]
    fn job_topic_is_scoped_by_priority_tier_and_kind() {
        assert_eq!(job_topic("price_update", Priority::High), "jobs/queue/high/price_update");
    }

    #[test]
    fn shared_topic_wraps_the_job_topic_for_group_claim() {
        assert_eq!(
            shared_topic("price_update", Priority::Low),
            "$share/fintask-workers/jobs/queue/low/price_update"
        );
    }
}
