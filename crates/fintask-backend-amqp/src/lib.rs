//! AMQP (RabbitMQ) implementation of the FinTask [`QueueBackend`].
//!
//! # Wire layout
//!
//! - Topic exchange `jobs`, routing key `jobs.{priority}.{kind}`, one
//!   durable queue per `(priority, kind)` bound to that key — claim is a
//!   manual-ack `basic_get` against the queue for the worker's kinds.
//! - Fanout exchange `workers` + durable queue `worker_status`, for
//!   worker lifecycle events (register/heartbeat/unregister), published
//!   for any downstream observer but not consumed by this adapter itself.
//!
//! AMQP has no native query surface, so unlike the SQL/KV adapters this
//! one keeps the authoritative job/worker records in an in-process
//! [`DashMap`] and uses the broker purely for the claim hand-off and
//! status fan-out. That makes `query_stats`/`heartbeat`/etc. process-local
//! — correct for a single worker-pool process talking to one broker, not
//! a substitute for a shared store across independent processes.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use fintask_core::{
    retry_decision, BackendError, Job, JobState, Priority, QueueBackend, QueueStats, RetryDecision,
    RetryParams, WorkerRecord, WorkerStats, WorkerStatus,
};
use lapin::{
    options::{
        BasicAckOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, ExchangeKind,
};
use serde_json::Value;
use std::collections::HashMap;

const JOBS_EXCHANGE: &str = "jobs";
const WORKERS_EXCHANGE: &str = "workers";
const WORKER_STATUS_QUEUE: &str = "worker_status";

fn map_lapin_err(err: lapin::Error) -> BackendError {
    BackendError::Unavailable(err.into())
}

fn priority_tier(priority: Priority) -> &'static str {
    match priority {
        Priority::High => "high",
        Priority::Normal => "normal",
        Priority::Low => "low",
    }
}

fn routing_key(kind: &str, priority: Priority) -> String {
    format!("jobs.{}.{kind}", priority_tier(priority))
}

/// AMQP queue backend. Declares topology lazily as kinds/priorities are
/// first seen. Cheap to clone: wraps a [`Channel`] and shared caches.
#[derive(Clone)]
pub struct AmqpBackend {
    channel: Channel,
    jobs: DashMap<String, Job>,
    workers: DashMap<String, WorkerRecord>,
    wjobs: DashMap<String, Vec<String>>,
    declared_queues: DashSet<String>,
    retry: RetryParams,
}

impl AmqpBackend {
    pub async fn new(channel: Channel) -> Result<Self, BackendError> {
        let backend = Self {
            channel,
            jobs: DashMap::new(),
            workers: DashMap::new(),
            wjobs: DashMap::new(),
            declared_queues: DashSet::new(),
            retry: RetryParams::default(),
        };
        backend.declare_topology().await?;
        Ok(backend)
    }

    pub fn with_retry_params(mut self, retry: RetryParams) -> Self {
        self.retry = retry;
        self
    }

    async fn declare_topology(&self) -> Result<(), BackendError> {
        self.channel
            .exchange_declare(
                JOBS_EXCHANGE,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_lapin_err)?;

        self.channel
            .exchange_declare(
                WORKERS_EXCHANGE,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_lapin_err)?;

        self.channel
            .queue_declare(
                WORKER_STATUS_QUEUE,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_lapin_err)?;

        self.channel
            .queue_bind(
                WORKER_STATUS_QUEUE,
                WORKERS_EXCHANGE,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_lapin_err)?;

        Ok(())
    }

    async fn ensure_job_queue(&self, kind: &str, priority: Priority) -> Result<String, BackendError> {
        let key = routing_key(kind, priority);
        if self.declared_queues.contains(&key) {
            return Ok(key);
        }
        self.channel
            .queue_declare(
                &key,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_lapin_err)?;
        self.channel
            .queue_bind(
                &key,
                JOBS_EXCHANGE,
                &key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_lapin_err)?;
        self.declared_queues.insert(key.clone());
        Ok(key)
    }

    async fn publish_worker_event(&self, worker: &WorkerRecord) -> Result<(), BackendError> {
        let body = serde_json::to_vec(worker).map_err(|e| BackendError::Serialization(e.into()))?;
        self.channel
            .basic_publish(
                WORKERS_EXCHANGE,
                "",
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await
            .map_err(map_lapin_err)?
            .await
            .map_err(map_lapin_err)?;
        Ok(())
    }

    fn apply_retry_rule(&self, job: &mut Job, now: DateTime<Utc>, terminal: JobState) {
        match retry_decision(job.attempts, job.max_attempts, &self.retry) {
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
impl QueueBackend for AmqpBackend {
    async fn register_worker(&self, worker: WorkerRecord) -> Result<(), BackendError> {
        self.publish_worker_event(&worker).await?;
        self.workers.insert(worker.worker_id.clone(), worker);
        Ok(())
    }

    async fn update_worker_status(
        &self,
        worker_id: &str,
        status: WorkerStatus,
    ) -> Result<(), BackendError> {
        let mut worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| BackendError::NotFound(format!("worker {worker_id}")))?;
        worker.status = status;
        self.publish_worker_event(&worker).await?;
        Ok(())
    }

    async fn heartbeat(&self, worker_id: &str, now: DateTime<Utc>) -> Result<(), BackendError> {
        let mut worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| BackendError::NotFound(format!("worker {worker_id}")))?;
        worker.last_heartbeat = now;
        Ok(())
    }

    async fn unregister_worker(&self, worker_id: &str) -> Result<(), BackendError> {
        self.update_worker_status(worker_id, WorkerStatus::Stopped).await
    }

    async fn enqueue(&self, job: Job) -> Result<String, BackendError> {
        let id = job.id.clone();
        self.ensure_job_queue(&job.kind, job.priority).await?;
        let key = routing_key(&job.kind, job.priority);
        let body = serde_json::to_vec(&job).map_err(|e| BackendError::Serialization(e.into()))?;
        self.channel
            .basic_publish(
                JOBS_EXCHANGE,
                &key,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await
            .map_err(map_lapin_err)?
            .await
            .map_err(map_lapin_err)?;
        self.jobs.insert(id.clone(), job);
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
                let queue = self.ensure_job_queue(kind, priority).await?;
                loop {
                    if claimed.len() >= max_n as usize {
                        break;
                    }
                    let Some(delivery) = self
                        .channel
                        .basic_get(&queue, BasicGetOptions { no_ack: false })
                        .await
                        .map_err(map_lapin_err)?
                    else {
                        break;
                    };

                    let job: Job = serde_json::from_slice(&delivery.data)
                        .map_err(|e| BackendError::Serialization(e.into()))?;
                    let required = required_capabilities.get(&job.kind).unwrap_or(&empty);
                    let eligible = job.is_eligible_for(now, kinds, capabilities, required);

                    if eligible {
                        delivery
                            .ack(BasicAckOptions::default())
                            .await
                            .map_err(map_lapin_err)?;
                        let mut claimed_job = job;
                        claimed_job.state = JobState::Claimed;
                        claimed_job.claimed_by = Some(worker_id.to_string());
                        self.jobs.insert(claimed_job.id.clone(), claimed_job.clone());
                        self.wjobs
                            .entry(worker_id.to_string())
                            .or_default()
                            .push(claimed_job.id.clone());
                        claimed.push(claimed_job);
                    } else {
                        // Not yet due, or a capability mismatch: requeue and
                        // move on rather than spin on the same message.
                        delivery
                            .nack(BasicNackOptions {
                                requeue: true,
                                ..Default::default()
                            })
                            .await
                            .map_err(map_lapin_err)?;
                        break;
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
        Ok(claimed)
    }

    async fn start(&self, worker_id: &str, job_id: &str, now: DateTime<Utc>) -> Result<(), BackendError> {
        let mut job = self
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
        let mut job = self
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
        drop(job);
        if let Some(mut list) = self.wjobs.get_mut(worker_id) {
            list.retain(|id| id != job_id);
        }
        Ok(())
    }

    async fn fail(
        &self,
        worker_id: &str,
        job_id: &str,
        error_text: &str,
        now: DateTime<Utc>,
    ) -> Result<(), BackendError> {
        let mut job = self
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
        let requeued = job.state == JobState::Pending;
        let job_snapshot = job.clone();
        drop(job);
        if requeued {
            self.ensure_job_queue(&job_snapshot.kind, job_snapshot.priority).await?;
            let key = routing_key(&job_snapshot.kind, job_snapshot.priority);
            let body = serde_json::to_vec(&job_snapshot).map_err(|e| BackendError::Serialization(e.into()))?;
            self.channel
                .basic_publish(
                    JOBS_EXCHANGE,
                    &key,
                    BasicPublishOptions::default(),
                    &body,
                    BasicProperties::default().with_delivery_mode(2),
                )
                .await
                .map_err(map_lapin_err)?
                .await
                .map_err(map_lapin_err)?;
        }
        if let Some(mut list) = self.wjobs.get_mut(worker_id) {
            list.retain(|id| id != job_id);
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
            .workers
            .iter()
            .filter(|entry| entry.status != WorkerStatus::Stopped && entry.is_stale(now, stale_after))
            .map(|entry| entry.worker_id.clone())
            .collect();

        let mut reclaimed = 0u64;
        for worker_id in &stale_worker_ids {
            if let Some(mut worker) = self.workers.get_mut(worker_id) {
                worker.status = WorkerStatus::Stopped;
            }
            let job_ids = self.wjobs.remove(worker_id).map(|(_, v)| v).unwrap_or_default();
            for job_id in job_ids {
                let Some(mut job) = self.jobs.get_mut(&job_id) else { continue };
                if !matches!(job.state, JobState::Claimed | JobState::Running) {
                    continue;
                }
                job.last_error = Some("worker lost".to_string());
                job.failed_at = Some(now);
                self.apply_retry_rule(&mut job, now, JobState::Failed);
                let requeued = job.state == JobState::Pending;
                let snapshot = job.clone();
                drop(job);
                if requeued {
                    self.ensure_job_queue(&snapshot.kind, snapshot.priority).await?;
                    let key = routing_key(&snapshot.kind, snapshot.priority);
                    let body =
                        serde_json::to_vec(&snapshot).map_err(|e| BackendError::Serialization(e.into()))?;
                    self.channel
                        .basic_publish(
                            JOBS_EXCHANGE,
                            &key,
                            BasicPublishOptions::default(),
                            &body,
                            BasicProperties::default().with_delivery_mode(2),
                        )
                        .await
                        .map_err(map_lapin_err)?
                        .await
                        .map_err(map_lapin_err)?;
                }
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn query_stats(&self, window: Option<chrono::Duration>) -> Result<QueueStats, BackendError> {
        let since = window.map(|w| Utc::now() - w);
        let mut stats = QueueStats::default();
        for entry in self.jobs.iter() {
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
        for entry in self.workers.iter() {
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
    fn routing_key_encodes_priority_tier_and_kind() {
        assert_eq!(routing_key("price_update", Priority::High), "jobs.high.price_update");
        assert_eq!(routing_key("price_update", Priority::Low), "jobs.low.price_update");
    }
}
