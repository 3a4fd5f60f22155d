use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::{BackendError, Job, QueueStats, WorkerRecord, WorkerStatus};

/// The durable queue contract every backend adapter implements. All
/// mutation of job/worker state goes through this
/// trait; it is the only process-wide shared mutable state in the system
/// and is expected to serialize its own writes internally
/// (e.g. `SELECT ... FOR UPDATE SKIP LOCKED` for SQL, a Lua script for
/// Redis, manual ack for AMQP, shared subscriptions for MQTT).
///
/// Implementations MUST guarantee:
/// - **Atomic claim**: a given `Pending` job becomes `Claimed` by exactly
///   one worker, even under concurrent `claim` calls.
/// - **Ordering**: within one `claim` response, jobs come back ordered
///   `(priority DESC, scheduled_at ASC, id ASC)`.
/// - **Eligibility**: see [`Job::is_eligible_for`](crate::Job::is_eligible_for).
#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn register_worker(&self, worker: WorkerRecord) -> Result<(), BackendError>;

    async fn update_worker_status(
        &self,
        worker_id: &str,
        status: WorkerStatus,
    ) -> Result<(), BackendError>;

    async fn heartbeat(&self, worker_id: &str, now: DateTime<Utc>) -> Result<(), BackendError>;

    /// Sets `status = Stopped`. The record is retained as history, never
    /// deleted.
    async fn unregister_worker(&self, worker_id: &str) -> Result<(), BackendError>;

    async fn enqueue(&self, job: Job) -> Result<String, BackendError>;

    /// Claims up to `max_n` eligible jobs for `worker_id`, transitioning
    /// each `Pending -> Claimed`. Returns jobs ordered
    /// `(priority DESC, scheduled_at ASC, id ASC)`.
    ///
    /// `required_capabilities` maps a job `kind` to the capability tags a
    /// handler for that kind requires (from
    /// [`HandlerRegistry::declared_capabilities`](crate::HandlerRegistry::declared_capabilities));
    /// kinds absent from the map require no capabilities. The backend
    /// stays policy-light by accepting this as data rather than knowing
    /// about handlers itself.
    async fn claim(
        &self,
        worker_id: &str,
        kinds: &[String],
        capabilities: &[String],
        required_capabilities: &std::collections::HashMap<String, Vec<String>>,
        max_n: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, BackendError>;

    /// Transitions `Claimed -> Running`, sets `started_at`, and increments
    /// `attempts` — this is the point at which an attempt is considered to
    /// have happened, so a crash between `claim` and `start` does not burn
    /// one.
    async fn start(&self, worker_id: &str, job_id: &str, now: DateTime<Utc>) -> Result<(), BackendError>;

    /// Updates `progress`/`status_message` without changing `state`.
    /// `pct` is clamped to `[0, 100]` by the backend.
    async fn progress(
        &self,
        worker_id: &str,
        job_id: &str,
        pct: u8,
        message: Option<String>,
    ) -> Result<(), BackendError>;

    /// Transitions `Running -> Completed`.
    async fn complete(
        &self,
        worker_id: &str,
        job_id: &str,
        result: Value,
        now: DateTime<Utc>,
    ) -> Result<(), BackendError>;

    /// Transitions `Running -> Failed` or `Running -> Pending` (retry),
    /// per the retry rule (`attempts` was already incremented by `start`).
    async fn fail(
        &self,
        worker_id: &str,
        job_id: &str,
        error_text: &str,
        now: DateTime<Utc>,
    ) -> Result<(), BackendError>;

    /// Transitions `Running -> TimedOut`, then the retry rule applies as
    /// in `fail`.
    async fn timeout(&self, worker_id: &str, job_id: &str, now: DateTime<Utc>) -> Result<(), BackendError>;

    /// For each worker with `last_heartbeat < now - stale_after`: mark it
    /// `Stopped`; for each job it still owns, clear ownership and apply
    /// the retry rule. Must be idempotent under repeated application with
    /// the same `now`.
    async fn reap_stale(
        &self,
        now: DateTime<Utc>,
        stale_after: chrono::Duration,
    ) -> Result<u64, BackendError>;

    async fn query_stats(&self, window: Option<chrono::Duration>) -> Result<QueueStats, BackendError>;
}
