//! PostgreSQL implementation of the FinTask [`QueueBackend`].
//!
//! # Features
//!
//! - Atomic claim via `FOR UPDATE SKIP LOCKED`
//! - Exponential backoff retry, shared with every other backend via
//!   [`fintask_core::retry_decision`]
//! - Worker heartbeats and stale-lease reclamation
//!
//! # Database Schema
//!
//! ```sql
//! -- state/status are plain TEXT rather than native Postgres enums: every
//! -- transition here binds the Rust-side string encoding as a query
//! -- parameter, and Postgres has no implicit text-to-enum assignment cast
//! -- for bound parameters (only for unknown-typed literals), so a native
//! -- enum column would reject these binds without an explicit `::enum`
//! -- cast at every call site.
//! CREATE TABLE jobs (
//!     id TEXT PRIMARY KEY,
//!     kind TEXT NOT NULL,
//!     priority SMALLINT NOT NULL,
//!     parameters JSONB NOT NULL,
//!     state TEXT NOT NULL DEFAULT 'pending'
//!         CHECK (state IN ('pending', 'claimed', 'running', 'completed', 'failed', 'timed_out', 'cancelled')),
//!     attempts INTEGER NOT NULL DEFAULT 0,
//!     max_attempts INTEGER NOT NULL DEFAULT 3,
//!     scheduled_at TIMESTAMPTZ,
//!     claimed_by TEXT,
//!     claim_deadline TIMESTAMPTZ,
//!     started_at TIMESTAMPTZ,
//!     completed_at TIMESTAMPTZ,
//!     failed_at TIMESTAMPTZ,
//!     result JSONB,
//!     last_error TEXT,
//!     progress SMALLINT NOT NULL DEFAULT 0,
//!     status_message TEXT
//! );
//!
//! CREATE INDEX idx_jobs_claimable ON jobs (kind, priority DESC, scheduled_at ASC, id ASC)
//!     WHERE state = 'pending';
//!
//! CREATE TABLE workers (
//!     worker_id TEXT PRIMARY KEY,
//!     name TEXT,
//!     host TEXT NOT NULL,
//!     pid INTEGER NOT NULL,
//!     kinds TEXT[] NOT NULL,
//!     capabilities TEXT[] NOT NULL,
//!     max_concurrent INTEGER NOT NULL,
//!     current_running INTEGER NOT NULL DEFAULT 0,
//!     status TEXT NOT NULL DEFAULT 'starting'
//!         CHECK (status IN ('starting', 'running', 'draining', 'stopped')),
//!     started_at TIMESTAMPTZ NOT NULL,
//!     last_heartbeat TIMESTAMPTZ NOT NULL
//! );
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use fintask_backend_sql::PgBackend;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/fintask").await?;
//! let backend = PgBackend::new(pool);
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fintask_core::{
    retry_decision, BackendError, Job, JobState, Priority, QueueBackend, QueueStats, RetryDecision,
    RetryParams, WorkerRecord, WorkerStats, WorkerStatus,
};
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::collections::HashMap;

fn map_sqlx_err(err: sqlx::Error) -> BackendError {
    match err {
        sqlx::Error::RowNotFound => BackendError::NotFound("row not found".to_string()),
        other => BackendError::Unavailable(other.into()),
    }
}

fn state_to_str(state: JobState) -> &'static str {
    match state {
        JobState::Pending => "pending",
        JobState::Claimed => "claimed",
        JobState::Running => "running",
        JobState::Completed => "completed",
        JobState::Failed => "failed",
        JobState::TimedOut => "timed_out",
        JobState::Cancelled => "cancelled",
    }
}

fn state_from_str(s: &str) -> Result<JobState, BackendError> {
    Ok(match s {
        "pending" => JobState::Pending,
        "claimed" => JobState::Claimed,
        "running" => JobState::Running,
        "completed" => JobState::Completed,
        "failed" => JobState::Failed,
        "timed_out" => JobState::TimedOut,
        "cancelled" => JobState::Cancelled,
        other => {
            return Err(BackendError::Serialization(anyhow::anyhow!(
                "unknown job state {other}"
            )))
        }
    })
}

fn priority_from_i16(p: i16) -> Priority {
    match p {
        2 => Priority::High,
        0 => Priority::Low,
        _ => Priority::Normal,
    }
}

fn status_to_str(status: WorkerStatus) -> &'static str {
    match status {
        WorkerStatus::Starting => "starting",
        WorkerStatus::Running => "running",
        WorkerStatus::Draining => "draining",
        WorkerStatus::Stopped => "stopped",
    }
}

fn status_from_str(s: &str) -> Result<WorkerStatus, BackendError> {
    Ok(match s {
        "starting" => WorkerStatus::Starting,
        "running" => WorkerStatus::Running,
        "draining" => WorkerStatus::Draining,
        "stopped" => WorkerStatus::Stopped,
        other => {
            return Err(BackendError::Serialization(anyhow::anyhow!(
                "unknown worker status {other}"
            )))
        }
    })
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> Result<Job, BackendError> {
    Ok(Job {
        id: row.try_get("id").map_err(map_sqlx_err)?,
        kind: row.try_get("kind").map_err(map_sqlx_err)?,
        priority: priority_from_i16(row.try_get::<i16, _>("priority").map_err(map_sqlx_err)?),
        parameters: row.try_get("parameters").map_err(map_sqlx_err)?,
        state: state_from_str(row.try_get::<&str, _>("state").map_err(map_sqlx_err)?)?,
        attempts: row.try_get::<i32, _>("attempts").map_err(map_sqlx_err)? as u32,
        max_attempts: row.try_get::<i32, _>("max_attempts").map_err(map_sqlx_err)? as u32,
        scheduled_at: row.try_get("scheduled_at").map_err(map_sqlx_err)?,
        claimed_by: row.try_get("claimed_by").map_err(map_sqlx_err)?,
        claim_deadline: row.try_get("claim_deadline").map_err(map_sqlx_err)?,
        started_at: row.try_get("started_at").map_err(map_sqlx_err)?,
        completed_at: row.try_get("completed_at").map_err(map_sqlx_err)?,
        failed_at: row.try_get("failed_at").map_err(map_sqlx_err)?,
        result: row.try_get("result").map_err(map_sqlx_err)?,
        last_error: row.try_get("last_error").map_err(map_sqlx_err)?,
        progress: row.try_get::<i16, _>("progress").map_err(map_sqlx_err)? as u8,
        status_message: row.try_get("status_message").map_err(map_sqlx_err)?,
    })
}

/// PostgreSQL queue backend. Cheap to clone: wraps a [`PgPool`].
#[derive(Clone)]
pub struct PgBackend {
    pool: PgPool,
    retry: RetryParams,
}

impl PgBackend {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            retry: RetryParams::default(),
        }
    }

    pub fn with_retry_params(pool: PgPool, retry: RetryParams) -> Self {
        Self { pool, retry }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn apply_retry_rule(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        job_id: &str,
        attempts: u32,
        max_attempts: u32,
        error_text: &str,
        now: DateTime<Utc>,
        terminal_state: JobState,
    ) -> Result<(), BackendError> {
        match retry_decision(attempts, max_attempts, &self.retry) {
            RetryDecision::Requeue { delay_secs } => {
                let scheduled_at = now + chrono::Duration::seconds(delay_secs as i64);
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET state = 'pending',
                        claimed_by = NULL,
                        claim_deadline = NULL,
                        scheduled_at = $1,
                        last_error = $2,
                        failed_at = $3
                    WHERE id = $4
                    "#,
                )
                .bind(scheduled_at)
                .bind(error_text)
                .bind(now)
                .bind(job_id)
                .execute(&mut **tx)
                .await
                .map_err(map_sqlx_err)?;
            }
            RetryDecision::Terminal => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET state = $1,
                        claimed_by = NULL,
                        claim_deadline = NULL,
                        last_error = $2,
                        failed_at = $3
                    WHERE id = $4
                    "#,
                )
                .bind(state_to_str(terminal_state))
                .bind(error_text)
                .bind(now)
                .bind(job_id)
                .execute(&mut **tx)
                .await
                .map_err(map_sqlx_err)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl QueueBackend for PgBackend {
    async fn register_worker(&self, worker: WorkerRecord) -> Result<(), BackendError> {
        sqlx::query(
            r#"
            INSERT INTO workers
                (worker_id, name, host, pid, kinds, capabilities, max_concurrent,
                 current_running, status, started_at, last_heartbeat)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (worker_id) DO UPDATE SET
                name = EXCLUDED.name,
                host = EXCLUDED.host,
                pid = EXCLUDED.pid,
                kinds = EXCLUDED.kinds,
                capabilities = EXCLUDED.capabilities,
                max_concurrent = EXCLUDED.max_concurrent,
                status = EXCLUDED.status,
                started_at = EXCLUDED.started_at,
                last_heartbeat = EXCLUDED.last_heartbeat
            "#,
        )
        .bind(&worker.worker_id)
        .bind(&worker.name)
        .bind(&worker.host)
        .bind(worker.pid as i32)
        .bind(&worker.kinds)
        .bind(&worker.capabilities)
        .bind(worker.max_concurrent as i32)
        .bind(worker.current_running as i32)
        .bind(status_to_str(worker.status))
        .bind(worker.started_at)
        .bind(worker.last_heartbeat)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn update_worker_status(
        &self,
        worker_id: &str,
        status: WorkerStatus,
    ) -> Result<(), BackendError> {
        let result = sqlx::query("UPDATE workers SET status = $1 WHERE worker_id = $2")
            .bind(status_to_str(status))
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        if result.rows_affected() == 0 {
            return Err(BackendError::NotFound(format!("worker {worker_id}")));
        }
        Ok(())
    }

    async fn heartbeat(&self, worker_id: &str, now: DateTime<Utc>) -> Result<(), BackendError> {
        let result = sqlx::query("UPDATE workers SET last_heartbeat = $1 WHERE worker_id = $2")
            .bind(now)
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        if result.rows_affected() == 0 {
            return Err(BackendError::NotFound(format!("worker {worker_id}")));
        }
        Ok(())
    }

    async fn unregister_worker(&self, worker_id: &str) -> Result<(), BackendError> {
        self.update_worker_status(worker_id, WorkerStatus::Stopped)
            .await
    }

    async fn enqueue(&self, job: Job) -> Result<String, BackendError> {
        sqlx::query(
            r#"
            INSERT INTO jobs
                (id, kind, priority, parameters, state, attempts, max_attempts,
                 scheduled_at, result, last_error, progress, status_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(&job.id)
        .bind(&job.kind)
        .bind(job.priority as i16)
        .bind(&job.parameters)
        .bind(state_to_str(job.state))
        .bind(job.attempts as i32)
        .bind(job.max_attempts as i32)
        .bind(job.scheduled_at)
        .bind(&job.result)
        .bind(&job.last_error)
        .bind(job.progress as i16)
        .bind(&job.status_message)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(job.id)
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
        // A broader SQL claim (kind + schedule + attempts only), then a
        // client-side capability filter. Capability requirements are rare
        // and per-kind, so this avoids encoding arbitrary tag predicates
        // in SQL; over-fetching `max_n * 4` keeps the common case (no
        // capability requirements) a single round trip.
        let overfetch = (max_n as i64) * 4;
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM jobs
                WHERE state = 'pending'
                  AND kind = ANY($1)
                  AND (scheduled_at IS NULL OR scheduled_at <= $2)
                  AND attempts < max_attempts
                ORDER BY priority DESC, scheduled_at ASC NULLS FIRST, id ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET state = 'claimed', claimed_by = $4
            WHERE id IN (SELECT id FROM claimable)
            RETURNING id, kind, priority, parameters, state, attempts, max_attempts,
                      scheduled_at, claimed_by, claim_deadline, started_at, completed_at,
                      failed_at, result, last_error, progress, status_message
            "#,
        )
        .bind(kinds)
        .bind(now)
        .bind(overfetch)
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        // `RETURNING` does not preserve the CTE's `ORDER BY` — sort the
        // decoded rows into claim order *before* deciding which to keep, so
        // the accept/reject pass below sees true priority order rather than
        // whatever order Postgres happened to return the batch in.
        let mut candidates: Vec<Job> = rows.iter().map(row_to_job).collect::<Result<_, _>>()?;
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
        for job in candidates {
            let required = required_capabilities.get(&job.kind).unwrap_or(&empty);
            let has_capabilities = required
                .iter()
                .all(|tag| capabilities.iter().any(|c| c == tag));
            if has_capabilities && claimed.len() < max_n as usize {
                claimed.push(job);
            } else {
                // Release rows we over-claimed but can't use this round.
                sqlx::query("UPDATE jobs SET state = 'pending', claimed_by = NULL WHERE id = $1")
                    .bind(&job.id)
                    .execute(&self.pool)
                    .await
                    .map_err(map_sqlx_err)?;
            }
        }
        Ok(claimed)
    }

    async fn start(&self, worker_id: &str, job_id: &str, now: DateTime<Utc>) -> Result<(), BackendError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'running', started_at = $1, progress = 0, attempts = attempts + 1
            WHERE id = $2 AND claimed_by = $3 AND state = 'claimed'
            "#,
        )
        .bind(now)
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        if result.rows_affected() == 0 {
            return Err(BackendError::StateConflict(format!(
                "job {job_id} is not Claimed by {worker_id}"
            )));
        }
        Ok(())
    }

    async fn progress(
        &self,
        worker_id: &str,
        job_id: &str,
        pct: u8,
        message: Option<String>,
    ) -> Result<(), BackendError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET progress = $1,
                status_message = COALESCE($2, status_message)
            WHERE id = $3 AND claimed_by = $4 AND state = 'running'
            "#,
        )
        .bind(pct.min(100) as i16)
        .bind(message)
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        if result.rows_affected() == 0 {
            return Err(BackendError::StateConflict(format!(
                "job {job_id} is not Running under {worker_id}"
            )));
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
        let affected = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'completed', completed_at = $1, result = $2, progress = 100, claimed_by = NULL
            WHERE id = $3 AND claimed_by = $4 AND state = 'running'
            "#,
        )
        .bind(now)
        .bind(result)
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        if affected.rows_affected() == 0 {
            return Err(BackendError::StateConflict(format!(
                "job {job_id} is not Running under {worker_id}"
            )));
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
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        let row = sqlx::query(
            "SELECT attempts, max_attempts FROM jobs WHERE id = $1 AND claimed_by = $2 AND state = 'running' FOR UPDATE",
        )
        .bind(job_id)
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_err)?
        .ok_or_else(|| BackendError::StateConflict(format!("job {job_id} is not Running under {worker_id}")))?;

        let attempts = row.try_get::<i32, _>("attempts").map_err(map_sqlx_err)? as u32;
        let max_attempts = row.try_get::<i32, _>("max_attempts").map_err(map_sqlx_err)? as u32;

        self.apply_retry_rule(&mut tx, job_id, attempts, max_attempts, error_text, now, JobState::Failed)
            .await?;
        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn timeout(&self, worker_id: &str, job_id: &str, now: DateTime<Utc>) -> Result<(), BackendError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        let row = sqlx::query(
            "SELECT attempts, max_attempts FROM jobs WHERE id = $1 AND claimed_by = $2 AND state = 'running' FOR UPDATE",
        )
        .bind(job_id)
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_err)?
        .ok_or_else(|| BackendError::StateConflict(format!("job {job_id} is not Running under {worker_id}")))?;

        let attempts = row.try_get::<i32, _>("attempts").map_err(map_sqlx_err)? as u32;
        let max_attempts = row.try_get::<i32, _>("max_attempts").map_err(map_sqlx_err)? as u32;

        self.apply_retry_rule(
            &mut tx,
            job_id,
            attempts,
            max_attempts,
            "job execution timed out",
            now,
            JobState::TimedOut,
        )
        .await?;
        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn reap_stale(
        &self,
        now: DateTime<Utc>,
        stale_after: chrono::Duration,
    ) -> Result<u64, BackendError> {
        let cutoff = now - stale_after;
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let stale_workers = sqlx::query(
            "SELECT worker_id FROM workers WHERE status != 'stopped' AND last_heartbeat < $1 FOR UPDATE",
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        if stale_workers.is_empty() {
            tx.commit().await.map_err(map_sqlx_err)?;
            return Ok(0);
        }

        let worker_ids: Vec<String> = stale_workers
            .iter()
            .map(|r| r.try_get::<String, _>("worker_id"))
            .collect::<Result<_, _>>()
            .map_err(map_sqlx_err)?;

        sqlx::query("UPDATE workers SET status = 'stopped' WHERE worker_id = ANY($1)")
            .bind(&worker_ids)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;

        let orphaned = sqlx::query(
            r#"
            SELECT id, attempts, max_attempts
            FROM jobs
            WHERE claimed_by = ANY($1) AND state IN ('claimed', 'running')
            FOR UPDATE
            "#,
        )
        .bind(&worker_ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        let reclaimed = orphaned.len() as u64;
        for row in orphaned {
            let job_id: String = row.try_get("id").map_err(map_sqlx_err)?;
            let attempts = row.try_get::<i32, _>("attempts").map_err(map_sqlx_err)? as u32;
            let max_attempts = row.try_get::<i32, _>("max_attempts").map_err(map_sqlx_err)? as u32;
            self.apply_retry_rule(&mut tx, &job_id, attempts, max_attempts, "worker lost", now, JobState::Failed)
                .await?;
        }

        tx.commit().await.map_err(map_sqlx_err)?;
        if reclaimed > 0 {
            tracing::warn!(
                reclaimed_jobs = reclaimed,
                stale_workers = worker_ids.len(),
                "reaped stale workers and reclaimed their jobs"
            );
        }
        Ok(reclaimed)
    }

    async fn query_stats(&self, window: Option<chrono::Duration>) -> Result<QueueStats, BackendError> {
        let since = window.map(|w| Utc::now() - w);
        let rows = sqlx::query(
            r#"
            SELECT kind, state, COUNT(*) as n
            FROM jobs
            WHERE $1::timestamptz IS NULL OR started_at >= $1 OR started_at IS NULL
            GROUP BY kind, state
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let mut stats = QueueStats::default();
        for row in rows {
            let kind: String = row.try_get("kind").map_err(map_sqlx_err)?;
            let state_str: &str = row.try_get("state").map_err(map_sqlx_err)?;
            let n: i64 = row.try_get("n").map_err(map_sqlx_err)?;
            let state = state_from_str(state_str)?;
            match state {
                JobState::Pending => stats.pending += n as u64,
                JobState::Claimed => stats.claimed += n as u64,
                JobState::Running => stats.running += n as u64,
                JobState::Completed => stats.completed += n as u64,
                JobState::Failed => stats.failed += n as u64,
                JobState::TimedOut => stats.timed_out += n as u64,
                JobState::Cancelled => stats.cancelled += n as u64,
            }
            *stats.by_kind.entry(kind).or_insert(0) += n as u64;
        }

        let worker_rows = sqlx::query(
            "SELECT worker_id, status, current_running, max_concurrent, last_heartbeat FROM workers",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        for row in worker_rows {
            stats.workers.push(WorkerStats {
                worker_id: row.try_get("worker_id").map_err(map_sqlx_err)?,
                status: status_from_str(row.try_get("status").map_err(map_sqlx_err)?)?,
                current_running: row.try_get::<i32, _>("current_running").map_err(map_sqlx_err)? as u32,
                max_concurrent: row.try_get::<i32, _>("max_concurrent").map_err(map_sqlx_err)? as u32,
                last_heartbeat: row.try_get("last_heartbeat").map_err(map_sqlx_err)?,
            });
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_round_trips_through_its_string_encoding() {
        for state in [
            JobState::Pending,
            JobState::Claimed,
            JobState::Running,
            JobState::Completed,
            JobState::Failed,
            JobState::TimedOut,
            JobState::Cancelled,
        ] {
            assert_eq!(state_from_str(state_to_str(state)).unwrap(), state);
        }
    }

    #[test]
    fn worker_status_round_trips_through_its_string_encoding() {
        for status in [
            WorkerStatus::Starting,
            WorkerStatus::Running,
            WorkerStatus::Draining,
            WorkerStatus::Stopped,
        ] {
            assert_eq!(status_from_str(status_to_str(status)).unwrap(), status);
        }
    }

    #[test]
    fn priority_from_i16_matches_the_enum_discriminants() {
        assert_eq!(priority_from_i16(2), Priority::High);
        assert_eq!(priority_from_i16(1), Priority::Normal);
        assert_eq!(priority_from_i16(0), Priority::Low);
    }

    #[test]
    fn unknown_state_string_is_rejected() {
        assert!(state_from_str("unknown").is_err());
    }
}
