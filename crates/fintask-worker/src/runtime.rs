//! The worker main loop: startup, poll/claim/dispatch, heartbeat, and
//! cooperative shutdown

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant as StdInstant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fintask_core::{
    run_isolated, CancellationToken, ExecutionContext, ExecutionOutcome, HandlerRegistry, Job,
    ProgressBackend, ProgressSink, QueueBackend, WorkerConfig, WorkerRecord, WorkerStatus,
};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Bridges [`QueueBackend::progress`] into the [`ProgressBackend`] seam
/// that [`ProgressSink`] expects, so handler code never needs to know
/// about the full backend trait.
struct BackendProgressBridge {
    backend: Arc<dyn QueueBackend>,
}

#[async_trait]
impl ProgressBackend for BackendProgressBridge {
    async fn send_progress(
        &self,
        worker_id: &str,
        job_id: &str,
        pct: u8,
        message: Option<String>,
    ) -> anyhow::Result<()> {
        self.backend
            .progress(worker_id, job_id, pct, message)
            .await
            .map_err(Into::into)
    }
}

struct RunningJob {
    job: Job,
    ctx: ExecutionContext,
    progress: Arc<ProgressSink>,
    handle: JoinHandle<ExecutionOutcome>,
}

/// Drives one worker process's lifecycle against one [`QueueBackend`] and
/// one closed [`HandlerRegistry`].
pub struct WorkerRuntime {
    backend: Arc<dyn QueueBackend>,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    required_capabilities: HashMap<String, Vec<String>>,
}

impl WorkerRuntime {
    pub fn new(backend: Arc<dyn QueueBackend>, registry: HandlerRegistry, config: WorkerConfig) -> Self {
        let required_capabilities = registry.declared_capabilities();
        Self {
            backend,
            registry: Arc::new(registry),
            config,
            required_capabilities,
        }
    }

    /// Runs until `shutdown` is cancelled, then drains in place and
    /// returns. Registers and unregisters the worker record as a side
    /// effect.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let worker_id = self
            .config
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let pid = std::process::id();

        let mut record = WorkerRecord::new(
            worker_id.clone(),
            host,
            pid,
            self.config.kinds.clone(),
            self.config.capabilities.clone(),
            self.config.max_concurrent,
        );
        record.name = self.config.name.clone();

        self.backend.register_worker(record).await?;
        self.backend
            .update_worker_status(&worker_id, WorkerStatus::Running)
            .await?;
        tracing::info!(worker_id = %worker_id, kinds = ?self.config.kinds, "worker started");

        let progress_backend: Arc<dyn ProgressBackend> = Arc::new(BackendProgressBridge {
            backend: self.backend.clone(),
        });

        let poll_interval = Duration::from_secs(self.config.poll_interval);
        let heartbeat_interval = Duration::from_secs(self.config.heartbeat_interval);
        let job_timeout = Duration::from_secs(self.config.job_timeout);
        let cancel_grace = Duration::from_secs(self.config.cancel_grace);
        let progress_interval = Duration::from_secs(self.config.progress_interval);

        let mut running: HashMap<String, RunningJob> = HashMap::new();
        let mut last_heartbeat = StdInstant::now()
            .checked_sub(heartbeat_interval)
            .unwrap_or_else(StdInstant::now);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }

            let now = Utc::now();

            if last_heartbeat.elapsed() >= heartbeat_interval {
                match self.backend.heartbeat(&worker_id, now).await {
                    Ok(()) => last_heartbeat = StdInstant::now(),
                    Err(err) => tracing::warn!(worker_id = %worker_id, error = %err, "heartbeat skipped"),
                }
            }

            self.reap_finished(&mut running, &worker_id, now).await;

            if running.len() < self.config.max_concurrent as usize {
                let capacity = (self.config.max_concurrent as usize - running.len()) as u32;
                match self
                    .backend
                    .claim(
                        &worker_id,
                        &self.config.kinds,
                        &self.config.capabilities,
                        &self.required_capabilities,
                        capacity,
                        now,
                    )
                    .await
                {
                    Ok(jobs) => {
                        for job in jobs {
                            self.start_job(
                                job,
                                &worker_id,
                                now,
                                job_timeout,
                                cancel_grace,
                                progress_interval,
                                progress_backend.clone(),
                                &mut running,
                            )
                            .await;
                        }
                    }
                    Err(err) => tracing::warn!(worker_id = %worker_id, error = %err, "claim failed"),
                }
            }
        }

        self.drain(running, &worker_id).await;
        Ok(())
    }

    async fn start_job(
        &self,
        job: Job,
        worker_id: &str,
        now: DateTime<Utc>,
        job_timeout: Duration,
        cancel_grace: Duration,
        progress_interval: Duration,
        progress_backend: Arc<dyn ProgressBackend>,
        running: &mut HashMap<String, RunningJob>,
    ) {
        if let Err(err) = self.backend.start(worker_id, &job.id, now).await {
            tracing::warn!(worker_id = %worker_id, job_id = %job.id, error = %err, "start transition failed");
            return;
        }

        let handler = match self.registry.instantiate(&job.kind) {
            Some(handler) => handler,
            None => {
                tracing::error!(worker_id = %worker_id, job_id = %job.id, kind = %job.kind, "claimed job with no registered handler");
                let _ = self
                    .backend
                    .fail(worker_id, &job.id, "no handler registered for kind", now)
                    .await;
                return;
            }
        };

        let deadline = tokio::time::Instant::now() + job_timeout;
        let ctx = ExecutionContext::new(deadline);
        let progress = Arc::new(ProgressSink::with_interval(
            worker_id,
            &job.id,
            progress_backend,
            progress_interval,
        ));

        let job_id = job.id.clone();
        let kind = job.kind.clone();
        let handle = tokio::spawn(run_isolated(
            handler,
            ctx.clone(),
            job.clone(),
            progress.clone(),
            cancel_grace,
        ));

        tracing::info!(worker_id = %worker_id, job_id = %job_id, kind = %kind, "job started");
        running.insert(job_id, RunningJob { job, ctx, progress, handle });
    }

    async fn reap_finished(
        &self,
        running: &mut HashMap<String, RunningJob>,
        worker_id: &str,
        now: DateTime<Utc>,
    ) {
        let finished: Vec<String> = running
            .iter()
            .filter(|(_, running_job)| running_job.handle.is_finished())
            .map(|(job_id, _)| job_id.clone())
            .collect();

        for job_id in finished {
            let RunningJob { job, progress, handle, .. } = running.remove(&job_id).expect("just listed");
            progress.flush().await;

            match handle.await {
                Ok(ExecutionOutcome::Completed(value)) => {
                    match self.backend.complete(worker_id, &job_id, value, now).await {
                        Ok(()) => tracing::info!(worker_id = %worker_id, job_id = %job_id, kind = %job.kind, "job completed"),
                        Err(err) => tracing::warn!(worker_id = %worker_id, job_id = %job_id, error = %err, "complete transition failed"),
                    }
                }
                Ok(ExecutionOutcome::Failed(message)) => {
                    match self.backend.fail(worker_id, &job_id, &message, now).await {
                        Ok(()) => tracing::warn!(worker_id = %worker_id, job_id = %job_id, kind = %job.kind, error = %message, "job failed"),
                        Err(err) => tracing::warn!(worker_id = %worker_id, job_id = %job_id, error = %err, "fail transition failed"),
                    }
                }
                Ok(ExecutionOutcome::TimedOut) => {
                    match self.backend.timeout(worker_id, &job_id, now).await {
                        Ok(()) => tracing::warn!(worker_id = %worker_id, job_id = %job_id, kind = %job.kind, "job timed out"),
                        Err(err) => tracing::warn!(worker_id = %worker_id, job_id = %job_id, error = %err, "timeout transition failed"),
                    }
                }
                Err(join_err) => {
                    tracing::error!(worker_id = %worker_id, job_id = %job_id, error = %join_err, "execution task join error");
                    let _ = self
                        .backend
                        .fail(worker_id, &job_id, "worker task join error", now)
                        .await;
                }
            }
        }
    }

    /// Stops claiming (already true by the time this runs), waits up to
    /// `shutdownGrace` for in-flight jobs to finish naturally, then cancels
    /// and fails any stragglers so they retry elsewhere per the resolution
    /// to Open Question 1 in `DESIGN.md`.
    async fn drain(&self, mut running: HashMap<String, RunningJob>, worker_id: &str) {
        tracing::info!(worker_id = %worker_id, in_flight = running.len(), "worker draining");
        let _ = self
            .backend
            .update_worker_status(worker_id, WorkerStatus::Draining)
            .await;

        let grace = Duration::from_secs(self.config.shutdown_grace);
        let grace_deadline = StdInstant::now() + grace;

        while !running.is_empty() && StdInstant::now() < grace_deadline {
            self.reap_finished(&mut running, worker_id, Utc::now()).await;
            if running.is_empty() {
                break;
            }
            let remaining = grace_deadline.saturating_duration_since(StdInstant::now());
            tokio::time::sleep(remaining.min(Duration::from_millis(200))).await;
        }

        let now = Utc::now();
        for (job_id, running_job) in running {
            running_job.ctx.cancel();
            running_job.handle.abort();
            running_job.progress.flush().await;
            if let Err(err) = self.backend.fail(worker_id, &job_id, "worker shutdown", now).await {
                tracing::warn!(worker_id = %worker_id, job_id = %job_id, error = %err, "failed to report shutdown-cancelled job");
            } else {
                tracing::warn!(worker_id = %worker_id, job_id = %job_id, "job cancelled by worker shutdown");
            }
        }

        if let Err(err) = self.backend.unregister_worker(worker_id).await {
            tracing::warn!(worker_id = %worker_id, error = %err, "unregister failed");
        }
        tracing::info!(worker_id = %worker_id, "worker stopped");
    }
}
