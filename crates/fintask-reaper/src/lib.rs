//! The liveness reaper: a single process-wide task that periodically
//! reclaims jobs owned by workers who have stopped heartbeating.
//!
//! This is the library half of `fintask-reaperd`; it is also usable
//! embedded inside a worker process (`reaper.embedded = true`) so a small
//! deployment doesn't need a separate process just to run the reaper.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fintask_core::{CancellationToken, QueueBackend};
use tracing::{info, warn};

/// Runs `reap_stale` on `interval`, logging one line per pass and one per
/// reclaimed job count. Returns once `shutdown` is cancelled.
///
/// Safe to run concurrently with any number of live workers and with
/// another reaper instance: `reap_stale` is idempotent for a given `now`,
/// so overlapping passes converge to the same state.
pub async fn run(backend: Arc<dyn QueueBackend>, stale_after: Duration, interval: Duration, shutdown: CancellationToken) {
    let stale_after = chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::minutes(5));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("reaper stopping");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        let now = Utc::now();
        match backend.reap_stale(now, stale_after).await {
            Ok(0) => {}
            Ok(n) => info!(reclaimed = n, "reaper reclaimed jobs from stale workers"),
            Err(err) => warn!(error = %err, "reaper pass failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fintask_testing::{job_builder, worker_builder, InMemoryBackend};

    #[tokio::test]
    async fn reaper_loop_reclaims_and_then_idles() {
        let backend = Arc::new(InMemoryBackend::new());
        let worker = worker_builder().worker_id("stale-worker").build();
        backend.register_worker(worker).await.unwrap();

        let job = job_builder().kind("k").build();
        let id = backend.enqueue(job).await.unwrap();
        let now = Utc::now();
        backend
            .claim(
                "stale-worker",
                &["k".to_string()],
                &[],
                &std::collections::HashMap::new(),
                1,
                now,
            )
            .await
            .unwrap();
        backend.start("stale-worker", &id, now).await.unwrap();
        backend
            .heartbeat("stale-worker", now - chrono::Duration::minutes(10))
            .await
            .unwrap();

        let reclaimed = backend
            .reap_stale(Utc::now(), chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(reclaimed, 1);

        let job = backend.get(&id).await.unwrap();
        assert_eq!(job.state, fintask_core::JobState::Pending);
        assert!(job.claimed_by.is_none());
    }
}
