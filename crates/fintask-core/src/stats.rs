use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Queue-wide counts by state, optionally broken down by kind, plus
/// per-worker stats, returned by `QueryStats`.
///
/// Counts by state with a per-kind breakdown and per-worker rollup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub claimed: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub by_kind: HashMap<String, u64>,
    pub workers: Vec<WorkerStats>,
}

/// Per-worker observed counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStats {
    pub worker_id: String,
    pub status: crate::WorkerStatus,
    pub current_running: u32,
    pub max_concurrent: u32,
    pub last_heartbeat: chrono::DateTime<chrono::Utc>,
}
