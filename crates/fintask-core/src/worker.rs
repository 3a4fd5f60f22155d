use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Worker lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Running,
    Draining,
    Stopped,
}

/// Durable worker record. Created on startup, mutated only by its owning
/// worker (heartbeat/status) and the reaper (stale marking), retained after
/// shutdown as a historical row with `status = Stopped`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub name: Option<String>,
    pub host: String,
    pub pid: u32,
    pub kinds: Vec<String>,
    pub capabilities: Vec<String>,
    pub max_concurrent: u32,
    pub current_running: u32,
    pub status: WorkerStatus,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl WorkerRecord {
    pub fn new(
        worker_id: impl Into<String>,
        host: impl Into<String>,
        pid: u32,
        kinds: Vec<String>,
        capabilities: Vec<String>,
        max_concurrent: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            worker_id: worker_id.into(),
            name: None,
            host: host.into(),
            pid,
            kinds,
            capabilities,
            max_concurrent,
            current_running: 0,
            status: WorkerStatus::Starting,
            started_at: now,
            last_heartbeat: now,
        }
    }

    /// True once `now - last_heartbeat >= stale_after`, the reaper's test
    /// for a dead worker.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        now.signed_duration_since(self.last_heartbeat) >= stale_after
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_worker_is_not_stale() {
        let w = WorkerRecord::new("w1", "host-a", 1234, vec![], vec![], 4);
        assert!(!w.is_stale(Utc::now(), chrono::Duration::minutes(5)));
    }

    #[test]
    fn worker_past_stale_after_is_stale() {
        let mut w = WorkerRecord::new("w1", "host-a", 1234, vec![], vec![], 4);
        w.last_heartbeat = Utc::now() - chrono::Duration::minutes(10);
        assert!(w.is_stale(Utc::now(), chrono::Duration::minutes(5)));
    }
}
