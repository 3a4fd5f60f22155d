use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::DEFAULT_MAX_ATTEMPTS;

/// Ordered job priority. `High > Normal > Low` — within a kind, higher
/// priority is claimed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Claimed,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobState {
    /// Terminal states never transition again under the retry rule.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::TimedOut | JobState::Cancelled
        )
    }
}

/// An immutable-by-contract job record. Backends are the only code
/// permitted to construct transitions; handlers and producers only ever
/// see a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: String,
    pub priority: Priority,
    pub parameters: Value,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub claim_deadline: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub last_error: Option<String>,
    pub progress: u8,
    pub status_message: Option<String>,
}

impl Job {
    /// Construct a new job as a producer would: `state = Pending`,
    /// `attempts = 0`, `claimed_by = None`.
    pub fn new(kind: impl Into<String>, priority: Priority, parameters: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            priority,
            parameters,
            state: JobState::Pending,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            scheduled_at: None,
            claimed_by: None,
            claim_deadline: None,
            started_at: None,
            completed_at: None,
            failed_at: None,
            result: None,
            last_error: None,
            progress: 0,
            status_message: None,
        }
    }

    /// Builder-style override of `max_attempts`. Must be >= 1.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        assert!(max_attempts >= 1, "max_attempts must be >= 1");
        self.max_attempts = max_attempts;
        self
    }

    /// Builder-style override of `scheduled_at`.
    pub fn with_scheduled_at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self
    }

    /// Whether this job is eligible for claim by a worker with the given
    /// kinds/capabilities at time `now`.
    pub fn is_eligible_for(
        &self,
        now: DateTime<Utc>,
        worker_kinds: &[String],
        worker_capabilities: &[String],
        required_capabilities: &[String],
    ) -> bool {
        self.state == JobState::Pending
            && self.scheduled_at.map(|s| s <= now).unwrap_or(true)
            && self.attempts < self.max_attempts
            && worker_kinds.iter().any(|k| k == &self.kind)
            && required_capabilities
                .iter()
                .all(|tag| worker_capabilities.iter().any(|c| c == tag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_starts_pending_with_zero_attempts() {
        let job = Job::new("price_update", Priority::Normal, serde_json::json!({}));
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.claimed_by.is_none());
        assert_eq!(job.max_attempts, DEFAULT_MAX_ATTEMPTS);
    }

    #[test]
    fn priority_ordering_is_high_gt_normal_gt_low() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn eligibility_requires_matching_kind_and_capabilities() {
        let job = Job::new("technical_analysis", Priority::Normal, serde_json::json!({}));
        let now = Utc::now();
        assert!(job.is_eligible_for(now, &["technical_analysis".into()], &[], &[]));
        assert!(!job.is_eligible_for(now, &["price_update".into()], &[], &[]));
        assert!(!job.is_eligible_for(
            now,
            &["technical_analysis".into()],
            &[],
            &["gpu".into()]
        ));
        assert!(job.is_eligible_for(
            now,
            &["technical_analysis".into()],
            &["gpu".into()],
            &["gpu".into()]
        ));
    }

    #[test]
    fn eligibility_excludes_future_scheduled_jobs() {
        let future = Utc::now() + chrono::Duration::hours(1);
        let job = Job::new("price_update", Priority::Normal, serde_json::json!({}))
            .with_scheduled_at(future);
        assert!(!job.is_eligible_for(Utc::now(), &["price_update".into()], &[], &[]));
    }

    #[test]
    fn eligibility_excludes_exhausted_attempts() {
        let mut job = Job::new("price_update", Priority::Normal, serde_json::json!({}))
            .with_max_attempts(2);
        job.attempts = 2;
        assert!(!job.is_eligible_for(Utc::now(), &["price_update".into()], &[], &[]));
    }
}
