use fintask_core::{Job, Priority, WorkerRecord};
use serde_json::Value;

/// Fluent test builder for [`Job`], defaulting to a `"test_kind"` job at
/// `Priority::Normal` with empty parameters. Chain the `with_*` setters on
/// the returned `Job` directly for anything not covered here.
pub struct JobBuilder {
    kind: String,
    priority: Priority,
    parameters: Value,
    max_attempts: Option<u32>,
}

impl JobBuilder {
    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn build(self) -> Job {
        let job = Job::new(self.kind, self.priority, self.parameters);
        match self.max_attempts {
            Some(n) => job.with_max_attempts(n),
            None => job,
        }
    }
}

/// Start building a test [`Job`]. Call `.build()` to finish.
pub fn job_builder() -> JobBuilder {
    JobBuilder {
        kind: "test_kind".to_string(),
        priority: Priority::Normal,
        parameters: Value::Null,
        max_attempts: None,
    }
}

/// Fluent test builder for [`WorkerRecord`], defaulting to a single-kind
/// worker on `"test-host"` with `max_concurrent = 1`.
pub struct WorkerBuilder {
    worker_id: String,
    host: String,
    pid: u32,
    kinds: Vec<String>,
    capabilities: Vec<String>,
    max_concurrent: u32,
}

impl WorkerBuilder {
    pub fn worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn kinds(mut self, kinds: Vec<String>) -> Self {
        self.kinds = kinds;
        self
    }

    pub fn capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn max_concurrent(mut self, max_concurrent: u32) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn build(self) -> WorkerRecord {
        WorkerRecord::new(
            self.worker_id,
            self.host,
            self.pid,
            self.kinds,
            self.capabilities,
            self.max_concurrent,
        )
    }
}

/// Start building a test [`WorkerRecord`]. Call `.build()` to finish.
pub fn worker_builder() -> WorkerBuilder {
    WorkerBuilder {
        worker_id: "test-worker".to_string(),
        host: "test-host".to_string(),
        pid: 1,
        kinds: vec!["test_kind".to_string()],
        capabilities: Vec::new(),
        max_concurrent: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fintask_core::JobState;

    #[test]
    fn job_builder_defaults_are_sensible() {
        let job = job_builder().build();
        assert_eq!(job.kind, "test_kind");
        assert_eq!(job.priority, Priority::Normal);
        assert_eq!(job.state, JobState::Pending);
    }

    #[test]
    fn job_builder_overrides_apply() {
        let job = job_builder()
            .kind("price_update")
            .priority(Priority::High)
            .max_attempts(5)
            .build();
        assert_eq!(job.kind, "price_update");
        assert_eq!(job.priority, Priority::High);
        assert_eq!(job.max_attempts, 5);
    }

    #[test]
    fn worker_builder_defaults_are_sensible() {
        let worker = worker_builder().build();
        assert_eq!(worker.worker_id, "test-worker");
        assert_eq!(worker.kinds, vec!["test_kind".to_string()]);
        assert_eq!(worker.max_concurrent, 1);
    }
}
