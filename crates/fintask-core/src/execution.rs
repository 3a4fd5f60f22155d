use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;

use crate::{Handler, Job, ProgressSink};

/// Re-exported so downstream crates don't need a direct `tokio-util`
/// dependency just to hold onto one.
pub type CancellationToken = tokio_util::sync::CancellationToken;

/// Per-job execution context: a deadline (`min(jobTimeout, time until
/// shutdownGrace expires)`) and a cooperative
/// cancellation signal the handler must observe promptly.
#[derive(Clone)]
pub struct ExecutionContext {
    cancel: CancellationToken,
    deadline: tokio::time::Instant,
}

impl ExecutionContext {
    pub fn new(deadline: tokio::time::Instant) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline,
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn deadline(&self) -> tokio::time::Instant {
        self.deadline
    }

    /// Resolves once the context is cancelled. Handlers should
    /// `tokio::select!` this against their own I/O.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// The result of running a handler in an isolated execution context.
pub enum ExecutionOutcome {
    Completed(Value),
    Failed(String),
    /// The handler did not return within the deadline + cancel grace
    /// window and was forcibly terminated.
    TimedOut,
}

/// Runs `handler.execute` behind a panic firewall and a deadline.
///
/// This implements the in-process task-isolation variant (subprocess
/// isolation is an allowed alternative, not built here): a panicking
/// handler is caught via
/// [`FutureExt::catch_unwind`] and reported as a failed attempt instead of
/// tearing down the worker process. A handler that does not return within
/// `cancel_grace` after the deadline elapses is abandoned (its task is
/// dropped) and reported as `TimedOut`.
pub async fn run_isolated(
    handler: Arc<dyn Handler>,
    ctx: ExecutionContext,
    job: Job,
    progress: Arc<ProgressSink>,
    cancel_grace: Duration,
) -> ExecutionOutcome {
    let deadline = ctx.deadline();
    let exec_ctx = ctx.clone();

    let task = tokio::spawn(async move {
        AssertUnwindSafe(handler.execute(&exec_ctx, &job, &progress))
            .catch_unwind()
            .await
    });

    let mut task = task;

    tokio::select! {
        joined = &mut task => {
            match joined {
                Ok(Ok(Ok(value))) => ExecutionOutcome::Completed(value),
                Ok(Ok(Err(err))) => ExecutionOutcome::Failed(err.to_string()),
                Ok(Err(panic)) => ExecutionOutcome::Failed(describe_panic(panic)),
                Err(join_err) => ExecutionOutcome::Failed(format!("handler task failed: {join_err}")),
            }
        }
        _ = tokio::time::sleep_until(deadline) => {
            ctx.cancel();
            tokio::select! {
                _ = &mut task => {}
                _ = tokio::time::sleep(cancel_grace) => {
                    task.abort();
                }
            }
            ExecutionOutcome::TimedOut
        }
    }
}

fn describe_panic(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::ProgressBackend;
    use async_trait::async_trait;

    struct NoopProgressBackend;
    #[async_trait]
    impl ProgressBackend for NoopProgressBackend {
        async fn send_progress(
            &self,
            _worker_id: &str,
            _job_id: &str,
            _pct: u8,
            _message: Option<String>,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct PanickingHandler;
    #[async_trait]
    impl Handler for PanickingHandler {
        async fn execute(
            &self,
            _ctx: &ExecutionContext,
            _job: &Job,
            _progress: &ProgressSink,
        ) -> anyhow::Result<Value> {
            panic!("boom");
        }
    }

    struct SlowHandler;
    #[async_trait]
    impl Handler for SlowHandler {
        async fn execute(
            &self,
            _ctx: &ExecutionContext,
            _job: &Job,
            _progress: &ProgressSink,
        ) -> anyhow::Result<Value> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn panicking_handler_reports_failed_not_crash() {
        let job = Job::new("x", crate::Priority::Normal, serde_json::json!({}));
        let progress = Arc::new(ProgressSink::new("w1", &job.id, Arc::new(NoopProgressBackend)));
        let ctx = ExecutionContext::new(tokio::time::Instant::now() + Duration::from_secs(5));
        let outcome = run_isolated(
            Arc::new(PanickingHandler),
            ctx,
            job,
            progress,
            Duration::from_millis(50),
        )
        .await;
        assert!(matches!(outcome, ExecutionOutcome::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_times_out_after_deadline_plus_grace() {
        let job = Job::new("x", crate::Priority::Normal, serde_json::json!({}));
        let progress = Arc::new(ProgressSink::new("w1", &job.id, Arc::new(NoopProgressBackend)));
        let ctx = ExecutionContext::new(tokio::time::Instant::now() + Duration::from_millis(10));
        let outcome = run_isolated(
            Arc::new(SlowHandler),
            ctx,
            job,
            progress,
            Duration::from_millis(10),
        )
        .await;
        assert!(matches!(outcome, ExecutionOutcome::TimedOut));
    }
}
