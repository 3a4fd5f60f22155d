use async_trait::async_trait;
use fintask_core::{ExecutionContext, Handler, Job, ProgressSink};
use serde_json::{json, Value};

use super::require_str;

/// Expects `{ "portfolio_id": string }`. Stands in for portfolio-level
/// risk/exposure analytics. No extra capabilities required.
pub struct PortfolioAnalysisHandler;

#[async_trait]
impl Handler for PortfolioAnalysisHandler {
    async fn execute(
        &self,
        _ctx: &ExecutionContext,
        job: &Job,
        progress: &ProgressSink,
    ) -> anyhow::Result<Value> {
        let portfolio_id = require_str(&job.parameters, "portfolio_id")?;

        progress.update(50, "aggregating positions").await;

        Ok(json!({
            "portfolio_id": portfolio_id,
            "exposure": {},
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fintask_core::{Priority, ProgressBackend};
    use std::sync::Arc;

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

    #[tokio::test]
    async fn rejects_missing_portfolio_id() {
        let job = Job::new("portfolio_analysis", Priority::Normal, json!({}));
        let ctx = ExecutionContext::new(tokio::time::Instant::now() + std::time::Duration::from_secs(5));
        let progress = ProgressSink::new("w1", &job.id, Arc::new(NoopProgressBackend));
        assert!(PortfolioAnalysisHandler
            .execute(&ctx, &job, &progress)
            .await
            .is_err());
    }
}
