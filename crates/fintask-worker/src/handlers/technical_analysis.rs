use async_trait::async_trait;
use fintask_core::{DeclaredCapabilities, ExecutionContext, Handler, Job, ProgressSink};
use serde_json::{json, Value};

use super::require_str;

/// Expects `{ "symbol": string, "indicator": string }`. Stands in for the
/// strategy/analytics math — declares the `market_data` capability so only workers
/// provisioned with a market-data feed are eligible to claim it.
pub struct TechnicalAnalysisHandler;

#[async_trait]
impl Handler for TechnicalAnalysisHandler {
    async fn execute(
        &self,
        ctx: &ExecutionContext,
        job: &Job,
        progress: &ProgressSink,
    ) -> anyhow::Result<Value> {
        let symbol = require_str(&job.parameters, "symbol")?;
        let indicator = require_str(&job.parameters, "indicator")?;

        progress.update(10, format!("loading series for {symbol}")).await;
        if ctx.is_cancelled() {
            anyhow::bail!("cancelled before computing {indicator}");
        }
        progress.update(80, format!("computing {indicator}")).await;

        Ok(json!({
            "symbol": symbol,
            "indicator": indicator,
            "value": 0.0,
        }))
    }

    fn declared_capabilities(&self) -> DeclaredCapabilities {
        vec!["market_data".to_string()]
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
    async fn declares_market_data_capability() {
        assert_eq!(
            TechnicalAnalysisHandler.declared_capabilities(),
            vec!["market_data".to_string()]
        );
    }

    #[tokio::test]
    async fn rejects_missing_indicator() {
        let job = Job::new(
            "technical_analysis",
            Priority::Normal,
            json!({ "symbol": "AAPL" }),
        );
        let ctx = ExecutionContext::new(tokio::time::Instant::now() + std::time::Duration::from_secs(5));
        let progress = ProgressSink::new("w1", &job.id, Arc::new(NoopProgressBackend));
        assert!(TechnicalAnalysisHandler
            .execute(&ctx, &job, &progress)
            .await
            .is_err());
    }
}
