use async_trait::async_trait;
use fintask_core::{ExecutionContext, Handler, Job, ProgressSink};
use serde_json::{json, Value};

use super::require_str;

/// Expects `{ "symbol": string, "price": number }`. Stands in for the
/// market-data ingestion path.
pub struct PriceUpdateHandler;

#[async_trait]
impl Handler for PriceUpdateHandler {
    async fn execute(
        &self,
        _ctx: &ExecutionContext,
        job: &Job,
        progress: &ProgressSink,
    ) -> anyhow::Result<Value> {
        let symbol = require_str(&job.parameters, "symbol")?;
        let price = job
            .parameters
            .get("price")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| anyhow::anyhow!("parameters.price must be a number"))?;

        progress.update(100, format!("recorded {symbol}")).await;

        Ok(json!({ "symbol": symbol, "price": price, "recorded": true }))
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
    async fn accepts_well_formed_parameters() {
        let job = Job::new(
            "price_update",
            Priority::Normal,
            json!({ "symbol": "AAPL", "price": 190.5 }),
        );
        let ctx = ExecutionContext::new(tokio::time::Instant::now() + std::time::Duration::from_secs(5));
        let progress = ProgressSink::new("w1", &job.id, Arc::new(NoopProgressBackend));
        let result = PriceUpdateHandler.execute(&ctx, &job, &progress).await.unwrap();
        assert_eq!(result["symbol"], "AAPL");
    }

    #[tokio::test]
    async fn rejects_missing_price() {
        let job = Job::new("price_update", Priority::Normal, json!({ "symbol": "AAPL" }));
        let ctx = ExecutionContext::new(tokio::time::Instant::now() + std::time::Duration::from_secs(5));
        let progress = ProgressSink::new("w1", &job.id, Arc::new(NoopProgressBackend));
        assert!(PriceUpdateHandler.execute(&ctx, &job, &progress).await.is_err());
    }
}
