use async_trait::async_trait;
use fintask_core::{DeclaredCapabilities, ExecutionContext, Handler, Job, ProgressSink};
use serde_json::{json, Value};

use super::require_str;

/// Expects `{ "source": string }`. Stands in for a bulk data-import
/// pipeline; declares the `bulk_io` capability so it only lands on
/// workers provisioned for large transfers.
pub struct DataImportHandler;

#[async_trait]
impl Handler for DataImportHandler {
    async fn execute(
        &self,
        _ctx: &ExecutionContext,
        job: &Job,
        progress: &ProgressSink,
    ) -> anyhow::Result<Value> {
        let source = require_str(&job.parameters, "source")?;

        progress.update(5, format!("connecting to {source}")).await;
        progress.update(50, "importing records").await;
        progress.update(100, "import complete").await;

        Ok(json!({ "source": source, "records_imported": 0 }))
    }

    fn declared_capabilities(&self) -> DeclaredCapabilities {
        vec!["bulk_io".to_string()]
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
        let job = Job::new("data_import", Priority::Normal, json!({ "source": "s3://bucket/x" }));
        let ctx = ExecutionContext::new(tokio::time::Instant::now() + std::time::Duration::from_secs(5));
        let progress = ProgressSink::new("w1", &job.id, Arc::new(NoopProgressBackend));
        let result = DataImportHandler.execute(&ctx, &job, &progress).await.unwrap();
        assert_eq!(result["source"], "s3://bucket/x");
    }

    #[tokio::test]
    async fn rejects_missing_source() {
        let job = Job::new("data_import", Priority::Normal, json!({}));
        let ctx = ExecutionContext::new(tokio::time::Instant::now() + std::time::Duration::from_secs(5));
        let progress = ProgressSink::new("w1", &job.id, Arc::new(NoopProgressBackend));
        assert!(DataImportHandler.execute(&ctx, &job, &progress).await.is_err());
    }
}
