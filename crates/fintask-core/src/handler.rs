use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::{ExecutionContext, Job, DEFAULT_PROGRESS_INTERVAL_SECS};

/// A job kind's required capability tags, used to filter worker
/// eligibility alongside `kind`.
pub type DeclaredCapabilities = Vec<String>;

/// Code executed for a job of a given kind. Handlers do their own I/O,
/// may fork subcomputations, and call `progress` any number of times —
/// they must honor `ctx` cancellation promptly.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn execute(
        &self,
        ctx: &ExecutionContext,
        job: &Job,
        progress: &ProgressSink,
    ) -> anyhow::Result<Value>;

    /// Capability tags a worker must declare to be eligible to run this
    /// kind. Empty by default.
    fn declared_capabilities(&self) -> DeclaredCapabilities {
        Vec::new()
    }
}

/// A factory producing fresh `Handler` instances per job, keyed by kind.
/// Closed at worker startup — no hot-reload in the core.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    factories: HashMap<String, Arc<dyn Fn() -> Arc<dyn Handler> + Send + Sync>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a `kind -> factory` mapping. `factory` is called once per
    /// claimed job of this kind to produce a fresh handler instance.
    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn Handler> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(factory));
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Produce a handler instance for `kind`, if registered.
    pub fn instantiate(&self, kind: &str) -> Option<Arc<dyn Handler>> {
        self.factories.get(kind).map(|f| f())
    }

    /// Capability tags required across all registered kinds, keyed by
    /// kind — used by the worker runtime to validate its own
    /// `capabilities` config against what it intends to serve.
    pub fn declared_capabilities(&self) -> HashMap<String, DeclaredCapabilities> {
        self.factories
            .iter()
            .map(|(kind, factory)| (kind.clone(), factory().declared_capabilities()))
            .collect()
    }
}

struct ProgressState {
    last_sent: Option<Instant>,
    pending: Option<(u8, Option<String>)>,
}

/// Debounced progress forwarder handed to a handler's `execute`. At most
/// one backend call per `progress_interval` per job; the most recent
/// `(pct, msg)` is always eventually delivered.
pub struct ProgressSink {
    job_id: String,
    worker_id: String,
    progress_interval: Duration,
    state: Mutex<ProgressState>,
    sender: Arc<dyn ProgressBackend>,
}

/// The minimal surface `ProgressSink` needs from a `QueueBackend` —
/// kept separate so handlers can be unit-tested without a full backend.
#[async_trait]
pub trait ProgressBackend: Send + Sync {
    async fn send_progress(
        &self,
        worker_id: &str,
        job_id: &str,
        pct: u8,
        message: Option<String>,
    ) -> anyhow::Result<()>;
}

impl ProgressSink {
    pub fn new(
        worker_id: impl Into<String>,
        job_id: impl Into<String>,
        sender: Arc<dyn ProgressBackend>,
    ) -> Self {
        Self::with_interval(
            worker_id,
            job_id,
            sender,
            Duration::from_secs(DEFAULT_PROGRESS_INTERVAL_SECS),
        )
    }

    pub fn with_interval(
        worker_id: impl Into<String>,
        job_id: impl Into<String>,
        sender: Arc<dyn ProgressBackend>,
        progress_interval: Duration,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            worker_id: worker_id.into(),
            progress_interval,
            state: Mutex::new(ProgressState {
                last_sent: None,
                pending: None,
            }),
            sender,
        }
    }

    /// Called by handler code. Clamps `pct` to `[0, 100]`, then either
    /// forwards immediately (first call, or interval elapsed) or coalesces
    /// into `pending` for the next `flush`.
    pub async fn update(&self, pct: u8, message: impl Into<Option<String>>) {
        let pct = pct.min(100);
        let message = message.into();
        let mut state = self.state.lock().await;
        let due = state
            .last_sent
            .map(|t| t.elapsed() >= self.progress_interval)
            .unwrap_or(true);

        if due {
            state.last_sent = Some(Instant::now());
            state.pending = None;
            drop(state);
            let _ = self
                .sender
                .send_progress(&self.worker_id, &self.job_id, pct, message)
                .await;
        } else {
            state.pending = Some((pct, message));
        }
    }

    /// Forces delivery of the most recent coalesced update, if any. The
    /// worker runtime calls this once after a handler returns so a
    /// debounced-away final update is never silently dropped.
    pub async fn flush(&self) {
        let pending = {
            let mut state = self.state.lock().await;
            state.pending.take()
        };
        if let Some((pct, message)) = pending {
            let _ = self
                .sender
                .send_progress(&self.worker_id, &self.job_id, pct, message)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingBackend {
        calls: AtomicUsize,
        last: Mutex<Option<(u8, Option<String>)>>,
    }

    #[async_trait]
    impl ProgressBackend for CountingBackend {
        async fn send_progress(
            &self,
            _worker_id: &str,
            _job_id: &str,
            pct: u8,
            message: Option<String>,
        ) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().await = Some((pct, message));
            Ok(())
        }
    }

    #[tokio::test]
    async fn first_update_is_sent_immediately() {
        let backend = Arc::new(CountingBackend {
            calls: AtomicUsize::new(0),
            last: Mutex::new(None),
        });
        let sink = ProgressSink::with_interval("w1", "j1", backend.clone(), Duration::from_secs(60));
        sink.update(10, None).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rapid_updates_are_coalesced_until_flush() {
        let backend = Arc::new(CountingBackend {
            calls: AtomicUsize::new(0),
            last: Mutex::new(None),
        });
        let sink = ProgressSink::with_interval("w1", "j1", backend.clone(), Duration::from_secs(60));
        sink.update(10, None).await; // sent immediately
        sink.update(20, None).await; // coalesced
        sink.update(30, Some("almost done".to_string())).await; // coalesced, replaces prior
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        sink.flush().await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            *backend.last.lock().await,
            Some((30, Some("almost done".to_string())))
        );
    }

    #[tokio::test]
    async fn pct_is_clamped_to_100() {
        let backend = Arc::new(CountingBackend {
            calls: AtomicUsize::new(0),
            last: Mutex::new(None),
        });
        let sink = ProgressSink::new("w1", "j1", backend.clone());
        sink.update(255, None).await;
        assert_eq!(backend.last.lock().await.as_ref().unwrap().0, 100);
    }

    #[test]
    fn registry_round_trips_factory() {
        struct NoopHandler;
        #[async_trait]
        impl Handler for NoopHandler {
            async fn execute(
                &self,
                _ctx: &ExecutionContext,
                _job: &Job,
                _progress: &ProgressSink,
            ) -> anyhow::Result<Value> {
                Ok(Value::Null)
            }
        }

        let mut registry = HandlerRegistry::new();
        registry.register("price_update", || Arc::new(NoopHandler));
        assert!(registry.contains("price_update"));
        assert!(!registry.contains("unknown"));
        assert!(registry.instantiate("price_update").is_some());
    }
}
