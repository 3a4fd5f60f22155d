//! # fintask-core
//!
//! Shared data model, queue backend contract, handler registry, execution
//! primitives and configuration for the FinTask distributed job processing
//! subsystem.
//!
//! ## Architecture
//!
//! ```text
//! producer ──Enqueue──▶ QueueBackend ◀──Claim/Start/Progress/Complete/Fail/Timeout── WorkerRuntime
//!                            ▲                                                          │
//!                            └──────────────────── ReapStale ───────────────── Reaper ◀──┘
//! ```
//!
//! A [`QueueBackend`] is the only place job/worker state lives. Everything
//! above the backend line (retry/backoff math, eligibility filtering,
//! progress debouncing, handler dispatch) is backend-agnostic and lives in
//! this crate so the four backend adapters (`fintask-backend-sql`,
//! `-kv`, `-amqp`, `-pubsub`) only need to implement storage and
//! transport, not policy.
//!
//! This crate deliberately does not include: a web UI, REST endpoints,
//! authentication, market-data fetching, or the trading/analytics math
//! itself. Those are collaborators that plug in as [`Handler`] impls.

mod backend;
mod config;
mod error;
mod execution;
mod handler;
mod job;
mod logging;
mod retry;
mod stats;
mod worker;

pub use backend::QueueBackend;
pub use config::{
    BackendConfig, Config, LoggingConfig, LoggingLevel, QueueBackendKind, ReaperConfig,
    RetryConfig, WorkerConfig,
};
pub use error::{BackendError, ConfigError};
pub use execution::{run_isolated, CancellationToken, ExecutionContext, ExecutionOutcome};
pub use handler::{DeclaredCapabilities, Handler, HandlerRegistry, ProgressBackend, ProgressSink};
pub use job::{Job, JobState, Priority};
pub use logging::{init_logging, rotate_log_file};
pub use retry::{backoff, retry_decision, RetryDecision, RetryParams};
pub use stats::{QueueStats, WorkerStats};
pub use worker::{WorkerRecord, WorkerStatus};

/// Default maximum number of attempts for a job when the producer does not specify one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base backoff duration
pub const DEFAULT_BASE_BACKOFF_SECS: u64 = 30;

/// Default backoff cap
pub const DEFAULT_MAX_BACKOFF_SECS: u64 = 30 * 60;

/// Default progress-forwarding debounce interval
pub const DEFAULT_PROGRESS_INTERVAL_SECS: u64 = 1;

/// Default reaper staleness window
pub const DEFAULT_STALE_AFTER_SECS: u64 = 5 * 60;

/// Default cooperative-cancellation grace window
pub const DEFAULT_CANCEL_GRACE_SECS: u64 = 5;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_match_documented_defaults() {
        assert_eq!(DEFAULT_MAX_ATTEMPTS, 3);
        assert_eq!(DEFAULT_BASE_BACKOFF_SECS, 30);
        assert_eq!(DEFAULT_MAX_BACKOFF_SECS, 1800);
    }
}
