//! In-memory [`QueueBackend`] and test builders for FinTask.
//!
//! This crate gives every backend adapter (and the worker/reaper runtimes)
//! a fast, dependency-free way to exercise the core testable properties
//! (atomic claim, priority ordering, retry bounds, progress monotonicity,
//! reaper idempotence) without a live database or broker. It implements the
//! exact same contract as `fintask-backend-sql`/`-kv`/`-amqp`/`-pubsub` so tests
//! written against it double as contract tests for the real adapters.

mod backend;
mod builders;

pub use backend::InMemoryBackend;
pub use builders::{job_builder, worker_builder};
