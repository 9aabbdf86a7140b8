//! Persistent coordination for resumable bulk reindex jobs.
//!
//! A reindex job's lifecycle, progress and outcome live in one versioned
//! document per job in a durable store. Workers coordinate exclusively
//! through that document's compare-and-swap semantics: the arbiter decides
//! who owns a job, the throttler bounds how often progress is durably
//! recorded, and the updater persists checkpoints and the terminal state
//! with per-path retry policies.

pub mod arbiter;
pub mod backoff;
pub mod checkpoint;
pub mod document;
pub mod driver;
pub mod job;
pub mod settings;
pub mod store;
pub mod throttler;
pub mod trace;
pub mod updater;

// Test attribute with per-test tracing, used as #[reflow::test].
pub use reflow_macros::test;
