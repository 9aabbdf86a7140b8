//! Job description and outcome types for a reindex run.

use serde::{Deserialize, Serialize};

use crate::checkpoint::ProgressStats;

/// Immutable description of the work a reindex job performs. Captured at
/// submission time and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Source indices to read from.
    pub source: Vec<String>,
    /// Destination index to write into.
    pub dest: String,
    /// Optional query restricting which source documents are copied.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub query: Option<serde_json::Value>,
    /// Number of documents fetched per scroll batch.
    #[serde(default = "JobRequest::default_batch_size")]
    pub batch_size: u32,
    /// Optional client-side rate limit for the data mover.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub requests_per_second: Option<f32>,
}

impl JobRequest {
    pub fn default_batch_size() -> u32 {
        1_000
    }

    pub fn new(source: Vec<String>, dest: impl Into<String>) -> Self {
        Self {
            source,
            dest: dest.into(),
            query: None,
            batch_size: Self::default_batch_size(),
            requests_per_second: None,
        }
    }
}

/// Successful terminal result of a reindex run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReindexResponse {
    /// Wall-clock duration of the run in milliseconds.
    pub took_ms: u64,
    /// Final progress counters at completion.
    pub stats: ProgressStats,
}

/// Failed terminal result of a reindex run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    /// Machine-readable failure kind, e.g. "search_phase_execution".
    pub error_type: String,
    /// Human-readable reason.
    pub reason: String,
}

/// Classification code recorded alongside a failure when the driver does not
/// supply a more specific one.
pub const DEFAULT_FAILURE_STATUS: u16 = 500;

/// Terminal outcome reported by the driver when the run ends. Exactly one of
/// success or failure, mirroring the persisted `response`/`exception` fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(ReindexResponse),
    Failure {
        failure: JobFailure,
        rest_status: u16,
    },
}

impl Outcome {
    /// Failure outcome with the default classification code.
    pub fn failure(failure: JobFailure) -> Self {
        Outcome::Failure {
            failure,
            rest_status: DEFAULT_FAILURE_STATUS,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }
}

/// Observable lifecycle of one worker instance driving a job.
///
/// `Done` is terminal for the job. `AssignmentFailed` is terminal only for
/// this worker instance: a newer allocation owns the job and is expected to
/// drive it to `Done`. The `FailedTo*` states are transient and cleared by
/// the next successful store round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Started,
    FailedToReadStore,
    AssignmentFailed,
    FailedToWriteStore,
    Done,
}

impl JobStatus {
    /// True when this worker instance will make no further store writes.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::AssignmentFailed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Started => write!(f, "started"),
            JobStatus::FailedToReadStore => write!(f, "failed_to_read_store"),
            JobStatus::AssignmentFailed => write!(f, "assignment_failed"),
            JobStatus::FailedToWriteStore => write!(f, "failed_to_write_store"),
            JobStatus::Done => write!(f, "done"),
        }
    }
}
