//! The persisted record for one reindex job and its JSON wire layout.
//!
//! One document exists per job id. It is created at submission with no
//! allocation, no checkpoint and no result, then rewritten as new versions by
//! the arbiter (allocation claim), the checkpoint path, and the terminal
//! write. Once a result is recorded the document never changes again.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checkpoint::CheckpointState;
use crate::job::{JobFailure, JobRequest, Outcome, ReindexResponse};

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("document has both a response and an exception")]
    ConflictingResult,
    #[error("document has an exception but no failure_rest_status")]
    MissingFailureStatus,
    #[error("document has a failure_rest_status but no exception")]
    DanglingFailureStatus,
    #[error("json error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Persisted state of one reindex job.
///
/// Wire layout: optional fields are absent (not null) when unset;
/// `failure_rest_status` accompanies `exception` and only `exception`;
/// `response` and `exception` are mutually exclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStateDoc {
    pub request: JobRequest,
    /// Grouping of target resources for progress accounting.
    #[serde(default)]
    pub index_groups: Vec<BTreeSet<String>>,
    /// Allocation id of the worker instance currently believed to own the
    /// job. Unset until the first successful claim.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub allocation: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub response: Option<ReindexResponse>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub exception: Option<JobFailure>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub failure_rest_status: Option<u16>,
    /// Last durably recorded progress marker. Only ever moves forward.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub checkpoint: Option<CheckpointState>,
}

impl JobStateDoc {
    /// Fresh document at submission time.
    pub fn new(request: JobRequest, index_groups: Vec<BTreeSet<String>>) -> Self {
        Self {
            request,
            index_groups,
            allocation: None,
            response: None,
            exception: None,
            failure_rest_status: None,
            checkpoint: None,
        }
    }

    /// Copy with the allocation claimed by `allocation_id`.
    pub fn with_allocation(&self, allocation_id: i64) -> Self {
        let mut doc = self.clone();
        doc.allocation = Some(allocation_id);
        doc
    }

    /// Copy with the progress checkpoint replaced.
    pub fn with_checkpoint(&self, checkpoint: CheckpointState) -> Self {
        let mut doc = self.clone();
        doc.checkpoint = Some(checkpoint);
        doc
    }

    /// Copy carrying the terminal outcome.
    pub fn with_outcome(&self, outcome: &Outcome) -> Self {
        let mut doc = self.clone();
        match outcome {
            Outcome::Success(response) => {
                doc.response = Some(response.clone());
                doc.exception = None;
                doc.failure_rest_status = None;
            }
            Outcome::Failure {
                failure,
                rest_status,
            } => {
                doc.response = None;
                doc.exception = Some(failure.clone());
                doc.failure_rest_status = Some(*rest_status);
            }
        }
        doc
    }

    /// True once a terminal outcome has been recorded.
    pub fn is_done(&self) -> bool {
        self.response.is_some() || self.exception.is_some()
    }

    /// Check the result-exclusivity invariants.
    pub fn validate(&self) -> Result<(), DocumentError> {
        if self.response.is_some() && self.exception.is_some() {
            return Err(DocumentError::ConflictingResult);
        }
        if self.exception.is_some() && self.failure_rest_status.is_none() {
            return Err(DocumentError::MissingFailureStatus);
        }
        if self.failure_rest_status.is_some() && self.exception.is_none() {
            return Err(DocumentError::DanglingFailureStatus);
        }
        Ok(())
    }

    /// Encode for the wire, refusing invariant-violating documents.
    pub fn to_bytes(&self) -> Result<Vec<u8>, DocumentError> {
        self.validate()?;
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from the wire, validating the result invariants.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, DocumentError> {
        let doc: Self = serde_json::from_slice(raw)?;
        doc.validate()?;
        Ok(doc)
    }
}
