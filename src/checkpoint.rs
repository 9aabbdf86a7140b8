//! Progress checkpoints: the resumable position of a scroll plus a snapshot
//! of progress counters. Checkpoints only ever move forward; the persistence
//! path refuses to write one that does not advance the stored position.

use serde::{Deserialize, Serialize};

/// Resume marker for the scroll driving a reindex run. The position is an
/// opaque non-negative cursor that grows as source documents are consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Checkpoint {
    pub position: i64,
}

impl Checkpoint {
    pub fn new(position: i64) -> Self {
        Self { position }
    }
}

/// Snapshot of progress counters reported by the data mover with each
/// checkpoint and frozen into the response at completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressStats {
    pub total: u64,
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
    pub batches: u64,
    pub version_conflicts: u64,
    pub noops: u64,
}

impl ProgressStats {
    /// Documents the run has written so far, in any form.
    pub fn processed(&self) -> u64 {
        self.created + self.updated + self.deleted + self.noops
    }
}

/// The durably persisted form of a checkpoint: position plus the stats
/// snapshot taken at the same moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub position: i64,
    pub stats: ProgressStats,
}

impl CheckpointState {
    pub fn new(checkpoint: Checkpoint, stats: ProgressStats) -> Self {
        Self {
            position: checkpoint.position,
            stats,
        }
    }

    /// Whether `candidate` moves the progress marker strictly forward.
    pub fn advanced_by(&self, candidate: Checkpoint) -> bool {
        candidate.position > self.position
    }
}
