//! Driver-facing glue: the trait the data mover implements and the harness
//! that wires assignment, checkpoints and terminal persistence together.

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::arbiter::AssignError;
use crate::checkpoint::{Checkpoint, ProgressStats};
use crate::job::Outcome;
use crate::updater::{FinishError, JobStateUpdater};

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Assign(#[from] AssignError),
    #[error(transparent)]
    Finish(#[from] FinishError),
}

/// Handle the driver uses to report progress and observe supersession.
pub struct DriverContext<'a> {
    updater: &'a JobStateUpdater,
}

impl DriverContext<'_> {
    /// Report progress. Non-blocking; coalesced and rate-bounded.
    pub fn checkpoint(&self, position: i64, stats: ProgressStats) {
        self.updater.on_checkpoint(Checkpoint::new(position), stats);
    }

    /// True once a newer allocation owns the job. Cooperative: the driver
    /// should wind down as soon as it observes this.
    pub fn is_superseded(&self) -> bool {
        self.updater.is_superseded()
    }
}

/// The actual data mover. Runs the scroll-and-bulk-write loop, reporting
/// checkpoints along the way and an outcome at the end.
#[async_trait]
pub trait ReindexDriver: Send {
    async fn run(&mut self, ctx: &DriverContext<'_>) -> Outcome;
}

/// Drive one job to completion on this worker instance: claim ownership,
/// run the driver, persist the outcome. An assignment rejection aborts
/// before the driver starts; supersession during the run surfaces through
/// the updater's lost callback and `ctx.is_superseded()`.
pub async fn run_job<D: ReindexDriver>(
    driver: &mut D,
    updater: &JobStateUpdater,
) -> Result<Outcome, JobError> {
    let doc = updater.assign().await?;
    debug!(
        job_id = updater.job_id(),
        allocation = updater.allocation_id(),
        resume_from = doc.checkpoint.map(|c| c.position),
        "job assigned"
    );

    let ctx = DriverContext { updater };
    let outcome = driver.run(&ctx).await;

    let terminal = updater.finish(outcome.clone()).await?;
    info!(
        job_id = updater.job_id(),
        success = terminal.response.is_some(),
        "job finished"
    );
    Ok(outcome)
}
