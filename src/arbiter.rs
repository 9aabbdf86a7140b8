//! Allocation ownership arbitration.
//!
//! Allocation ids are handed out by the cluster scheduler in increasing
//! order, one per (re)assignment of a job to a worker. Only the holder of
//! the highest id recorded in the job document may advance the job. A claim
//! succeeds by writing the candidate id through the store's version check,
//! so a racing claim with a lower id can never overwrite a higher one: any
//! writer that reads a document already claimed by a higher id gives up, and
//! a writer racing on a stale token re-reads and re-evaluates.

use thiserror::Error;
use tracing::{debug, warn};

use crate::backoff::BackoffPolicy;
use crate::document::JobStateDoc;
use crate::job::JobStatus;
use crate::store::{StoreError, VersionToken, VersionedStore};

#[derive(Debug, Error)]
pub enum AssignError {
    #[error(
        "allocation {candidate} rejected for job {job_id}: allocation {current} already owns it"
    )]
    Superseded {
        job_id: String,
        candidate: i64,
        current: i64,
    },
}

/// Claim ownership of `job_id` for `candidate`.
///
/// Read failures and version conflicts are retried without limit under
/// `backoff` (they are infrastructure trouble and benign contention, not
/// reasons to stop). The only error is a strictly newer-or-equal claim
/// already recorded, which is final for this worker instance. Duplicate ids
/// are rejected too: the scheduler never issues the same id twice, so seeing
/// our own id already recorded means an ordering bug upstream.
///
/// `on_transient` observes the transient status on every retried failure, so
/// the updater can expose it to status polling.
pub async fn claim(
    store: &dyn VersionedStore,
    job_id: &str,
    candidate: i64,
    backoff: &BackoffPolicy,
    mut on_transient: impl FnMut(JobStatus) + Send,
) -> Result<(JobStateDoc, VersionToken), AssignError> {
    let mut failures: u32 = 0;
    loop {
        let (doc, token) = match store.get(job_id).await {
            Ok(read) => read,
            Err(e) => {
                warn!(job_id, candidate, error = %e, "assign read failed, backing off");
                on_transient(JobStatus::FailedToReadStore);
                tokio::time::sleep(backoff.delay(failures)).await;
                failures = failures.saturating_add(1);
                continue;
            }
        };

        if let Some(current) = doc.allocation {
            if candidate <= current {
                debug!(job_id, candidate, current, "assign rejected, newer claim exists");
                return Err(AssignError::Superseded {
                    job_id: job_id.to_string(),
                    candidate,
                    current,
                });
            }
        }

        let claimed = doc.with_allocation(candidate);
        match store.update(job_id, &claimed, token).await {
            Ok(new_token) => {
                debug!(job_id, candidate, token = %new_token, "allocation claimed");
                return Ok((claimed, new_token));
            }
            Err(StoreError::VersionConflict) => {
                // Someone wrote between our read and write. Re-read; the
                // comparison above decides against the latest claim.
                debug!(job_id, candidate, "assign conflicted, re-reading");
                tokio::time::sleep(backoff.delay(failures)).await;
                failures = failures.saturating_add(1);
            }
            Err(e) => {
                warn!(job_id, candidate, error = %e, "assign write failed, backing off");
                on_transient(JobStatus::FailedToWriteStore);
                tokio::time::sleep(backoff.delay(failures)).await;
                failures = failures.saturating_add(1);
            }
        }
    }
}
