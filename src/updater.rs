//! Job state updater: the orchestration tying arbitration, checkpoint
//! throttling and terminal persistence together for one worker instance.
//!
//! Each instance owns its private "last known document and token" cache.
//! The cache becomes unreliable the moment a newer allocation claims the
//! job; that is detected (not prevented) by the store's version check, and
//! every conflict is resolved by re-reading and checking whose allocation id
//! the document now carries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::arbiter::{self, AssignError};
use crate::checkpoint::{Checkpoint, CheckpointState, ProgressStats};
use crate::document::JobStateDoc;
use crate::job::{JobStatus, Outcome};
use crate::settings::JobSettings;
use crate::store::{StoreError, VersionToken, VersionedStore};
use crate::throttler::{CheckpointSink, CheckpointThrottler, SinkStatus};

#[derive(Debug, Error)]
pub enum FinishError {
    #[error("job {job_id} was taken over by allocation {current}")]
    Superseded { job_id: String, current: i64 },
    #[error("finish called before a successful assign for job {0}")]
    NotAssigned(String),
    #[error("finish already called for job {0}")]
    AlreadyFinished(String),
}

struct Inner {
    job_id: String,
    allocation_id: i64,
    store: Arc<dyn VersionedStore>,
    settings: JobSettings,
    /// Last document/token this instance successfully read or wrote.
    last_known: Mutex<Option<(JobStateDoc, VersionToken)>>,
    status: StdMutex<JobStatus>,
    lost: AtomicBool,
    finished: AtomicBool,
    on_lost: Box<dyn Fn() + Send + Sync>,
}

impl Inner {
    fn set_status(&self, status: JobStatus) {
        let mut guard = self.status.lock().unwrap();
        if *guard != status {
            debug!(job_id = %self.job_id, from = %*guard, to = %status, "status change");
            *guard = status;
        }
    }

    /// Mark this instance superseded and fire the driver callback once.
    fn mark_lost(&self) {
        if !self.lost.swap(true, Ordering::SeqCst) {
            self.set_status(JobStatus::AssignmentFailed);
            info!(
                job_id = %self.job_id,
                allocation = self.allocation_id,
                "allocation superseded, halting"
            );
            (self.on_lost)();
        }
    }

    /// Re-read after a conflict and decide whether we still own the job.
    /// Refreshes the cache when we do.
    async fn still_owner_after_conflict(&self) -> Result<bool, StoreError> {
        let (current, token) = self.store.get(&self.job_id).await?;
        let still_owner = current.allocation == Some(self.allocation_id);
        *self.last_known.lock().await = Some((current, token));
        if !still_owner {
            self.mark_lost();
        }
        Ok(still_owner)
    }
}

#[async_trait]
impl CheckpointSink for Inner {
    async fn persist_checkpoint(
        &self,
        checkpoint: Checkpoint,
        stats: ProgressStats,
    ) -> SinkStatus {
        if self.lost.load(Ordering::SeqCst) {
            return SinkStatus::Superseded;
        }
        let mut cache = self.last_known.lock().await;
        let Some((doc, token)) = cache.clone() else {
            warn!(job_id = %self.job_id, "checkpoint before assign, dropping");
            return SinkStatus::Active;
        };
        if let Some(existing) = &doc.checkpoint {
            if !existing.advanced_by(checkpoint) {
                debug!(
                    job_id = %self.job_id,
                    position = checkpoint.position,
                    stored = existing.position,
                    "stale checkpoint, skipping"
                );
                return SinkStatus::Active;
            }
        }
        let new_doc = doc.with_checkpoint(CheckpointState::new(checkpoint, stats));
        match self.store.update(&self.job_id, &new_doc, token).await {
            Ok(new_token) => {
                debug!(
                    job_id = %self.job_id,
                    position = checkpoint.position,
                    token = %new_token,
                    "checkpoint persisted"
                );
                *cache = Some((new_doc, new_token));
                self.set_status(JobStatus::Started);
                SinkStatus::Active
            }
            Err(StoreError::VersionConflict) => {
                drop(cache);
                // Either a rival claimed the job, or our own earlier write
                // landed without an acknowledgement. Re-read to find out;
                // when we are still the owner the conflicting payload is
                // skipped and the next checkpoint carries the progress.
                match self.still_owner_after_conflict().await {
                    Ok(true) => {
                        debug!(
                            job_id = %self.job_id,
                            position = checkpoint.position,
                            "benign checkpoint conflict, payload skipped"
                        );
                        SinkStatus::Active
                    }
                    Ok(false) => SinkStatus::Superseded,
                    Err(e) => {
                        warn!(job_id = %self.job_id, error = %e, "conflict re-read failed");
                        self.set_status(JobStatus::FailedToReadStore);
                        SinkStatus::Active
                    }
                }
            }
            Err(e) => {
                // Best effort: the next checkpoint supersedes this one, so a
                // lost write only delays durability, never fails the job.
                warn!(job_id = %self.job_id, error = %e, "checkpoint write failed, skipping");
                self.set_status(JobStatus::FailedToWriteStore);
                SinkStatus::Active
            }
        }
    }
}

/// Persists state for one job on behalf of one worker instance, identified
/// by the scheduler-provided allocation id.
pub struct JobStateUpdater {
    inner: Arc<Inner>,
    throttler: CheckpointThrottler,
}

impl JobStateUpdater {
    /// `on_lost` is invoked at most once, when a newer allocation is
    /// discovered to have taken over; the driver must stop on it.
    pub fn new(
        job_id: impl Into<String>,
        allocation_id: i64,
        store: Arc<dyn VersionedStore>,
        settings: JobSettings,
        on_lost: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        let interval = Duration::from_millis(settings.checkpoint_interval_ms);
        let inner = Arc::new(Inner {
            job_id: job_id.into(),
            allocation_id,
            store,
            settings,
            last_known: Mutex::new(None),
            status: StdMutex::new(JobStatus::Started),
            lost: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            on_lost: Box::new(on_lost),
        });
        let throttler =
            CheckpointThrottler::new(interval, Arc::clone(&inner) as Arc<dyn CheckpointSink>);
        Self { inner, throttler }
    }

    pub fn job_id(&self) -> &str {
        &self.inner.job_id
    }

    pub fn allocation_id(&self) -> i64 {
        self.inner.allocation_id
    }

    pub fn status(&self) -> JobStatus {
        *self.inner.status.lock().unwrap()
    }

    /// True once a newer allocation has been observed to own the job.
    pub fn is_superseded(&self) -> bool {
        self.inner.lost.load(Ordering::SeqCst)
    }

    /// Claim ownership of the job. Must succeed before any checkpoint or
    /// finish call; a rejection means a newer-or-equal allocation already
    /// owns the job and this worker must not start.
    pub async fn assign(&self) -> Result<JobStateDoc, AssignError> {
        let inner = &self.inner;
        let result = arbiter::claim(
            inner.store.as_ref(),
            &inner.job_id,
            inner.allocation_id,
            &inner.settings.backoff,
            |status| inner.set_status(status),
        )
        .await;
        match result {
            Ok((doc, token)) => {
                *inner.last_known.lock().await = Some((doc.clone(), token));
                inner.set_status(JobStatus::Started);
                Ok(doc)
            }
            Err(e) => {
                inner.lost.store(true, Ordering::SeqCst);
                inner.set_status(JobStatus::AssignmentFailed);
                Err(e)
            }
        }
    }

    /// Record progress. Non-blocking; writes are coalesced and rate-bounded
    /// by the throttler, and individually best-effort.
    pub fn on_checkpoint(&self, checkpoint: Checkpoint, stats: ProgressStats) {
        if self.inner.finished.load(Ordering::SeqCst) || self.is_superseded() {
            return;
        }
        self.throttler.accept(checkpoint, stats);
    }

    /// Persist the terminal outcome. Retries transient failures with backoff
    /// until the write lands or a newer allocation supersedes us: losing the
    /// terminal record would strand the job as apparently running forever,
    /// so a bounded recording delay is the lesser evil.
    pub async fn finish(&self, outcome: Outcome) -> Result<JobStateDoc, FinishError> {
        let inner = &self.inner;
        if inner.finished.swap(true, Ordering::SeqCst) {
            return Err(FinishError::AlreadyFinished(inner.job_id.clone()));
        }
        // Land the last coalesced checkpoint before the terminal write.
        self.throttler.close().await;

        if self.is_superseded() {
            return Err(self.superseded_error().await);
        }

        let mut failures: u32 = 0;
        loop {
            let cached = inner.last_known.lock().await.clone();
            let Some((doc, token)) = cached else {
                return Err(FinishError::NotAssigned(inner.job_id.clone()));
            };
            let terminal = doc.with_outcome(&outcome);
            match inner.store.update(&inner.job_id, &terminal, token).await {
                Ok(new_token) => {
                    *inner.last_known.lock().await = Some((terminal.clone(), new_token));
                    inner.set_status(JobStatus::Done);
                    info!(
                        job_id = %inner.job_id,
                        allocation = inner.allocation_id,
                        success = outcome.is_success(),
                        "terminal state persisted"
                    );
                    return Ok(terminal);
                }
                Err(StoreError::VersionConflict) => {
                    // A stale token alone does not mean the store is
                    // unhealthy: refresh and retry immediately, unless the
                    // re-read shows a new owner, in which case the job's
                    // fate belongs to them and we must not overwrite it.
                    match inner.still_owner_after_conflict().await {
                        Ok(true) => continue,
                        Ok(false) => {
                            warn!(
                                job_id = %inner.job_id,
                                allocation = inner.allocation_id,
                                "abandoning terminal write, job taken over"
                            );
                            return Err(self.superseded_error().await);
                        }
                        Err(e) => {
                            warn!(job_id = %inner.job_id, error = %e, "finish re-read failed");
                            inner.set_status(JobStatus::FailedToReadStore);
                            tokio::time::sleep(inner.settings.backoff.delay(failures)).await;
                            failures = failures.saturating_add(1);
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        job_id = %inner.job_id,
                        error = %e,
                        failures,
                        "terminal write failed, backing off"
                    );
                    inner.set_status(JobStatus::FailedToWriteStore);
                    tokio::time::sleep(inner.settings.backoff.delay(failures)).await;
                    failures = failures.saturating_add(1);
                    // Re-evaluate supersession before retrying; a rival may
                    // have claimed the job while the store was unhealthy.
                    match inner.still_owner_after_conflict().await {
                        Ok(true) => {}
                        Ok(false) => return Err(self.superseded_error().await),
                        Err(e) => {
                            debug!(job_id = %inner.job_id, error = %e, "refresh failed, will retry");
                        }
                    }
                }
            }
        }
    }

    /// Stop the throttler without a terminal write. For drivers halting on
    /// assignment loss.
    pub async fn shutdown(&self) {
        self.throttler.close().await;
    }

    async fn superseded_error(&self) -> FinishError {
        let current = self
            .inner
            .last_known
            .lock()
            .await
            .as_ref()
            .and_then(|(doc, _)| doc.allocation)
            .unwrap_or(-1);
        FinishError::Superseded {
            job_id: self.inner.job_id.clone(),
            current,
        }
    }
}
