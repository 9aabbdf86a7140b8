use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reflow::backoff::BackoffPolicy;
use reflow::checkpoint::{Checkpoint, ProgressStats};
use reflow::document::JobStateDoc;
use reflow::job::{JobFailure, JobRequest, JobStatus, Outcome, ReindexResponse};
use reflow::settings::JobSettings;
use reflow::store::{MemoryStore, StoreError, VersionToken, VersionedStore};
use reflow::updater::{FinishError, JobStateUpdater};

const JOB: &str = "j1";

fn settings() -> JobSettings {
    JobSettings {
        checkpoint_interval_ms: 1,
        backoff: BackoffPolicy {
            initial_ms: 1,
            factor: 2.0,
            clamp_threshold_ms: 8,
            ceiling_ms: 8,
        },
    }
}

fn seeded_store() -> Arc<MemoryStore> {
    let store = MemoryStore::new_arc();
    let doc = JobStateDoc::new(JobRequest::new(vec!["src".to_string()], "dest"), Vec::new());
    store.insert(JOB, &doc).unwrap();
    store
}

fn stats_with(created: u64) -> ProgressStats {
    ProgressStats {
        total: 1_000,
        created,
        batches: created / 100 + 1,
        ..Default::default()
    }
}

fn updater_with(
    store: Arc<dyn VersionedStore>,
    allocation: i64,
    lost_count: &Arc<AtomicUsize>,
) -> JobStateUpdater {
    let lost = Arc::clone(lost_count);
    JobStateUpdater::new(JOB, allocation, store, settings(), move || {
        lost.fetch_add(1, Ordering::SeqCst);
    })
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition never held: {what}");
}

/// Applies the first update after arming, but reports a version conflict
/// anyway: the write landed and the acknowledgement was lost.
struct LostAckStore {
    inner: Arc<MemoryStore>,
    armed: AtomicBool,
    dropped_ack: AtomicBool,
}

#[async_trait]
impl VersionedStore for LostAckStore {
    async fn get(&self, job_id: &str) -> Result<(JobStateDoc, VersionToken), StoreError> {
        self.inner.get(job_id).await
    }

    async fn update(
        &self,
        job_id: &str,
        doc: &JobStateDoc,
        expected: VersionToken,
    ) -> Result<VersionToken, StoreError> {
        let result = self.inner.update(job_id, doc, expected).await;
        if self.armed.load(Ordering::SeqCst) && !self.dropped_ack.swap(true, Ordering::SeqCst) {
            result?;
            return Err(StoreError::VersionConflict);
        }
        result
    }
}

/// Fails updates with transient write failures while armed, up to a budget.
struct FlakyWriteStore {
    inner: Arc<MemoryStore>,
    armed: AtomicBool,
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
}

#[async_trait]
impl VersionedStore for FlakyWriteStore {
    async fn get(&self, job_id: &str) -> Result<(JobStateDoc, VersionToken), StoreError> {
        self.inner.get(job_id).await
    }

    async fn update(
        &self,
        job_id: &str,
        doc: &JobStateDoc,
        expected: VersionToken,
    ) -> Result<VersionToken, StoreError> {
        if self.armed.load(Ordering::SeqCst) {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures_left.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_left.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::WriteFailure("injected".to_string()));
            }
        }
        self.inner.update(job_id, doc, expected).await
    }
}

#[reflow::test(start_paused = true)]
async fn assign_claims_the_job_and_reports_started() {
    let store = seeded_store();
    let lost = Arc::new(AtomicUsize::new(0));
    let updater = updater_with(store.clone(), 10, &lost);

    let doc = updater.assign().await.unwrap();
    assert_eq!(doc.allocation, Some(10));
    assert_eq!(updater.status(), JobStatus::Started);
    assert_eq!(store.snapshot(JOB).unwrap().allocation, Some(10));
}

#[reflow::test(start_paused = true)]
async fn rejected_assign_marks_this_instance_failed() {
    let store = seeded_store();
    let lost = Arc::new(AtomicUsize::new(0));
    let rival = updater_with(store.clone(), 10, &lost);
    rival.assign().await.unwrap();

    let late = updater_with(store.clone(), 9, &lost);
    assert!(late.assign().await.is_err());
    assert_eq!(late.status(), JobStatus::AssignmentFailed);
    assert!(late.is_superseded());
    // Assignment rejection is surfaced through the failed call, not the
    // mid-run lost callback.
    assert_eq!(lost.load(Ordering::SeqCst), 0);
}

#[reflow::test(start_paused = true)]
async fn checkpoints_persist_through_the_throttler() {
    let store = seeded_store();
    let lost = Arc::new(AtomicUsize::new(0));
    let updater = updater_with(store.clone(), 10, &lost);
    updater.assign().await.unwrap();

    updater.on_checkpoint(Checkpoint::new(5), stats_with(500));
    eventually("checkpoint 5 persisted", || {
        store.snapshot(JOB).unwrap().checkpoint.map(|c| c.position) == Some(5)
    })
    .await;
    let state = store.snapshot(JOB).unwrap().checkpoint.unwrap();
    assert_eq!(state.stats.created, 500);
    updater.shutdown().await;
}

#[reflow::test(start_paused = true)]
async fn a_checkpoint_that_does_not_advance_is_never_written() {
    let store = seeded_store();
    let lost = Arc::new(AtomicUsize::new(0));
    let updater = updater_with(store.clone(), 10, &lost);
    updater.assign().await.unwrap();

    updater.on_checkpoint(Checkpoint::new(5), stats_with(500));
    eventually("checkpoint 5 persisted", || {
        store.snapshot(JOB).unwrap().checkpoint.map(|c| c.position) == Some(5)
    })
    .await;

    updater.on_checkpoint(Checkpoint::new(3), stats_with(300));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(
        store.snapshot(JOB).unwrap().checkpoint.unwrap().position,
        5
    );
    updater.shutdown().await;
}

#[reflow::test(start_paused = true)]
async fn benign_conflict_skips_the_payload_and_keeps_going() {
    let inner = seeded_store();
    let store = Arc::new(LostAckStore {
        inner: Arc::clone(&inner),
        armed: AtomicBool::new(false),
        dropped_ack: AtomicBool::new(false),
    });
    let lost = Arc::new(AtomicUsize::new(0));
    let updater = updater_with(store.clone(), 10, &lost);
    updater.assign().await.unwrap();
    store.armed.store(true, Ordering::SeqCst);

    // The write lands but is acknowledged as a conflict; the re-read finds
    // our allocation intact, so the payload is skipped, not retried.
    updater.on_checkpoint(Checkpoint::new(5), stats_with(500));
    eventually("checkpoint 5 landed despite lost ack", || {
        inner.snapshot(JOB).unwrap().checkpoint.map(|c| c.position) == Some(5)
    })
    .await;
    assert_eq!(lost.load(Ordering::SeqCst), 0);
    assert!(!updater.is_superseded());

    // The next checkpoint proceeds normally off the refreshed token.
    updater.on_checkpoint(Checkpoint::new(6), stats_with(600));
    eventually("checkpoint 6 persisted", || {
        inner.snapshot(JOB).unwrap().checkpoint.map(|c| c.position) == Some(6)
    })
    .await;
    updater.shutdown().await;
}

#[reflow::test(start_paused = true)]
async fn a_rival_claim_halts_the_old_worker_without_a_write() {
    let store = seeded_store();
    let lost = Arc::new(AtomicUsize::new(0));
    let updater = updater_with(store.clone(), 10, &lost);
    updater.assign().await.unwrap();

    updater.on_checkpoint(Checkpoint::new(5), stats_with(500));
    eventually("checkpoint 5 persisted", || {
        store.snapshot(JOB).unwrap().checkpoint.map(|c| c.position) == Some(5)
    })
    .await;

    let rival_lost = Arc::new(AtomicUsize::new(0));
    let rival = updater_with(store.clone(), 11, &rival_lost);
    rival.assign().await.unwrap();

    // The stale worker's next checkpoint conflicts, discovers allocation 11
    // and halts without writing offset 6.
    updater.on_checkpoint(Checkpoint::new(6), stats_with(600));
    eventually("old worker noticed supersession", || {
        lost.load(Ordering::SeqCst) == 1
    })
    .await;
    assert!(updater.is_superseded());
    assert_eq!(updater.status(), JobStatus::AssignmentFailed);

    let doc = store.snapshot(JOB).unwrap();
    assert_eq!(doc.allocation, Some(11));
    assert_eq!(doc.checkpoint.unwrap().position, 5);

    // Further checkpoints from the stale worker never reach the store.
    updater.on_checkpoint(Checkpoint::new(7), stats_with(700));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(store.snapshot(JOB).unwrap().checkpoint.unwrap().position, 5);
    assert_eq!(lost.load(Ordering::SeqCst), 1);
    updater.shutdown().await;
    rival.shutdown().await;
}

#[reflow::test(start_paused = true)]
async fn finish_persists_the_success_response() {
    let store = seeded_store();
    let lost = Arc::new(AtomicUsize::new(0));
    let updater = updater_with(store.clone(), 10, &lost);
    updater.assign().await.unwrap();

    let outcome = Outcome::Success(ReindexResponse {
        took_ms: 42,
        stats: stats_with(1_000),
    });
    let terminal = updater.finish(outcome).await.unwrap();
    assert_eq!(updater.status(), JobStatus::Done);
    assert!(terminal.is_done());

    let doc = store.snapshot(JOB).unwrap();
    assert_eq!(doc.response.unwrap().stats.created, 1_000);
    assert_eq!(doc.exception, None);
    assert_eq!(doc.failure_rest_status, None);
}

#[reflow::test(start_paused = true)]
async fn finish_persists_the_failure_with_its_status_code() {
    let store = seeded_store();
    let lost = Arc::new(AtomicUsize::new(0));
    let updater = updater_with(store.clone(), 10, &lost);
    updater.assign().await.unwrap();

    let outcome = Outcome::Failure {
        failure: JobFailure {
            error_type: "version_conflict_engine".to_string(),
            reason: "document changed underneath".to_string(),
        },
        rest_status: 409,
    };
    updater.finish(outcome).await.unwrap();

    let doc = store.snapshot(JOB).unwrap();
    assert_eq!(doc.response, None);
    assert_eq!(doc.failure_rest_status, Some(409));
    assert_eq!(doc.exception.unwrap().error_type, "version_conflict_engine");
}

#[reflow::test(start_paused = true)]
async fn finish_retries_until_a_flaky_store_recovers() {
    let inner = seeded_store();
    let store = Arc::new(FlakyWriteStore {
        inner: Arc::clone(&inner),
        armed: AtomicBool::new(false),
        failures_left: AtomicUsize::new(3),
        attempts: AtomicUsize::new(0),
    });
    let lost = Arc::new(AtomicUsize::new(0));
    let updater = updater_with(store.clone(), 10, &lost);
    updater.assign().await.unwrap();
    store.armed.store(true, Ordering::SeqCst);

    let outcome = Outcome::Success(ReindexResponse {
        took_ms: 42,
        stats: stats_with(1_000),
    });
    updater.finish(outcome).await.unwrap();

    assert_eq!(store.attempts.load(Ordering::SeqCst), 4);
    let doc = inner.snapshot(JOB).unwrap();
    assert_eq!(doc.response.unwrap().stats.processed(), 1_000);
    assert_eq!(doc.exception, None);
    assert_eq!(updater.status(), JobStatus::Done);
}

#[reflow::test(start_paused = true)]
async fn finish_abandons_the_write_when_superseded() {
    let store = seeded_store();
    let lost = Arc::new(AtomicUsize::new(0));
    let updater = updater_with(store.clone(), 10, &lost);
    updater.assign().await.unwrap();

    let rival_lost = Arc::new(AtomicUsize::new(0));
    let rival = updater_with(store.clone(), 11, &rival_lost);
    rival.assign().await.unwrap();

    let outcome = Outcome::Success(ReindexResponse {
        took_ms: 42,
        stats: stats_with(1_000),
    });
    let err = updater.finish(outcome).await.unwrap_err();
    assert!(matches!(
        err,
        FinishError::Superseded { current: 11, .. }
    ));
    assert_eq!(lost.load(Ordering::SeqCst), 1);

    // The newer owner's document is untouched by the abandoned write.
    let doc = store.snapshot(JOB).unwrap();
    assert_eq!(doc.allocation, Some(11));
    assert!(!doc.is_done());
    rival.shutdown().await;
}

#[reflow::test(start_paused = true)]
async fn finish_lands_the_last_coalesced_checkpoint_first() {
    let store = seeded_store();
    let lost = Arc::new(AtomicUsize::new(0));
    let updater = JobStateUpdater::new(
        JOB,
        10,
        store.clone() as Arc<dyn VersionedStore>,
        JobSettings {
            // Far apart, so the second checkpoint is still pending at finish.
            checkpoint_interval_ms: 3_600_000,
            ..settings()
        },
        {
            let lost = Arc::clone(&lost);
            move || {
                lost.fetch_add(1, Ordering::SeqCst);
            }
        },
    );
    updater.assign().await.unwrap();

    updater.on_checkpoint(Checkpoint::new(5), stats_with(500));
    eventually("checkpoint 5 persisted", || {
        store.snapshot(JOB).unwrap().checkpoint.map(|c| c.position) == Some(5)
    })
    .await;
    updater.on_checkpoint(Checkpoint::new(7), stats_with(700));

    let outcome = Outcome::Success(ReindexResponse {
        took_ms: 42,
        stats: stats_with(1_000),
    });
    updater.finish(outcome).await.unwrap();

    let doc = store.snapshot(JOB).unwrap();
    assert_eq!(doc.checkpoint.unwrap().position, 7);
    assert!(doc.response.is_some());
}

#[reflow::test(start_paused = true)]
async fn finish_can_only_be_called_once() {
    let store = seeded_store();
    let lost = Arc::new(AtomicUsize::new(0));
    let updater = updater_with(store.clone(), 10, &lost);
    updater.assign().await.unwrap();

    let outcome = Outcome::Success(ReindexResponse {
        took_ms: 42,
        stats: stats_with(1_000),
    });
    updater.finish(outcome.clone()).await.unwrap();
    assert!(matches!(
        updater.finish(outcome).await,
        Err(FinishError::AlreadyFinished(_))
    ));
}

#[reflow::test(start_paused = true)]
async fn checkpoints_after_finish_are_ignored() {
    let store = seeded_store();
    let lost = Arc::new(AtomicUsize::new(0));
    let updater = updater_with(store.clone(), 10, &lost);
    updater.assign().await.unwrap();

    let outcome = Outcome::Success(ReindexResponse {
        took_ms: 42,
        stats: stats_with(1_000),
    });
    updater.finish(outcome).await.unwrap();

    updater.on_checkpoint(Checkpoint::new(99), stats_with(999));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(store.snapshot(JOB).unwrap().checkpoint, None);
}
