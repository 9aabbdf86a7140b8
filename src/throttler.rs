//! Checkpoint write throttling.
//!
//! The driver reports progress far more often than the store should be
//! written. The throttler keeps a single pending slot that newer checkpoints
//! overwrite (last-write-wins coalescing) and a dedicated flush task that
//! drains the slot at most once per configured interval, so exactly one
//! durable write is in flight at a time and the driver never blocks on one.
//!
//! `close()` flushes whatever is pending before returning, so the final
//! checkpoint before a terminal write is never lost.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::checkpoint::{Checkpoint, ProgressStats};

/// What the sink learned about our ownership while flushing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkStatus {
    /// Keep flushing future checkpoints.
    Active,
    /// A newer allocation owns the job; stop flushing for good.
    Superseded,
}

/// Receives coalesced checkpoints from the flush task. Implemented by the
/// job state updater; a flush that fails transiently still reports `Active`
/// because the next checkpoint supersedes the lost one anyway.
#[async_trait]
pub trait CheckpointSink: Send + Sync {
    async fn persist_checkpoint(&self, checkpoint: Checkpoint, stats: ProgressStats)
        -> SinkStatus;
}

struct Shared {
    pending: Mutex<Option<(Checkpoint, ProgressStats)>>,
    notify: Notify,
    running: AtomicBool,
    halted: AtomicBool,
    interval: Duration,
}

pub struct CheckpointThrottler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CheckpointThrottler {
    /// Spawn the flush task. `interval` is the minimum spacing between
    /// durable checkpoint writes.
    pub fn new(interval: Duration, sink: Arc<dyn CheckpointSink>) -> Self {
        let shared = Arc::new(Shared {
            pending: Mutex::new(None),
            notify: Notify::new(),
            running: AtomicBool::new(true),
            halted: AtomicBool::new(false),
            interval,
        });
        let worker = tokio::spawn(flush_loop(Arc::clone(&shared), sink));
        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Record the latest checkpoint, replacing any not-yet-flushed one.
    /// Never blocks. Dropped silently once closed or superseded.
    pub fn accept(&self, checkpoint: Checkpoint, stats: ProgressStats) {
        if !self.shared.running.load(Ordering::Acquire) || self.is_halted() {
            debug!(position = checkpoint.position, "checkpoint dropped, throttler inactive");
            return;
        }
        *self.shared.pending.lock().unwrap() = Some((checkpoint, stats));
        self.shared.notify.notify_one();
    }

    /// True once the sink reported supersession.
    pub fn is_halted(&self) -> bool {
        self.shared.halted.load(Ordering::Acquire)
    }

    /// Flush any pending checkpoint and stop the flush task. Idempotent.
    pub async fn close(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.notify.notify_one();
        let worker = self.worker.lock().unwrap().take();
        if let Some(handle) = worker {
            let _ = handle.await;
        }
    }
}

async fn flush_loop(shared: Arc<Shared>, sink: Arc<dyn CheckpointSink>) {
    let mut last_flush: Option<Instant> = None;
    loop {
        // Wait for a payload or a shutdown request.
        loop {
            let notified = shared.notify.notified();
            let has_pending = shared.pending.lock().unwrap().is_some();
            if has_pending || !shared.running.load(Ordering::Acquire) {
                break;
            }
            notified.await;
        }

        // Space writes out by the interval; a shutdown request skips the
        // remainder so close() flushes promptly.
        if let Some(at) = last_flush {
            let remaining = shared.interval.saturating_sub(at.elapsed());
            if !remaining.is_zero() && shared.running.load(Ordering::Acquire) {
                let shutdown = async {
                    loop {
                        shared.notify.notified().await;
                        if !shared.running.load(Ordering::Acquire) {
                            break;
                        }
                    }
                };
                tokio::select! {
                    _ = tokio::time::sleep(remaining) => {}
                    _ = shutdown => {}
                }
            }
        }

        let payload = shared.pending.lock().unwrap().take();
        match payload {
            Some((checkpoint, stats)) if !shared.halted.load(Ordering::Acquire) => {
                match sink.persist_checkpoint(checkpoint, stats).await {
                    SinkStatus::Active => {
                        last_flush = Some(Instant::now());
                    }
                    SinkStatus::Superseded => {
                        shared.halted.store(true, Ordering::Release);
                        shared.pending.lock().unwrap().take();
                        debug!("checkpoint flushing halted, allocation superseded");
                    }
                }
            }
            _ => {}
        }

        if !shared.running.load(Ordering::Acquire)
            && (shared.pending.lock().unwrap().is_none() || shared.halted.load(Ordering::Acquire))
        {
            return;
        }
        if shared.halted.load(Ordering::Acquire) {
            // Drop anything accepted concurrently and wait for close().
            shared.pending.lock().unwrap().take();
        }
    }
}
