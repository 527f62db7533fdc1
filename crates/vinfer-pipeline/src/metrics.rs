//! Per-stage atomic counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::info;

use vinfer_core::error::{EngineError, Result};

/// Atomic counters for one inference stage.
///
/// Written from the stage's arrival thread and from engine worker threads.
#[derive(Debug, Default)]
pub struct StageMetrics {
    /// Frames handed to `submit`.
    pub frames_in: AtomicU64,
    /// Frames pushed downstream.
    pub frames_forwarded: AtomicU64,
    /// Frames passed through without inference because of the interval.
    pub frames_skipped_interval: AtomicU64,
    /// Requests accepted by the engine.
    pub requests_submitted: AtomicU64,
    /// Requests whose results were post-processed.
    pub requests_completed: AtomicU64,
    /// Requests the engine reported as failed.
    pub requests_failed: AtomicU64,
    /// Regions skipped because the engine queue was full under `no_block`.
    pub skipped_backpressure: AtomicU64,
    /// Batches whose post-processing failed or panicked.
    pub postprocess_errors: AtomicU64,
    /// Copy-on-write duplications of frame buffers.
    pub duplications: AtomicU64,
    /// Cumulative post-processing wall-clock time in microseconds.
    pub postprocess_total_us: AtomicU64,
}

impl StageMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StageMetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Acquire);
        StageMetricsSnapshot {
            frames_in: load(&self.frames_in),
            frames_forwarded: load(&self.frames_forwarded),
            frames_skipped_interval: load(&self.frames_skipped_interval),
            requests_submitted: load(&self.requests_submitted),
            requests_completed: load(&self.requests_completed),
            requests_failed: load(&self.requests_failed),
            skipped_backpressure: load(&self.skipped_backpressure),
            postprocess_errors: load(&self.postprocess_errors),
            duplications: load(&self.duplications),
            postprocess_total_us: load(&self.postprocess_total_us),
        }
    }

    /// Log a one-line summary for `stage`.
    pub fn report(&self, stage: &str) {
        let s = self.snapshot();
        let done = s.requests_completed;
        info!(
            stage,
            frames_in = s.frames_in,
            frames_forwarded = s.frames_forwarded,
            skipped_interval = s.frames_skipped_interval,
            submitted = s.requests_submitted,
            completed = done,
            failed = s.requests_failed,
            skipped_backpressure = s.skipped_backpressure,
            postprocess_errors = s.postprocess_errors,
            duplications = s.duplications,
            postprocess_avg_us = if done > 0 { s.postprocess_total_us / done } else { 0 },
            "Stage summary"
        );
    }
}

/// Point-in-time copy of [`StageMetrics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StageMetricsSnapshot {
    pub frames_in: u64,
    pub frames_forwarded: u64,
    pub frames_skipped_interval: u64,
    pub requests_submitted: u64,
    pub requests_completed: u64,
    pub requests_failed: u64,
    pub skipped_backpressure: u64,
    pub postprocess_errors: u64,
    pub duplications: u64,
    pub postprocess_total_us: u64,
}

impl StageMetricsSnapshot {
    /// Accounting that must hold once a stage is flushed: every frame that
    /// entered left, and every submitted request either completed or failed.
    pub fn validate_drained(&self) -> Result<()> {
        if self.frames_forwarded != self.frames_in {
            return Err(EngineError::InvariantViolation(format!(
                "Stage accounting violation: frames_in={} frames_forwarded={}",
                self.frames_in, self.frames_forwarded
            )));
        }
        let settled = self.requests_completed + self.requests_failed;
        if settled != self.requests_submitted {
            return Err(EngineError::InvariantViolation(format!(
                "Stage accounting violation: submitted={} completed={} failed={}",
                self.requests_submitted, self.requests_completed, self.requests_failed
            )));
        }
        Ok(())
    }
}
