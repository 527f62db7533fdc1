//! Inference metrics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters for engine observability.
#[derive(Debug)]
pub struct InferenceMetrics {
    /// Total images inferred.
    pub images_inferred: AtomicU64,
    /// Total batches run.
    pub batches: AtomicU64,
    /// Images whose batch failed (pre-processing or model error).
    pub images_failed: AtomicU64,
    /// Cumulative inference time in microseconds (for avg latency).
    pub total_inference_us: AtomicU64,
    /// Peak single-batch inference time in microseconds.
    pub peak_inference_us: AtomicU64,
}

impl InferenceMetrics {
    pub const fn new() -> Self {
        Self {
            images_inferred: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            images_failed: AtomicU64::new(0),
            total_inference_us: AtomicU64::new(0),
            peak_inference_us: AtomicU64::new(0),
        }
    }

    pub fn record(&self, batch_len: usize, elapsed_us: u64) {
        self.images_inferred
            .fetch_add(batch_len as u64, Ordering::Relaxed);
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.total_inference_us
            .fetch_add(elapsed_us, Ordering::Relaxed);
        self.peak_inference_us
            .fetch_max(elapsed_us, Ordering::Relaxed);
    }

    pub fn record_failure(&self, images: usize) {
        self.images_failed
            .fetch_add(images as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> InferenceMetricsSnapshot {
        let images = self.images_inferred.load(Ordering::Relaxed);
        let batches = self.batches.load(Ordering::Relaxed);
        let total = self.total_inference_us.load(Ordering::Relaxed);
        InferenceMetricsSnapshot {
            images_inferred: images,
            batches,
            images_failed: self.images_failed.load(Ordering::Relaxed),
            avg_batch_us: if batches > 0 { total / batches } else { 0 },
            peak_batch_us: self.peak_inference_us.load(Ordering::Relaxed),
        }
    }
}

impl Default for InferenceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of inference metrics for reporting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InferenceMetricsSnapshot {
    pub images_inferred: u64,
    pub batches: u64,
    pub images_failed: u64,
    pub avg_batch_us: u64,
    pub peak_batch_us: u64,
}

impl InferenceMetricsSnapshot {
    /// Mean number of images per batch.
    pub fn avg_batch_size(&self) -> f64 {
        if self.batches == 0 {
            0.0
        } else {
            self.images_inferred as f64 / self.batches as f64
        }
    }
}
