//! Request submission: selected regions to engine requests.
//!
//! The ledger entry is created with the full region count before the first
//! request is handed to the engine, so a completion that races ahead of the
//! loop always finds its entry.  Every region that ends up not submitted
//! (engine error, full queue under `no_block`) is settled with exactly one
//! compensating decrement, so the frame still drains, only without results.

use std::sync::Arc;

use tracing::{debug, warn};

use vinfer_core::error::{EngineError, Result};
use vinfer_core::types::{Frame, ImageView};

use crate::collector::SelectedRegion;
use crate::dispatcher::ResultHandle;
use crate::ledger::FrameSeq;
use crate::metrics::StageMetrics;
use crate::model::ModelInstance;
use crate::stage::StageShared;

/// Result of submitting one frame.
#[derive(Debug)]
pub struct SubmitOutcome {
    pub seq: FrameSeq,
    /// Requests the engine accepted.
    pub submitted: usize,
    /// Regions settled without a request.
    pub skipped: usize,
    /// Stage-level error that aborted submission, if any.
    pub error: Option<EngineError>,
}

/// Submission policy for one stage.
#[derive(Clone, Copy, Debug, Default)]
pub struct RequestSubmitter {
    no_block: bool,
}

impl RequestSubmitter {
    pub fn new(no_block: bool) -> Self {
        Self { no_block }
    }

    /// Enqueue `frame` in the stage's ledger and submit one request per
    /// region.  Never forwards; the caller drains.
    pub fn submit(
        &self,
        stage: &Arc<StageShared>,
        model: &Arc<ModelInstance>,
        frame: Frame,
        regions: Vec<SelectedRegion>,
    ) -> SubmitOutcome {
        let ledger = &stage.ledger;
        let total = regions.len();
        if total == 0 {
            return SubmitOutcome {
                seq: ledger.enqueue(frame, 0),
                submitted: 0,
                skipped: 0,
                error: None,
            };
        }

        if self.no_block && model.engine.is_queue_full() {
            debug!(stage = %stage.name, regions = total, "Engine queue full, passing frame through");
            StageMetrics::add(&stage.metrics.skipped_backpressure, total as u64);
            return SubmitOutcome {
                seq: ledger.enqueue(frame, 0),
                submitted: 0,
                skipped: total,
                error: None,
            };
        }

        let image = match frame.buffer.map() {
            Ok(image) => image,
            Err(e) => {
                return SubmitOutcome {
                    seq: ledger.enqueue(frame, 0),
                    submitted: 0,
                    skipped: total,
                    error: Some(e),
                };
            }
        };

        let seq = ledger.enqueue(frame, total);
        let mut submitted = 0;
        let mut error = None;
        for selected in &regions {
            match self.submit_one(stage, model, seq, &image, selected) {
                Ok(()) => submitted += 1,
                Err(EngineError::QueueFull) if self.no_block => {
                    let remaining = total - submitted;
                    debug!(stage = %stage.name, seq = seq.0, remaining, "Engine queue full, skipping remaining regions");
                    StageMetrics::add(&stage.metrics.skipped_backpressure, remaining as u64);
                    break;
                }
                Err(e) => {
                    warn!(stage = %stage.name, seq = seq.0, error = %e, "Submission failed, frame forwards without results");
                    error = Some(e);
                    break;
                }
            }
        }
        StageMetrics::add(&stage.metrics.requests_submitted, submitted as u64);

        let skipped = total - submitted;
        for _ in 0..skipped {
            if let Err(e) = ledger.decrement(seq) {
                warn!(stage = %stage.name, seq = seq.0, error = %e, "Compensating decrement failed");
            }
        }
        SubmitOutcome {
            seq,
            submitted,
            skipped,
            error,
        }
    }

    fn submit_one(
        &self,
        stage: &Arc<StageShared>,
        model: &Arc<ModelInstance>,
        seq: FrameSeq,
        image: &ImageView,
        selected: &SelectedRegion,
    ) -> Result<()> {
        let crop = image.crop(selected.rect)?;
        let handle = ResultHandle {
            stage: Arc::clone(stage),
            seq,
            region: selected.region,
            roi: crop.roi(),
            model: Arc::clone(model),
        };
        if self.no_block {
            model
                .engine
                .try_submit_image(crop, handle, &model.preprocess)
        } else {
            model.engine.submit_image(crop, handle, &model.preprocess)
        }
    }
}
