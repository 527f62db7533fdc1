//! Completion dispatch on engine worker threads.
//!
//! For each completed batch the dispatcher:
//!
//! 1. resolves every handle's write target through the stage's ledger
//!    (copy-on-write at most once per frame),
//! 2. runs the model's post-processor once for the batch,
//! 3. settles one pending request per handle,
//! 4. drains every stage touched by the batch.
//!
//! Steps 3 and 4 run whatever happened in steps 1 and 2, so a failing
//! converter costs a frame its results but never stalls the stream.  Errors
//! stop here; nothing is propagated into the engine thread.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, warn};

use vinfer_core::backend::{CompletionHandler, RegionTarget};
use vinfer_core::error::EngineError;
use vinfer_core::types::{Rect, RegionRef, TensorMap};

use crate::ledger::FrameSeq;
use crate::metrics::StageMetrics;
use crate::model::ModelInstance;
use crate::stage::StageShared;

/// One in-flight request: which frame and region its result belongs to.
///
/// Holds no buffer reference, so outstanding requests never make a frame
/// look shared.
pub struct ResultHandle {
    pub(crate) stage: Arc<StageShared>,
    pub(crate) seq: FrameSeq,
    pub(crate) region: RegionRef,
    pub(crate) roi: Rect,
    pub(crate) model: Arc<ModelInstance>,
}

impl ResultHandle {
    /// Ledger sequence number of the frame this request belongs to.
    pub fn seq(&self) -> FrameSeq {
        self.seq
    }
}

/// [`CompletionHandler`] wired into every engine the registry builds.
#[derive(Clone, Copy, Debug, Default)]
pub struct CompletionDispatcher;

impl CompletionDispatcher {
    pub fn new() -> Self {
        Self
    }

    fn settle(handles: &[ResultHandle]) {
        for handle in handles {
            if let Err(e) = handle.stage.ledger.decrement(handle.seq) {
                error!(stage = %handle.stage.name, error = %e, "Failed to settle request");
            }
        }
        for stage in Self::distinct_stages(handles) {
            stage.ledger.drain();
        }
    }

    fn distinct_stages(handles: &[ResultHandle]) -> Vec<&Arc<StageShared>> {
        let mut stages: Vec<&Arc<StageShared>> = Vec::new();
        for handle in handles {
            if !stages.iter().any(|s| Arc::ptr_eq(s, &handle.stage)) {
                stages.push(&handle.stage);
            }
        }
        stages
    }

    fn postprocess(outputs: &TensorMap, handles: &[ResultHandle]) {
        let Some(model) = handles.first().map(|h| Arc::clone(&h.model)) else {
            return;
        };

        let mut targets = Vec::with_capacity(handles.len());
        for (batch_index, handle) in handles.iter().enumerate() {
            match handle.stage.ledger.writable_buffer(handle.seq) {
                Ok(buffer) => targets.push(RegionTarget {
                    batch_index,
                    buffer,
                    region: handle.region,
                    roi: handle.roi,
                }),
                Err(e) => {
                    error!(stage = %handle.stage.name, seq = handle.seq.0, error = %e, "No write target for result");
                }
            }
        }

        let start = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(|| {
            model
                .postprocess
                .process(outputs, &targets, &model.config.output_descriptors)
        }))
        .unwrap_or_else(|payload| {
            Err(EngineError::PanicRecovered {
                stage: "postprocess",
                message: panic_message(payload.as_ref()),
            })
        });
        let elapsed_us = start.elapsed().as_micros() as u64;
        drop(targets);

        let stages = Self::distinct_stages(handles);
        for stage in &stages {
            StageMetrics::add(&stage.metrics.postprocess_total_us, elapsed_us);
        }
        if let Err(e) = result {
            for stage in &stages {
                StageMetrics::add(&stage.metrics.postprocess_errors, 1);
            }
            warn!(
                model = %model.instance_id,
                requests = handles.len(),
                error = %e.chain(),
                "Post-processing failed; frames forward without results"
            );
        }
    }
}

impl CompletionHandler<ResultHandle> for CompletionDispatcher {
    fn on_completed(&self, outputs: TensorMap, handles: Vec<ResultHandle>) {
        Self::postprocess(&outputs, &handles);
        for handle in &handles {
            StageMetrics::add(&handle.stage.metrics.requests_completed, 1);
        }
        Self::settle(&handles);
    }

    fn on_failed(&self, handles: Vec<ResultHandle>, error: EngineError) {
        warn!(
            requests = handles.len(),
            error = %error.chain(),
            "Inference batch failed; frames forward without results"
        );
        for handle in &handles {
            StageMetrics::add(&handle.stage.metrics.requests_failed, 1);
        }
        Self::settle(&handles);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".into()
    }
}
