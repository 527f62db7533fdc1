//! Inference engine contract and the pre/post-processing hooks around it.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::types::{BufferHandle, ImageView, RegionRef, Rect, TensorMap};

// ─── Model precision ─────────────────────────────────────────────────────────

/// Which floating-point precision an output layer is produced in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelPrecision {
    /// 32-bit single-precision float.
    #[default]
    F32,
    /// 16-bit half-precision float.
    F16,
    /// 8-bit unsigned integer.
    U8,
}

/// Description of one model output layer, as supplied by the model
/// descriptor file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerDescriptor {
    pub name: String,
    #[serde(default)]
    pub precision: ModelPrecision,
    /// Class labels indexed by label id.
    #[serde(default)]
    pub labels: Vec<String>,
}

impl LayerDescriptor {
    pub fn label(&self, id: usize) -> Option<&str> {
        self.labels.get(id).map(String::as_str)
    }
}

// ─── Processing hooks ────────────────────────────────────────────────────────

/// Hook run on the engine worker before an image enters the model.
pub trait PreProcessor: Send + Sync {
    fn preprocess(&self, _image: &mut ImageView) -> Result<()> {
        Ok(())
    }
}

/// Pre-processor that leaves images untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityPreProcessor;

impl PreProcessor for IdentityPreProcessor {}

/// Where one batch item's results must be written.
#[derive(Clone, Debug)]
pub struct RegionTarget {
    /// Row of every output tensor that belongs to this item.
    pub batch_index: usize,
    /// Writable buffer (original or copy-on-write duplicate).
    pub buffer: BufferHandle,
    pub region: RegionRef,
    /// Rectangle that was submitted, in frame coordinates.
    pub roi: Rect,
}

/// Turns raw output tensors into metadata attached to buffers.
///
/// Called once per completed batch on an engine worker thread.
pub trait PostProcessor: Send + Sync {
    fn process(
        &self,
        outputs: &TensorMap,
        targets: &[RegionTarget],
        layers: &[LayerDescriptor],
    ) -> Result<()>;
}

/// Post-processor that attaches nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopPostProcessor;

impl PostProcessor for NoopPostProcessor {
    fn process(&self, _: &TensorMap, _: &[RegionTarget], _: &[LayerDescriptor]) -> Result<()> {
        Ok(())
    }
}

// ─── Engine ──────────────────────────────────────────────────────────────────

/// Receives results from an [`InferenceEngine`] on its worker threads.
///
/// Implementations must not panic out of either callback and must not block
/// on the engine they are attached to.
pub trait CompletionHandler<H>: Send + Sync {
    /// One batch finished.  Row `i` of every output belongs to `handles[i]`.
    fn on_completed(&self, outputs: TensorMap, handles: Vec<H>);
    /// One batch could not be run.  Every handle is returned.
    fn on_failed(&self, handles: Vec<H>, error: EngineError);
}

/// Asynchronous inference backend.
///
/// `H` is the caller's per-request handle; the engine returns it untouched
/// through the [`CompletionHandler`] it was built with.
pub trait InferenceEngine<H>: Send + Sync {
    /// Enqueue one image.  Blocks while the request queue is full.
    fn submit_image(
        &self,
        image: ImageView,
        handle: H,
        preprocess: &std::sync::Arc<dyn PreProcessor>,
    ) -> Result<()>;

    /// Enqueue one image without blocking.
    ///
    /// Fails with [`EngineError::QueueFull`] when no request slot is free.
    fn try_submit_image(
        &self,
        image: ImageView,
        handle: H,
        preprocess: &std::sync::Arc<dyn PreProcessor>,
    ) -> Result<()>;

    fn is_queue_full(&self) -> bool;

    /// Block until every accepted request has completed and its callback
    /// has returned.
    fn flush(&self);

    /// Stop accepting requests, finish the queue and join workers.
    /// Idempotent.
    fn shutdown(&self);

    fn name(&self) -> &str;
}
