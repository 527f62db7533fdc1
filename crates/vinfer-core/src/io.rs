//! Upstream and downstream frame contracts.

use std::sync::Mutex;

use crate::error::Result;
use crate::types::Frame;

/// Status returned by a downstream push.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FlowStatus {
    #[default]
    Ok,
    /// Downstream is flushing and drops data.
    Flushing,
    /// Downstream reached end of stream.
    Eos,
    /// Downstream failed.
    Error,
}

impl FlowStatus {
    #[inline]
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

/// Produces frames for one stream.
pub trait FrameSource: Send + 'static {
    /// Next frame, or `None` at end of stream.
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

/// Receives frames forwarded by a stage, strictly in arrival order.
///
/// `push` may be called from any thread, but never concurrently for the
/// same stage.
pub trait FrameSink: Send + Sync {
    fn push(&self, frame: Frame) -> FlowStatus;

    /// Called once after the last frame.
    fn end_of_stream(&self) {}
}

/// Sink that keeps every forwarded frame in memory.
#[derive(Default)]
pub struct CollectingSink {
    frames: Mutex<Vec<Frame>>,
    status: Mutex<FlowStatus>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent push return `status`.
    pub fn set_status(&self, status: FlowStatus) {
        *self
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = status;
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Indices of the frames received so far, in receive order.
    pub fn indices(&self) -> Vec<u64> {
        self.lock().iter().map(|f| f.index).collect()
    }

    /// Take all received frames.
    pub fn take(&self) -> Vec<Frame> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Frame>> {
        self.frames
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl FrameSink for CollectingSink {
    fn push(&self, frame: Frame) -> FlowStatus {
        self.lock().push(frame);
        *self
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
