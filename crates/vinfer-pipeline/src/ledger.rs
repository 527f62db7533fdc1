//! Output ledger: per-frame pending counts and strict in-order forwarding.
//!
//! # Entry lifecycle
//!
//! ```text
//! enqueue(pending = N) ──► N × decrement ──► pending = 0 ──► drain: push + pop
//! ```
//!
//! No other transition exists.  The pending count is fixed at enqueue and
//! only ever decremented; an entry leaves the queue only from the front.
//!
//! # Ordering
//!
//! Downstream pushes happen while the ledger lock is held, so two threads
//! draining at once (the arrival thread and an engine worker) cannot
//! interleave frames.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use vinfer_core::error::{EngineError, Result};
use vinfer_core::io::{FlowStatus, FrameSink};
use vinfer_core::types::{BufferHandle, Frame};

use crate::metrics::StageMetrics;

/// Position of a frame in its stage's ledger.  Monotonic per stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameSeq(pub u64);

struct OutputFrame {
    seq: FrameSeq,
    frame: Frame,
    /// Buffer results are written to; resolved at most once.
    writable_override: Option<BufferHandle>,
    pending: usize,
}

struct LedgerState {
    queue: VecDeque<OutputFrame>,
    next_seq: u64,
    flow: FlowStatus,
}

impl LedgerState {
    fn entry_mut(&mut self, seq: FrameSeq) -> Option<&mut OutputFrame> {
        let front = self.queue.front()?.seq.0;
        let index = seq.0.checked_sub(front)?;
        let entry = self.queue.get_mut(usize::try_from(index).ok()?)?;
        debug_assert_eq!(entry.seq, seq);
        Some(entry)
    }
}

/// Ordered queue of frames awaiting inference results.
pub struct FrameQueue {
    stage: String,
    state: Mutex<LedgerState>,
    emptied: Condvar,
    sink: Arc<dyn FrameSink>,
    metrics: Arc<StageMetrics>,
}

impl FrameQueue {
    pub fn new(stage: impl Into<String>, sink: Arc<dyn FrameSink>, metrics: Arc<StageMetrics>) -> Self {
        Self {
            stage: stage.into(),
            state: Mutex::new(LedgerState {
                queue: VecDeque::new(),
                next_seq: 0,
                flow: FlowStatus::Ok,
            }),
            emptied: Condvar::new(),
            sink,
            metrics,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append `frame` with a fixed number of outstanding requests.
    pub fn enqueue(&self, frame: Frame, initial_pending: usize) -> FrameSeq {
        let mut state = self.lock();
        let seq = FrameSeq(state.next_seq);
        state.next_seq += 1;
        state.queue.push_back(OutputFrame {
            seq,
            frame,
            writable_override: None,
            pending: initial_pending,
        });
        seq
    }

    /// Record one completed (or abandoned) request for `seq`.
    pub fn decrement(&self, seq: FrameSeq) -> Result<()> {
        let mut state = self.lock();
        let Some(entry) = state.entry_mut(seq) else {
            error!(stage = %self.stage, seq = seq.0, "Decrement for a frame not in the ledger");
            return Err(EngineError::InvariantViolation(format!(
                "ledger of '{}' has no entry for seq {}",
                self.stage, seq.0
            )));
        };
        if entry.pending == 0 {
            error!(stage = %self.stage, seq = seq.0, "Decrement below zero");
            return Err(EngineError::InvariantViolation(format!(
                "ledger of '{}' decremented seq {} below zero",
                self.stage, seq.0
            )));
        }
        entry.pending -= 1;
        debug!(stage = %self.stage, seq = seq.0, pending = entry.pending, "Request settled");
        Ok(())
    }

    /// Buffer that results for `seq` must be written to.
    ///
    /// The first call decides: the frame's own buffer when it is writable,
    /// otherwise one duplicate.  Every later call returns the same buffer.
    pub fn writable_buffer(&self, seq: FrameSeq) -> Result<BufferHandle> {
        let mut state = self.lock();
        let Some(entry) = state.entry_mut(seq) else {
            return Err(EngineError::InvariantViolation(format!(
                "ledger of '{}' has no entry for seq {} to write results to",
                self.stage, seq.0
            )));
        };
        if let Some(buffer) = &entry.writable_override {
            return Ok(buffer.clone());
        }
        let buffer = if entry.frame.buffer.is_writable() {
            entry.frame.buffer.clone()
        } else {
            StageMetrics::add(&self.metrics.duplications, 1);
            debug!(stage = %self.stage, seq = seq.0, "Buffer shared, duplicating for results");
            entry.frame.buffer.duplicate()
        };
        entry.writable_override = Some(buffer.clone());
        Ok(buffer)
    }

    /// Forward every leading frame with no outstanding requests.
    ///
    /// Returns the number of frames forwarded.
    pub fn drain(&self) -> usize {
        let mut state = self.lock();
        let mut forwarded = 0;
        while state.queue.front().is_some_and(|f| f.pending == 0) {
            let Some(entry) = state.queue.pop_front() else {
                break;
            };
            let mut frame = entry.frame;
            if let Some(buffer) = entry.writable_override {
                frame.buffer = buffer;
            }
            let status = self.sink.push(frame);
            if !status.is_ok() && state.flow.is_ok() {
                warn!(stage = %self.stage, seq = entry.seq.0, ?status, "Downstream refused frame");
                state.flow = status;
            }
            forwarded += 1;
        }
        if forwarded > 0 {
            StageMetrics::add(&self.metrics.frames_forwarded, forwarded as u64);
        }
        if state.queue.is_empty() {
            self.emptied.notify_all();
        }
        forwarded
    }

    /// Whether `seq` has already left the ledger.
    pub fn forwarded(&self, seq: FrameSeq) -> bool {
        let state = self.lock();
        match state.queue.front() {
            Some(front) => seq < front.seq,
            None => seq.0 < state.next_seq,
        }
    }

    /// First non-OK status returned by the sink, or `Ok`.
    pub fn flow_status(&self) -> FlowStatus {
        self.lock().flow
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// Block until the queue is empty or `timeout` elapses.
    pub fn wait_empty(&self, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        let state = self.lock();
        let (state, result) = self
            .emptied
            .wait_timeout_while(state, timeout, |s| !s.queue.is_empty())
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if result.timed_out() && !state.queue.is_empty() {
            return Err(EngineError::FlushTimeout {
                elapsed_ms: start.elapsed().as_millis() as u64,
                pending: state.queue.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vinfer_core::io::CollectingSink;
    use vinfer_core::types::{FrameInfo, PixelFormat};

    fn frame(index: u64) -> Frame {
        Frame::new(
            BufferHandle::zeroed(FrameInfo::packed(4, 4, PixelFormat::Gray8)),
            index,
            index as i64 * 33_333,
        )
    }

    fn ledger() -> (FrameQueue, Arc<CollectingSink>, Arc<StageMetrics>) {
        let sink = Arc::new(CollectingSink::new());
        let metrics = Arc::new(StageMetrics::new());
        let queue = FrameQueue::new("test", sink.clone(), metrics.clone());
        (queue, sink, metrics)
    }

    #[test]
    fn drain_stops_at_first_pending_entry() {
        let (q, sink, _) = ledger();
        let a = q.enqueue(frame(0), 1);
        q.enqueue(frame(1), 0);
        assert_eq!(q.drain(), 0, "front still pending");
        assert!(!q.forwarded(a));

        q.decrement(a).expect("pending 1");
        assert_eq!(q.drain(), 2);
        assert_eq!(sink.indices(), vec![0, 1]);
        assert!(q.forwarded(a));
        assert!(q.is_empty());
    }

    #[test]
    fn decrement_below_zero_is_an_invariant_violation() {
        let (q, _, _) = ledger();
        let a = q.enqueue(frame(0), 1);
        q.enqueue(frame(1), 1);
        q.decrement(a).expect("first decrement");
        let err = q.decrement(a).expect_err("second decrement");
        assert!(err.to_string().contains("below zero"));

        let err = q.decrement(FrameSeq(9)).expect_err("unknown seq");
        assert!(err.to_string().contains("no entry for seq 9"));
    }

    #[test]
    fn writable_buffer_duplicates_shared_frames_once() {
        let (q, sink, metrics) = ledger();
        let f = frame(0);
        let upstream_copy = f.buffer.clone();
        let seq = q.enqueue(f, 2);

        let first = q.writable_buffer(seq).expect("entry exists");
        let second = q.writable_buffer(seq).expect("entry exists");
        assert_eq!(first, second);
        assert_ne!(first, upstream_copy);
        assert_eq!(metrics.snapshot().duplications, 1);

        q.decrement(seq).expect("pending 2");
        q.decrement(seq).expect("pending 1");
        q.drain();
        let out = sink.take();
        assert_eq!(out[0].buffer, first);
    }

    #[test]
    fn writable_buffer_reuses_sole_handle() {
        let (q, sink, metrics) = ledger();
        let f = frame(0);
        let id = f.buffer.id();
        let seq = q.enqueue(f, 1);
        let target = q.writable_buffer(seq).expect("entry exists");
        assert_eq!(target.id(), id);
        drop(target);
        q.decrement(seq).expect("pending 1");
        q.drain();
        assert_eq!(sink.take()[0].buffer.id(), id);
        assert_eq!(metrics.snapshot().duplications, 0);
    }

    #[test]
    fn first_refused_push_is_sticky() {
        let (q, sink, _) = ledger();
        sink.set_status(FlowStatus::Flushing);
        q.enqueue(frame(0), 0);
        q.drain();
        sink.set_status(FlowStatus::Eos);
        q.enqueue(frame(1), 0);
        q.drain();
        assert_eq!(q.flow_status(), FlowStatus::Flushing);
    }

    #[test]
    fn wait_empty_times_out_with_pending_count() {
        let (q, _, _) = ledger();
        q.enqueue(frame(0), 1);
        let err = q
            .wait_empty(Duration::from_millis(20))
            .expect_err("frame never completes");
        assert!(matches!(err, EngineError::FlushTimeout { pending: 1, .. }));
    }

    #[test]
    fn wait_empty_wakes_on_drain_from_other_thread() {
        let (q, _, _) = ledger();
        let q = Arc::new(q);
        let seq = q.enqueue(frame(0), 1);
        let worker = {
            let q = Arc::clone(&q);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                q.decrement(seq).expect("pending 1");
                q.drain();
            })
        };
        q.wait_empty(Duration::from_secs(5)).expect("drained");
        worker.join().expect("worker");
    }
}
