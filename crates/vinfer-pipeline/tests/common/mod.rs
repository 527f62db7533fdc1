#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use vinfer_core::backend::{CompletionHandler, IdentityPreProcessor, InferenceEngine, PreProcessor};
use vinfer_core::error::{EngineError, Result};
use vinfer_core::types::{
    BufferHandle, Frame, FrameInfo, FrameMeta, ImageView, OutputTensor, PixelFormat, Rect,
    TensorMap,
};
use vinfer_pipeline::postproc::converter_for;
use vinfer_pipeline::{ModelConfig, ModelFactory, ModelInstance, ModelRegistry, ResultHandle};

#[derive(Default)]
struct ManualState {
    queued: Vec<ResultHandle>,
    in_callback: usize,
    /// Submissions still accepted before the next one fails.
    accept_before_failure: Option<usize>,
}

#[derive(Default)]
struct GateState {
    closed: bool,
    waiting: usize,
}

/// Holds engine shutdown until opened.  Open by default.
#[derive(Default)]
pub struct ShutdownGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl ShutdownGate {
    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn close(&self) {
        self.lock().closed = true;
    }

    pub fn open(&self) {
        self.lock().closed = false;
        self.changed.notify_all();
    }

    /// Block until some shutdown is held at the gate.
    pub fn wait_for_shutdown(&self) {
        let _held = self
            .changed
            .wait_while(self.lock(), |s| s.waiting == 0)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
    }

    fn pass(&self) {
        let mut state = self.lock();
        state.waiting += 1;
        self.changed.notify_all();
        let mut state = self
            .changed
            .wait_while(state, |s| s.closed)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.waiting -= 1;
    }
}

/// Engine whose requests complete only when the test says so, in any order.
pub struct ManualEngine {
    handler: Arc<dyn CompletionHandler<ResultHandle>>,
    capacity: usize,
    state: Mutex<ManualState>,
    idle: Condvar,
    gate: Arc<ShutdownGate>,
    live: Arc<AtomicUsize>,
    stopped: AtomicBool,
}

impl ManualEngine {
    fn lock(&self) -> MutexGuard<'_, ManualState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Accept `accepted` more submissions, then fail the next one.
    pub fn fail_submission_after(&self, accepted: usize) {
        self.lock().accept_before_failure = Some(accepted);
    }

    fn admit(&self, state: &mut ManualState) -> Result<()> {
        match state.accept_before_failure {
            Some(0) => {
                state.accept_before_failure = None;
                Err(EngineError::Submit("injected submission failure".into()))
            }
            Some(n) => {
                state.accept_before_failure = Some(n - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Requests accepted and not yet completed.
    pub fn pending(&self) -> usize {
        self.lock().queued.len()
    }

    /// Ledger sequence numbers of the queued requests, in submission order.
    pub fn pending_seqs(&self) -> Vec<u64> {
        self.lock().queued.iter().map(|h| h.seq().0).collect()
    }

    /// Complete the `i`-th queued request with a one-value output equal to
    /// its frame sequence number.
    pub fn complete(&self, i: usize) {
        let handle = self.take(i);
        let mut outputs = TensorMap::new();
        let value = handle.seq().0 as f32;
        outputs.insert(
            "output".into(),
            OutputTensor::new(vec![1, 1], vec![value]).expect("1x1 tensor"),
        );
        self.handler.on_completed(outputs, vec![handle]);
        self.finish();
    }

    /// Complete every queued request as one batch.
    pub fn complete_batch(&self) {
        let handles = {
            let mut state = self.lock();
            state.in_callback += 1;
            std::mem::take(&mut state.queued)
        };
        let data: Vec<f32> = handles.iter().map(|h| h.seq().0 as f32).collect();
        let mut outputs = TensorMap::new();
        outputs.insert(
            "output".into(),
            OutputTensor::new(vec![handles.len(), 1], data).expect("batch tensor"),
        );
        self.handler.on_completed(outputs, handles);
        self.finish();
    }

    /// Fail the `i`-th queued request.
    pub fn fail(&self, i: usize) {
        let handle = self.take(i);
        self.handler
            .on_failed(vec![handle], EngineError::Submit("injected failure".into()));
        self.finish();
    }

    /// Complete queued requests newest first until none remain.
    pub fn complete_reversed(&self) {
        while let Some(last) = self.pending().checked_sub(1) {
            self.complete(last);
        }
    }

    fn take(&self, i: usize) -> ResultHandle {
        let mut state = self.lock();
        state.in_callback += 1;
        state.queued.remove(i)
    }

    fn finish(&self) {
        let mut state = self.lock();
        state.in_callback -= 1;
        if state.queued.is_empty() && state.in_callback == 0 {
            self.idle.notify_all();
        }
    }
}

impl InferenceEngine<ResultHandle> for ManualEngine {
    fn submit_image(
        &self,
        _image: ImageView,
        handle: ResultHandle,
        _preprocess: &Arc<dyn PreProcessor>,
    ) -> Result<()> {
        let mut state = self.lock();
        self.admit(&mut state)?;
        state.queued.push(handle);
        Ok(())
    }

    fn try_submit_image(
        &self,
        _image: ImageView,
        handle: ResultHandle,
        _preprocess: &Arc<dyn PreProcessor>,
    ) -> Result<()> {
        let mut state = self.lock();
        if state.queued.len() >= self.capacity {
            return Err(EngineError::QueueFull);
        }
        self.admit(&mut state)?;
        state.queued.push(handle);
        Ok(())
    }

    fn is_queue_full(&self) -> bool {
        self.lock().queued.len() >= self.capacity
    }

    fn flush(&self) {
        let state = self.lock();
        let _idle = self
            .idle
            .wait_while(state, |s| !s.queued.is_empty() || s.in_callback > 0)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
    }

    fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.gate.pass();
        self.live.fetch_sub(1, Ordering::SeqCst);
    }

    fn name(&self) -> &str {
        "manual"
    }
}

/// Factory building [`ManualEngine`]s and counting loads per instance.
pub struct ManualFactory {
    capacity: usize,
    load_delay: Duration,
    loads: AtomicUsize,
    live: Arc<AtomicUsize>,
    peak_live: AtomicUsize,
    gate: Arc<ShutdownGate>,
    engines: Mutex<HashMap<String, Arc<ManualEngine>>>,
}

impl ManualFactory {
    pub fn new(capacity: usize) -> Arc<Self> {
        Self::with_load_delay(capacity, Duration::ZERO)
    }

    pub fn with_load_delay(capacity: usize, load_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            load_delay,
            loads: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
            peak_live: AtomicUsize::new(0),
            gate: Arc::new(ShutdownGate::default()),
            engines: Mutex::new(HashMap::new()),
        })
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Most engines alive (built and not yet shut down) at any one time.
    pub fn peak_live(&self) -> usize {
        self.peak_live.load(Ordering::SeqCst)
    }

    /// Gate every engine built by this factory passes on shutdown.
    pub fn shutdown_gate(&self) -> &ShutdownGate {
        &self.gate
    }

    /// The engine most recently built for `instance_id`.
    pub fn engine(&self, instance_id: &str) -> Arc<ManualEngine> {
        self.engines
            .lock()
            .expect("engines lock")
            .get(instance_id)
            .cloned()
            .unwrap_or_else(|| panic!("no engine built for '{instance_id}'"))
    }
}

impl ModelFactory for ManualFactory {
    fn build(
        &self,
        instance_id: &str,
        config: Arc<ModelConfig>,
        handler: Arc<dyn CompletionHandler<ResultHandle>>,
    ) -> Result<ModelInstance> {
        if !self.load_delay.is_zero() {
            std::thread::sleep(self.load_delay);
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_live.fetch_max(live, Ordering::SeqCst);
        let engine = Arc::new(ManualEngine {
            handler,
            capacity: self.capacity,
            state: Mutex::new(ManualState::default()),
            idle: Condvar::new(),
            gate: Arc::clone(&self.gate),
            live: Arc::clone(&self.live),
            stopped: AtomicBool::new(false),
        });
        self.engines
            .lock()
            .expect("engines lock")
            .insert(instance_id.to_string(), Arc::clone(&engine));
        let name = config.model_name();
        Ok(ModelInstance {
            instance_id: instance_id.to_string(),
            postprocess: converter_for(&name, &config),
            name,
            config,
            engine,
            preprocess: Arc::new(IdentityPreProcessor),
        })
    }
}

pub fn registry(factory: &Arc<ManualFactory>) -> Arc<ModelRegistry> {
    Arc::new(ModelRegistry::new(factory.clone()))
}

/// 16x16 gray frame carrying `regions` labelled regions.
pub fn frame_with_regions(index: u64, labels: &[&str]) -> Frame {
    let info = FrameInfo::packed(16, 16, PixelFormat::Gray8);
    let mut meta = FrameMeta::default();
    for (i, label) in labels.iter().enumerate() {
        meta.add_region(
            Rect::new(i as u32 * 4, 0, 4, 4),
            Some(label.to_string()),
            None,
            0.9,
        );
    }
    Frame::new(
        BufferHandle::new(info, vec![index as u8; info.byte_size()], meta),
        index,
        index as i64 * 33_333,
    )
}

pub fn frame(index: u64) -> Frame {
    frame_with_regions(index, &[])
}

/// 16x16 gray frame whose storage is too short to map.
pub fn short_frame(index: u64) -> Frame {
    let info = FrameInfo::packed(16, 16, PixelFormat::Gray8);
    Frame::new(
        BufferHandle::new(info, vec![0u8; 10], FrameMeta::default()),
        index,
        index as i64 * 33_333,
    )
}
