//! Bounded-queue worker pool implementing [`InferenceEngine`].
//!
//! # Queue accounting
//!
//! Two counters are kept:
//!
//! - `queued`: requests sitting in the channel, not yet taken by a worker.
//!   [`is_queue_full`](WorkerPoolEngine::is_queue_full) compares it against
//!   `nireq`.
//! - `outstanding`: requests accepted and whose completion callback has not
//!   yet returned.  [`flush`](WorkerPoolEngine::flush) waits for it to reach
//!   zero.
//!
//! `outstanding` is raised before the request enters the channel, so a
//! worker can never observe a completion for a request that was not counted.
//!
//! # Thread ownership
//!
//! Callbacks run on worker threads.  A callback must not call `flush` on the
//! engine that invoked it.  Dropping the last engine reference from inside a
//! callback is allowed: the calling worker is detached instead of joined.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TryRecvError, TrySendError, sync_channel};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use vinfer_core::backend::{CompletionHandler, InferenceEngine, PreProcessor};
use vinfer_core::error::{EngineError, Result};
use vinfer_core::types::{ImageView, TensorMap};

use crate::metrics::InferenceMetrics;

/// Model function: one call per batch, one output row per image.
pub type InferFn = Arc<dyn Fn(&[ImageView]) -> Result<TensorMap> + Send + Sync>;

/// Worker pool sizing.
#[derive(Clone, Debug)]
pub struct WorkerPoolConfig {
    /// Used in thread names and logs.
    pub name: String,
    /// Request queue capacity.
    pub nireq: usize,
    /// Number of worker threads.
    pub workers: usize,
    /// Maximum images per model call.
    pub max_batch: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            name: "engine".into(),
            nireq: 4,
            workers: 1,
            max_batch: 1,
        }
    }
}

/// Validate worker pool sizing before any thread is spawned.
pub fn validate_pool_config(cfg: &WorkerPoolConfig) -> Result<()> {
    if cfg.nireq == 0 {
        return Err(EngineError::InvalidConfig(
            "nireq must be at least 1 (the request queue needs a slot)".into(),
        ));
    }
    if cfg.workers == 0 {
        return Err(EngineError::InvalidConfig(
            "workers must be at least 1".into(),
        ));
    }
    if cfg.max_batch == 0 {
        return Err(EngineError::InvalidConfig(
            "max_batch must be at least 1".into(),
        ));
    }
    Ok(())
}

struct Request<H> {
    image: ImageView,
    handle: H,
    preprocess: Arc<dyn PreProcessor>,
}

struct Shared<H> {
    name: String,
    rx: Mutex<Receiver<Request<H>>>,
    infer: InferFn,
    handler: Arc<dyn CompletionHandler<H>>,
    max_batch: usize,
    queued: AtomicUsize,
    outstanding: Mutex<usize>,
    idle: Condvar,
    metrics: InferenceMetrics,
}

impl<H> Shared<H> {
    fn lock_outstanding(&self) -> MutexGuard<'_, usize> {
        self.outstanding
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn begin(&self) {
        *self.lock_outstanding() += 1;
    }

    fn finish(&self, n: usize) {
        let mut outstanding = self.lock_outstanding();
        *outstanding = outstanding.saturating_sub(n);
        if *outstanding == 0 {
            self.idle.notify_all();
        }
    }
}

/// Releases `outstanding` slots even if a callback unwinds.
struct Completion<'a, H> {
    shared: &'a Shared<H>,
    count: usize,
}

impl<H> Drop for Completion<'_, H> {
    fn drop(&mut self) {
        self.shared.finish(self.count);
    }
}

/// Asynchronous CPU inference engine backed by a fixed thread pool.
pub struct WorkerPoolEngine<H> {
    name: String,
    nireq: usize,
    tx: Mutex<Option<SyncSender<Request<H>>>>,
    shared: Arc<Shared<H>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<H: Send + 'static> WorkerPoolEngine<H> {
    /// Spawn the worker threads.
    pub fn new(
        cfg: WorkerPoolConfig,
        infer: InferFn,
        handler: Arc<dyn CompletionHandler<H>>,
    ) -> Result<Self> {
        validate_pool_config(&cfg)?;
        let (tx, rx) = sync_channel(cfg.nireq);
        let shared = Arc::new(Shared {
            name: cfg.name.clone(),
            rx: Mutex::new(rx),
            infer,
            handler,
            max_batch: cfg.max_batch,
            queued: AtomicUsize::new(0),
            outstanding: Mutex::new(0),
            idle: Condvar::new(),
            metrics: InferenceMetrics::new(),
        });

        let mut workers = Vec::with_capacity(cfg.workers);
        for i in 0..cfg.workers {
            let worker_shared = Arc::clone(&shared);
            let spawned = std::thread::Builder::new()
                .name(format!("{}-infer-{i}", cfg.name))
                .spawn(move || worker_loop(worker_shared, i));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    drop(tx);
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(EngineError::Pipeline(format!(
                        "failed to spawn worker {i} for engine '{}': {e}",
                        cfg.name
                    )));
                }
            }
        }

        info!(
            engine = %cfg.name,
            nireq = cfg.nireq,
            workers = cfg.workers,
            max_batch = cfg.max_batch,
            "Worker pool engine started"
        );

        Ok(Self {
            name: cfg.name,
            nireq: cfg.nireq,
            tx: Mutex::new(Some(tx)),
            shared,
            workers: Mutex::new(workers),
        })
    }

    pub fn metrics(&self) -> &InferenceMetrics {
        &self.shared.metrics
    }

    /// Requests accepted whose callbacks have not returned yet.
    pub fn outstanding(&self) -> usize {
        *self.shared.lock_outstanding()
    }

    fn sender(&self) -> Result<SyncSender<Request<H>>> {
        self.tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .cloned()
            .ok_or(EngineError::EngineShutdown)
    }
}

impl<H: Send + 'static> InferenceEngine<H> for WorkerPoolEngine<H> {
    fn submit_image(
        &self,
        image: ImageView,
        handle: H,
        preprocess: &Arc<dyn PreProcessor>,
    ) -> Result<()> {
        let tx = self.sender()?;
        self.shared.begin();
        self.shared.queued.fetch_add(1, Ordering::AcqRel);
        let request = Request {
            image,
            handle,
            preprocess: Arc::clone(preprocess),
        };
        if tx.send(request).is_err() {
            self.shared.queued.fetch_sub(1, Ordering::AcqRel);
            self.shared.finish(1);
            return Err(EngineError::EngineShutdown);
        }
        Ok(())
    }

    fn try_submit_image(
        &self,
        image: ImageView,
        handle: H,
        preprocess: &Arc<dyn PreProcessor>,
    ) -> Result<()> {
        let tx = self.sender()?;
        self.shared.begin();
        self.shared.queued.fetch_add(1, Ordering::AcqRel);
        let request = Request {
            image,
            handle,
            preprocess: Arc::clone(preprocess),
        };
        match tx.try_send(request) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.shared.queued.fetch_sub(1, Ordering::AcqRel);
                self.shared.finish(1);
                match e {
                    TrySendError::Full(_) => Err(EngineError::QueueFull),
                    TrySendError::Disconnected(_) => Err(EngineError::EngineShutdown),
                }
            }
        }
    }

    fn is_queue_full(&self) -> bool {
        self.shared.queued.load(Ordering::Acquire) >= self.nireq
    }

    fn flush(&self) {
        let mut outstanding = self.shared.lock_outstanding();
        while *outstanding > 0 {
            outstanding = self
                .shared
                .idle
                .wait(outstanding)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn shutdown(&self) {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if tx.is_none() {
            return;
        }
        drop(tx);

        let handles = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        let current = std::thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!(engine = %self.name, "Worker thread panicked before shutdown");
            }
        }
        let snap = self.shared.metrics.snapshot();
        info!(
            engine = %self.name,
            images = snap.images_inferred,
            batches = snap.batches,
            failed = snap.images_failed,
            avg_batch_us = snap.avg_batch_us,
            "Worker pool engine stopped"
        );
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<H> Drop for WorkerPoolEngine<H> {
    fn drop(&mut self) {
        // Closing the channel lets workers exit once the queue is empty.
        // Joining happens only through an explicit shutdown.
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
    }
}

fn worker_loop<H>(shared: Arc<Shared<H>>, index: usize) {
    debug!(engine = %shared.name, worker = index, "Worker started");
    while let Some(batch) = next_batch(&shared) {
        shared.queued.fetch_sub(batch.len(), Ordering::AcqRel);
        run_batch(&shared, batch);
    }
    debug!(engine = %shared.name, worker = index, "Worker exiting");
}

/// Block for one request, then take whatever else is already queued up to
/// `max_batch`.  `None` once the channel is closed and empty.
fn next_batch<H>(shared: &Shared<H>) -> Option<Vec<Request<H>>> {
    let rx = shared
        .rx
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let first = rx.recv().ok()?;
    let mut batch = Vec::with_capacity(shared.max_batch);
    batch.push(first);
    while batch.len() < shared.max_batch {
        match rx.try_recv() {
            Ok(req) => batch.push(req),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
        }
    }
    Some(batch)
}

fn run_batch<H>(shared: &Shared<H>, batch: Vec<Request<H>>) {
    let _completion = Completion {
        shared,
        count: batch.len(),
    };

    let mut images = Vec::with_capacity(batch.len());
    let mut handles = Vec::with_capacity(batch.len());
    for Request {
        mut image,
        handle,
        preprocess,
    } in batch
    {
        match preprocess.preprocess(&mut image) {
            Ok(()) => {
                images.push(image);
                handles.push(handle);
            }
            Err(e) => {
                shared.metrics.record_failure(1);
                deliver(shared, move |h| h.on_failed(vec![handle], e));
            }
        }
    }
    if handles.is_empty() {
        return;
    }

    let start = Instant::now();
    let outcome = catch_unwind(AssertUnwindSafe(|| (shared.infer)(&images)));
    let elapsed_us = start.elapsed().as_micros() as u64;

    let outcome = match outcome {
        Ok(result) => result,
        Err(payload) => Err(EngineError::PanicRecovered {
            stage: "inference",
            message: panic_message(payload.as_ref()),
        }),
    };
    let outcome = outcome.and_then(|outputs| {
        let mismatch = outputs
            .iter()
            .find(|(_, tensor)| tensor.batch() != handles.len())
            .map(|(layer, tensor)| (layer.clone(), tensor.batch()));
        match mismatch {
            Some((layer, batch)) => Err(EngineError::Submit(format!(
                "layer '{layer}' returned batch {batch} for {} requests",
                handles.len()
            ))),
            None => Ok(outputs),
        }
    });

    match outcome {
        Ok(outputs) => {
            shared.metrics.record(handles.len(), elapsed_us);
            deliver(shared, move |h| h.on_completed(outputs, handles));
        }
        Err(e) => {
            shared.metrics.record_failure(handles.len());
            deliver(shared, move |h| h.on_failed(handles, e));
        }
    }
}

fn deliver<H>(shared: &Shared<H>, f: impl FnOnce(&dyn CompletionHandler<H>)) {
    let handler = shared.handler.as_ref();
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| f(handler))) {
        error!(
            engine = %shared.name,
            panic = %panic_message(payload.as_ref()),
            "Completion callback panicked"
        );
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;
    use vinfer_core::backend::IdentityPreProcessor;
    use vinfer_core::types::{BufferHandle, FrameInfo, OutputTensor, PixelFormat};

    struct Recorder {
        tx: Mutex<mpsc::Sender<(Vec<u32>, bool)>>,
        delay: Duration,
    }

    impl CompletionHandler<u32> for Recorder {
        fn on_completed(&self, _outputs: TensorMap, handles: Vec<u32>) {
            std::thread::sleep(self.delay);
            let _ = self.tx.lock().unwrap().send((handles, true));
        }
        fn on_failed(&self, handles: Vec<u32>, _error: EngineError) {
            let _ = self.tx.lock().unwrap().send((handles, false));
        }
    }

    fn image() -> ImageView {
        BufferHandle::zeroed(FrameInfo::packed(4, 4, PixelFormat::Gray8))
            .map()
            .unwrap()
    }

    fn echo() -> InferFn {
        Arc::new(|images: &[ImageView]| -> Result<TensorMap> {
            let mut out = TensorMap::new();
            out.insert(
                "out".into(),
                OutputTensor::new(vec![images.len(), 1], vec![1.0; images.len()])?,
            );
            Ok(out)
        })
    }

    fn engine(
        cfg: WorkerPoolConfig,
        infer: InferFn,
        delay: Duration,
    ) -> (WorkerPoolEngine<u32>, mpsc::Receiver<(Vec<u32>, bool)>) {
        let (tx, rx) = mpsc::channel();
        let handler = Arc::new(Recorder {
            tx: Mutex::new(tx),
            delay,
        });
        (WorkerPoolEngine::new(cfg, infer, handler).unwrap(), rx)
    }

    #[test]
    fn rejects_zero_sized_pool() {
        let cfg = WorkerPoolConfig {
            nireq: 0,
            ..Default::default()
        };
        let err = validate_pool_config(&cfg).expect_err("nireq 0 must be rejected");
        assert!(err.to_string().contains("nireq"));
    }

    #[test]
    fn flush_waits_for_callbacks() {
        let (engine, rx) = engine(
            WorkerPoolConfig {
                workers: 2,
                ..Default::default()
            },
            echo(),
            Duration::from_millis(20),
        );
        let pre: Arc<dyn PreProcessor> = Arc::new(IdentityPreProcessor);
        for i in 0..4 {
            engine.submit_image(image(), i, &pre).unwrap();
        }
        engine.flush();
        assert_eq!(engine.outstanding(), 0);
        let mut seen: Vec<u32> = rx.try_iter().flat_map(|(h, ok)| {
            assert!(ok);
            h
        }).collect();
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3]);
        engine.shutdown();
    }

    #[test]
    fn try_submit_reports_full_queue() {
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let worker_gate = Arc::clone(&gate);
        let blocking: InferFn = Arc::new(move |images: &[ImageView]| -> Result<TensorMap> {
            let (lock, cv) = &*worker_gate;
            let mut open = lock.lock().unwrap();
            while !*open {
                open = cv.wait(open).unwrap();
            }
            let mut out = TensorMap::new();
            out.insert(
                "out".into(),
                OutputTensor::new(vec![images.len()], vec![0.0; images.len()])?,
            );
            Ok(out)
        });
        let (engine, _rx) = engine(
            WorkerPoolConfig {
                nireq: 1,
                ..Default::default()
            },
            blocking,
            Duration::ZERO,
        );
        let pre: Arc<dyn PreProcessor> = Arc::new(IdentityPreProcessor);
        // First request is taken by the worker and blocks on the gate.
        engine.submit_image(image(), 0, &pre).unwrap();
        while engine.shared.queued.load(Ordering::Acquire) != 0 {
            std::thread::yield_now();
        }
        engine.try_submit_image(image(), 1, &pre).unwrap();
        assert!(engine.is_queue_full());
        let err = engine
            .try_submit_image(image(), 2, &pre)
            .expect_err("queue holds one request");
        assert!(matches!(err, EngineError::QueueFull));

        *gate.0.lock().unwrap() = true;
        gate.1.notify_all();
        engine.flush();
        assert_eq!(engine.metrics().snapshot().images_inferred, 2);
        engine.shutdown();
    }

    #[test]
    fn mismatched_batch_fails_every_handle() {
        let bad: InferFn = Arc::new(|_images: &[ImageView]| -> Result<TensorMap> {
            let mut out = TensorMap::new();
            out.insert("out".into(), OutputTensor::new(vec![3], vec![0.0; 3])?);
            Ok(out)
        });
        let (engine, rx) = engine(WorkerPoolConfig::default(), bad, Duration::ZERO);
        let pre: Arc<dyn PreProcessor> = Arc::new(IdentityPreProcessor);
        engine.submit_image(image(), 7, &pre).unwrap();
        engine.flush();
        let (handles, ok) = rx.recv().unwrap();
        assert_eq!(handles, vec![7]);
        assert!(!ok);
        engine.shutdown();
    }

    #[test]
    fn submit_after_shutdown_fails() {
        let (engine, _rx) = engine(WorkerPoolConfig::default(), echo(), Duration::ZERO);
        engine.shutdown();
        engine.shutdown();
        let pre: Arc<dyn PreProcessor> = Arc::new(IdentityPreProcessor);
        let err = engine
            .submit_image(image(), 0, &pre)
            .expect_err("engine is shut down");
        assert!(matches!(err, EngineError::EngineShutdown));
    }
}
