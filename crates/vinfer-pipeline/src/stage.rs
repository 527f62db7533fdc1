//! The inference stage exposed to the enclosing pipeline element.
//!
//! ```text
//! submit(frame) ─► collector ─► submitter ─► engine ─► dispatcher
//!                                   │                      │
//!                                   └──────► ledger ◄──────┘
//!                                              │ drain (in order)
//!                                              ▼
//!                                            sink
//! ```
//!
//! The model is acquired lazily on the first frame due for inference.  A
//! configuration failure there is fatal for the stage: it is logged once
//! and every later `submit` returns the same error without retrying.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use vinfer_core::error::{EngineError, Result};
use vinfer_core::io::FrameSink;
use vinfer_core::types::Frame;

use crate::collector::{CollectorConfig, RegionCollector};
use crate::config::StageConfig;
use crate::ledger::{FrameQueue, FrameSeq};
use crate::metrics::StageMetrics;
use crate::model::ModelInstance;
use crate::registry::{ModelRegistry, Role};
use crate::submitter::RequestSubmitter;

/// State shared between the stage and its in-flight requests.
pub struct StageShared {
    pub(crate) name: String,
    pub(crate) ledger: FrameQueue,
    pub(crate) metrics: Arc<StageMetrics>,
}

/// What happened to a frame handed to [`InferenceStage::submit`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitStatus {
    /// Already pushed downstream before `submit` returned.
    Forwarded,
    /// Will be pushed downstream once earlier frames and its own requests
    /// complete.
    Queued,
}

enum ModelSlot {
    Unacquired,
    Ready(Arc<ModelInstance>),
    Failed(EngineError),
}

/// One inference element instance.
pub struct InferenceStage {
    shared: Arc<StageShared>,
    registry: Arc<ModelRegistry>,
    instance_id: String,
    role: Role,
    collector: RegionCollector,
    submitter: RequestSubmitter,
    flush_timeout: Duration,
    model: Mutex<ModelSlot>,
    released: AtomicBool,
}

impl InferenceStage {
    /// Register with `registry`; master when `config` carries a model.
    pub fn new(
        config: StageConfig,
        registry: Arc<ModelRegistry>,
        sink: Arc<dyn FrameSink>,
    ) -> Result<Self> {
        config.validate()?;
        let instance_id = config.instance_id().to_string();
        let region_mode = config.region_mode();
        let StageConfig {
            name,
            model,
            inference_interval,
            object_classes,
            no_block,
            min_region_size,
            flush_timeout_ms,
            ..
        } = config;

        let role = registry.register(&name, &instance_id, model)?;
        let metrics = Arc::new(StageMetrics::new());
        info!(
            stage = %name,
            instance_id = %instance_id,
            ?role,
            ?region_mode,
            interval = inference_interval,
            no_block,
            "Inference stage created"
        );

        Ok(Self {
            shared: Arc::new(StageShared {
                ledger: FrameQueue::new(name.clone(), sink, Arc::clone(&metrics)),
                name,
                metrics,
            }),
            registry,
            instance_id,
            role,
            collector: RegionCollector::new(CollectorConfig {
                mode: region_mode,
                interval: inference_interval,
                object_classes,
                min_region_size,
            }),
            submitter: RequestSubmitter::new(no_block),
            flush_timeout: Duration::from_millis(flush_timeout_ms),
            model: Mutex::new(ModelSlot::Unacquired),
            released: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn metrics(&self) -> &StageMetrics {
        &self.shared.metrics
    }

    /// Frames waiting in the ledger.
    pub fn queued(&self) -> usize {
        self.shared.ledger.len()
    }

    fn model(&self) -> Result<Arc<ModelInstance>> {
        let mut slot = self
            .model
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match &*slot {
            ModelSlot::Ready(model) => return Ok(Arc::clone(model)),
            ModelSlot::Failed(e) => return Err(e.clone()),
            ModelSlot::Unacquired => {}
        }
        match self.registry.acquire(&self.shared.name, &self.instance_id) {
            Ok(model) => {
                debug!(stage = %self.shared.name, model = %model.name, "Model acquired");
                *slot = ModelSlot::Ready(Arc::clone(&model));
                Ok(model)
            }
            Err(e) => {
                error!(stage = %self.shared.name, error = %e, code = e.error_code(), "Model unavailable");
                *slot = ModelSlot::Failed(e.clone());
                Err(e)
            }
        }
    }

    /// Accept one frame.
    ///
    /// The frame is dropped only when the model cannot be acquired or
    /// downstream has already refused data; both are returned as errors.
    /// A submission error still forwards the frame (without results) and is
    /// returned after the frame is queued.
    pub fn submit(&self, frame: Frame) -> Result<SubmitStatus> {
        let flow = self.shared.ledger.flow_status();
        if !flow.is_ok() {
            return Err(EngineError::Flow(flow).in_stage(&self.shared.name));
        }
        if !self.collector.tick() {
            StageMetrics::add(&self.shared.metrics.frames_in, 1);
            StageMetrics::add(&self.shared.metrics.frames_skipped_interval, 1);
            let seq = self.shared.ledger.enqueue(frame, 0);
            self.shared.ledger.drain();
            return Ok(self.status_of(seq));
        }

        let model = self.model().map_err(|e| e.in_stage(&self.shared.name))?;
        StageMetrics::add(&self.shared.metrics.frames_in, 1);
        let regions = self
            .collector
            .collect(&frame, &model.config.object_classes);
        let outcome = self.submitter.submit(&self.shared, &model, frame, regions);

        self.shared.ledger.drain();
        match outcome.error {
            Some(e) => Err(e.in_stage(&self.shared.name)),
            None => Ok(self.status_of(outcome.seq)),
        }
    }

    fn status_of(&self, seq: FrameSeq) -> SubmitStatus {
        if self.shared.ledger.forwarded(seq) {
            SubmitStatus::Forwarded
        } else {
            SubmitStatus::Queued
        }
    }

    /// Complete every outstanding request and wait until every queued frame
    /// has been forwarded.
    pub fn flush(&self) -> Result<()> {
        let model = match &*self
            .model
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
        {
            ModelSlot::Ready(model) => Some(Arc::clone(model)),
            _ => None,
        };
        if let Some(model) = model {
            model.engine.flush();
        }
        self.shared.ledger.drain();
        self.shared
            .ledger
            .wait_empty(self.flush_timeout)
            .map_err(|e| e.in_stage(&self.shared.name))
    }

    /// Flush, then release the registry reference.  Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        if self.released.load(Ordering::Acquire) {
            return Ok(());
        }
        let flushed = self.flush();
        self.release();
        self.shared.metrics.report(&self.shared.name);
        flushed
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        // Drop our model reference before the registry may unload it.
        *self
            .model
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = ModelSlot::Unacquired;
        if let Err(e) = self.registry.release(&self.shared.name, &self.instance_id) {
            warn!(stage = %self.shared.name, error = %e, "Registry release failed");
        }
    }
}

impl Drop for InferenceStage {
    fn drop(&mut self) {
        self.release();
    }
}
