//! Model configuration, loaded model instances and the factory that builds
//! them.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use vinfer_core::backend::{
    CompletionHandler, IdentityPreProcessor, InferenceEngine, LayerDescriptor, PostProcessor,
    PreProcessor,
};
use vinfer_core::error::{EngineError, Result};
use vinfer_engine::{InferFn, WorkerPoolConfig, WorkerPoolEngine};

use crate::dispatcher::ResultHandle;
use crate::postproc::{ConverterKind, converter_for};

/// Authoritative configuration of one model instance.
///
/// Supplied by exactly one stage per instance id (the master); every other
/// stage sharing the id inherits it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_path: PathBuf,
    #[serde(default = "default_device")]
    pub device: String,
    /// Maximum images per engine call.
    #[serde(default = "default_one")]
    pub batch_size: usize,
    /// Request queue capacity.
    #[serde(default = "default_nireq")]
    pub nireq: usize,
    /// Engine worker threads.
    #[serde(default = "default_one")]
    pub workers: usize,
    #[serde(default)]
    pub converter: ConverterKind,
    /// Minimum confidence for detection results.
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    /// Region labels this model accepts.  Empty accepts all.
    #[serde(default)]
    pub object_classes: Vec<String>,
    #[serde(default)]
    pub output_descriptors: Vec<LayerDescriptor>,
}

fn default_device() -> String {
    "CPU".into()
}

fn default_one() -> usize {
    1
}

fn default_nireq() -> usize {
    4
}

fn default_threshold() -> f32 {
    0.5
}

impl ModelConfig {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            device: default_device(),
            batch_size: 1,
            nireq: default_nireq(),
            workers: 1,
            converter: ConverterKind::default(),
            threshold: default_threshold(),
            object_classes: Vec::new(),
            output_descriptors: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.model_path.as_os_str().is_empty() {
            return Err(EngineError::InvalidConfig("model_path is empty".into()));
        }
        if self.batch_size == 0 {
            return Err(EngineError::InvalidConfig(
                "batch_size must be at least 1".into(),
            ));
        }
        if self.nireq == 0 {
            return Err(EngineError::InvalidConfig("nireq must be at least 1".into()));
        }
        if self.workers == 0 {
            return Err(EngineError::InvalidConfig("workers must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(EngineError::InvalidConfig(format!(
                "threshold {} is outside [0, 1]",
                self.threshold
            )));
        }
        Ok(())
    }

    /// Display name: the model file stem, or the whole path.
    pub fn model_name(&self) -> String {
        self.model_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.model_path.display().to_string())
    }
}

/// One loaded, ready-to-run model, shared by every stage using its id.
///
/// Immutable after construction.
pub struct ModelInstance {
    pub instance_id: String,
    pub name: String,
    pub config: Arc<ModelConfig>,
    pub engine: Arc<dyn InferenceEngine<ResultHandle>>,
    pub preprocess: Arc<dyn PreProcessor>,
    pub postprocess: Arc<dyn PostProcessor>,
}

/// Whether a region labelled `label` passes `classes` (empty accepts all).
pub(crate) fn accepts_class(classes: &[String], label: Option<&str>) -> bool {
    classes.is_empty() || label.is_some_and(|l| classes.iter().any(|c| c == l))
}

impl fmt::Debug for ModelInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelInstance")
            .field("instance_id", &self.instance_id)
            .field("name", &self.name)
            .field("engine", &self.engine.name())
            .finish()
    }
}

/// Builds model instances for the registry.
pub trait ModelFactory: Send + Sync {
    /// Load the model described by `config` and wire its engine to `handler`.
    fn build(
        &self,
        instance_id: &str,
        config: Arc<ModelConfig>,
        handler: Arc<dyn CompletionHandler<ResultHandle>>,
    ) -> Result<ModelInstance>;
}

type ModelLoader = dyn Fn(&ModelConfig) -> Result<InferFn> + Send + Sync;

/// Factory producing [`WorkerPoolEngine`]-backed instances.
///
/// `loader` turns a configuration into the model function run by the
/// workers.
pub struct WorkerPoolFactory {
    loader: Arc<ModelLoader>,
    verify_model_files: bool,
}

impl WorkerPoolFactory {
    pub fn new(loader: impl Fn(&ModelConfig) -> Result<InferFn> + Send + Sync + 'static) -> Self {
        Self {
            loader: Arc::new(loader),
            verify_model_files: true,
        }
    }

    /// Skip the check that `model_path` exists on disk.
    pub fn without_file_check(mut self) -> Self {
        self.verify_model_files = false;
        self
    }
}

impl ModelFactory for WorkerPoolFactory {
    fn build(
        &self,
        instance_id: &str,
        config: Arc<ModelConfig>,
        handler: Arc<dyn CompletionHandler<ResultHandle>>,
    ) -> Result<ModelInstance> {
        let load_err = |message: String| EngineError::ModelLoad {
            instance_id: instance_id.to_string(),
            message,
        };
        config.validate().map_err(|e| load_err(e.to_string()))?;
        if self.verify_model_files && !config.model_path.is_file() {
            return Err(load_err(format!(
                "model file {} not found",
                config.model_path.display()
            )));
        }

        let infer = (self.loader)(&config).map_err(|e| load_err(e.chain()))?;
        let engine = WorkerPoolEngine::new(
            WorkerPoolConfig {
                name: instance_id.to_string(),
                nireq: config.nireq,
                workers: config.workers,
                max_batch: config.batch_size,
            },
            infer,
            handler,
        )
        .map_err(|e| load_err(e.to_string()))?;

        let name = config.model_name();
        info!(
            instance_id,
            model = %name,
            device = %config.device,
            converter = ?config.converter,
            "Model loaded"
        );
        Ok(ModelInstance {
            instance_id: instance_id.to_string(),
            postprocess: converter_for(&name, &config),
            name,
            engine: Arc::new(engine),
            preprocess: Arc::new(IdentityPreProcessor),
            config,
        })
    }
}
