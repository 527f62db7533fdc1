#![doc = include_str!("../README.md")]

pub mod collector;
pub mod config;
pub mod dispatcher;
pub mod ledger;
pub mod metrics;
pub mod model;
pub mod postproc;
pub mod registry;
pub mod runtime;
pub mod stage;
pub mod submitter;
pub mod synthetic;

pub use collector::{RegionCollector, RegionMode};
pub use config::{GRAPH_SCHEMA_VERSION, StageConfig, StageGraph, StageKind};
pub use dispatcher::{CompletionDispatcher, ResultHandle};
pub use ledger::{FrameQueue, FrameSeq};
pub use metrics::{StageMetrics, StageMetricsSnapshot};
pub use model::{ModelConfig, ModelFactory, ModelInstance, WorkerPoolFactory};
pub use registry::{ModelRegistry, Role};
pub use runtime::{MultiStreamRunner, RunConfig, RunReport};
pub use stage::{InferenceStage, SubmitStatus};
