#![doc = include_str!("../README.md")]

pub mod metrics;
pub mod worker_pool;

pub use metrics::{InferenceMetrics, InferenceMetricsSnapshot};
pub use worker_pool::{InferFn, WorkerPoolConfig, WorkerPoolEngine, validate_pool_config};
