//! Typed error hierarchy for the workspace.
//!
//! Uses `thiserror` for library-grade errors.  Stage boundaries wrap inner
//! failures in [`EngineError::Stage`] so the full cause chain survives up to
//! the pipeline's error channel; [`EngineError::chain`] renders it.
//!
//! # Error codes
//!
//! Each variant maps to a stable integer code via [`EngineError::error_code`]
//! for structured telemetry without string parsing.

use crate::io::FlowStatus;

/// All errors originating from the inference stage core.
#[derive(Clone, Debug, thiserror::Error)]
pub enum EngineError {
    // ── Configuration ────────────────────────────────────────────────
    #[error(
        "model instance '{instance_id}' has no master configuration; \
         give exactly one stage sharing this id a model"
    )]
    MissingMasterConfig { instance_id: String },

    #[error("failed to load model for instance '{instance_id}': {message}")]
    ModelLoad {
        instance_id: String,
        message: String,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("element '{element}' is already registered for instance '{instance_id}'")]
    DuplicateRegistration {
        element: String,
        instance_id: String,
    },

    #[error("element '{element}' is not registered for instance '{instance_id}'")]
    UnknownElement {
        element: String,
        instance_id: String,
    },

    // ── Submission ───────────────────────────────────────────────────
    #[error("Failed to map frame buffer: {0}")]
    BufferMap(String),

    #[error("Inference request queue is full")]
    QueueFull,

    #[error("Inference submission failed: {0}")]
    Submit(String),

    #[error("Inference engine is shut down")]
    EngineShutdown,

    // ── Post-processing ──────────────────────────────────────────────
    #[error("Post-processing failed: {0}")]
    PostProcess(String),

    #[error("Output layer '{0}' missing from inference results")]
    MissingLayer(String),

    #[error("Panic recovered in {stage}: {message}")]
    PanicRecovered {
        stage: &'static str,
        message: String,
    },

    // ── Pipeline ─────────────────────────────────────────────────────
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Downstream flow error: {0:?}")]
    Flow(FlowStatus),

    #[error("Flush timed out after {elapsed_ms} ms with {pending} frame(s) still queued")]
    FlushTimeout { elapsed_ms: u64, pending: usize },

    #[error("stage '{stage}' failed")]
    Stage {
        stage: String,
        #[source]
        source: Box<EngineError>,
    },

    // ── Audit invariants ─────────────────────────────────────────────
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl EngineError {
    /// Stable integer error code for structured telemetry.
    ///
    /// Codes are grouped by category:
    /// - 1xx: configuration
    /// - 2xx: submission
    /// - 3xx: post-processing
    /// - 4xx: pipeline
    /// - 6xx: audit/invariant
    ///
    /// A [`Stage`](Self::Stage) wrapper reports the code of its innermost cause.
    pub fn error_code(&self) -> u32 {
        match self {
            Self::MissingMasterConfig { .. } => 100,
            Self::ModelLoad { .. } => 101,
            Self::InvalidConfig(_) => 102,
            Self::DuplicateRegistration { .. } => 103,
            Self::UnknownElement { .. } => 104,
            Self::BufferMap(_) => 200,
            Self::QueueFull => 201,
            Self::Submit(_) => 202,
            Self::EngineShutdown => 203,
            Self::PostProcess(_) => 300,
            Self::MissingLayer(_) => 301,
            Self::PanicRecovered { .. } => 302,
            Self::Pipeline(_) => 400,
            Self::Flow(_) => 401,
            Self::FlushTimeout { .. } => 402,
            Self::Stage { source, .. } => source.error_code(),
            Self::InvariantViolation(_) => 600,
        }
    }

    /// Whether this error is recoverable (the stream can continue after logging).
    ///
    /// Configuration errors are fatal for their instance; everything that only
    /// costs one frame its results is recoverable.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::QueueFull
            | Self::BufferMap(_)
            | Self::Submit(_)
            | Self::PostProcess(_)
            | Self::MissingLayer(_)
            | Self::PanicRecovered { .. } => true,
            Self::Stage { source, .. } => source.is_recoverable(),
            _ => false,
        }
    }

    /// Wrap this error with the name of the stage it escaped from.
    pub fn in_stage(self, stage: impl Into<String>) -> Self {
        Self::Stage {
            stage: stage.into(),
            source: Box::new(self),
        }
    }

    /// Render the error and every nested cause as `outer: inner: root`.
    pub fn chain(&self) -> String {
        let mut out = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            out.push_str(": ");
            out.push_str(&err.to_string());
            source = err.source();
        }
        out
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::EngineError;

    #[test]
    fn stage_wrapper_renders_nested_chain() {
        let err = EngineError::MissingMasterConfig {
            instance_id: "cam1".into(),
        }
        .in_stage("detect0");
        let chain = err.chain();
        assert!(chain.starts_with("stage 'detect0' failed: "));
        assert!(chain.contains("'cam1' has no master configuration"));
    }

    #[test]
    fn stage_wrapper_reports_inner_code() {
        let err = EngineError::QueueFull.in_stage("classify0");
        assert_eq!(err.error_code(), 201);
        assert!(err.is_recoverable());
    }

    #[test]
    fn configuration_errors_are_fatal() {
        let err = EngineError::ModelLoad {
            instance_id: "cam1".into(),
            message: "file not found".into(),
        };
        assert!(!err.is_recoverable());
        assert_eq!(err.error_code(), 101);
    }
}
