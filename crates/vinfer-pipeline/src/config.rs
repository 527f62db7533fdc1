use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use vinfer_core::error::{EngineError, Result};

use crate::collector::RegionMode;
use crate::model::ModelConfig;
use crate::postproc::ConverterKind;

pub const GRAPH_SCHEMA_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Generic inference; raw tensors by default.
    Inference,
    /// Object detection on whole frames.
    Detect,
    /// Classification of previously detected regions.
    Classify,
}

impl StageKind {
    pub fn default_region(self) -> RegionMode {
        match self {
            Self::Inference | Self::Detect => RegionMode::FullFrame,
            Self::Classify => RegionMode::RoiList,
        }
    }

    pub fn default_converter(self) -> ConverterKind {
        match self {
            Self::Inference => ConverterKind::Raw,
            Self::Detect => ConverterKind::Detection,
            Self::Classify => ConverterKind::Classification,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageConfig {
    pub kind: StageKind,
    pub name: String,
    /// Shared model instance id.  Empty gives the stage a private instance
    /// named after the stage.
    #[serde(default)]
    pub model_instance_id: String,
    /// Present on the stage that supplies the instance's configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelConfig>,
    #[serde(default = "default_interval")]
    pub inference_interval: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<RegionMode>,
    #[serde(default)]
    pub object_classes: Vec<String>,
    #[serde(default)]
    pub no_block: bool,
    #[serde(default)]
    pub min_region_size: u32,
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,
}

fn default_interval() -> u64 {
    1
}

fn default_flush_timeout_ms() -> u64 {
    10_000
}

impl StageConfig {
    pub fn new(kind: StageKind, name: impl Into<String>, model_instance_id: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            model_instance_id: model_instance_id.into(),
            model: None,
            inference_interval: default_interval(),
            region: None,
            object_classes: Vec::new(),
            no_block: false,
            min_region_size: 0,
            flush_timeout_ms: default_flush_timeout_ms(),
        }
    }

    pub fn instance_id(&self) -> &str {
        if self.model_instance_id.is_empty() {
            &self.name
        } else {
            &self.model_instance_id
        }
    }

    pub fn region_mode(&self) -> RegionMode {
        self.region.unwrap_or_else(|| self.kind.default_region())
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(EngineError::InvariantViolation(
                "StageGraph validation failed: stage name is empty".into(),
            ));
        }
        if self.inference_interval == 0 {
            return Err(EngineError::InvariantViolation(format!(
                "StageGraph validation failed: stage '{}' {:?} requires inference_interval > 0",
                self.name, self.kind
            )));
        }
        if let Some(model) = &self.model {
            model.validate().map_err(|e| {
                EngineError::InvariantViolation(format!(
                    "StageGraph validation failed: stage '{}' model: {e}",
                    self.name
                ))
            })?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageGraph {
    pub graph_schema_version: u32,
    pub stages: Vec<StageConfig>,
}

impl Default for StageGraph {
    fn default() -> Self {
        Self {
            graph_schema_version: GRAPH_SCHEMA_VERSION,
            stages: Vec::new(),
        }
    }
}

impl StageGraph {
    pub fn from_json_str(data: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(data).map_err(|err| {
            EngineError::InvariantViolation(format!("Invalid stage graph JSON: {err}"))
        })?;

        let Some(version_value) = value.get("graph_schema_version") else {
            return Err(EngineError::InvariantViolation(format!(
                "Graph schema mismatch: expected {}, got missing",
                GRAPH_SCHEMA_VERSION
            )));
        };
        let Some(version) = version_value.as_u64() else {
            return Err(EngineError::InvariantViolation(format!(
                "Graph schema mismatch: expected {}, got non-integer",
                GRAPH_SCHEMA_VERSION
            )));
        };
        if version != GRAPH_SCHEMA_VERSION as u64 {
            return Err(EngineError::InvariantViolation(format!(
                "Graph schema mismatch: expected {}, got {}",
                GRAPH_SCHEMA_VERSION, version
            )));
        }

        serde_json::from_value(value).map_err(|err| {
            EngineError::InvariantViolation(format!("Invalid stage graph JSON: {err}"))
        })
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|err| {
            EngineError::InvariantViolation(format!(
                "Failed to read stage graph from {}: {err}",
                path.display()
            ))
        })?;
        Self::from_json_str(&data)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|err| {
            EngineError::InvariantViolation(format!("Failed to encode stage graph: {err}"))
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.graph_schema_version != GRAPH_SCHEMA_VERSION {
            return Err(EngineError::InvariantViolation(format!(
                "Graph schema mismatch: expected {}, got {}",
                GRAPH_SCHEMA_VERSION, self.graph_schema_version
            )));
        }
        if self.stages.is_empty() {
            return Err(EngineError::InvariantViolation(
                "StageGraph validation failed: at least one stage is required".into(),
            ));
        }

        let mut names = BTreeSet::new();
        let mut masters: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for stage in &self.stages {
            if !names.insert(stage.name.as_str()) {
                return Err(EngineError::InvariantViolation(format!(
                    "StageGraph validation failed: duplicate stage name '{}'",
                    stage.name
                )));
            }
            stage.validate()?;
            let entry = masters.entry(stage.instance_id()).or_default();
            if stage.model.is_some() {
                entry.push(stage.name.as_str());
            }
        }

        for (instance_id, owners) in &masters {
            match owners.len() {
                0 => {
                    return Err(EngineError::InvariantViolation(format!(
                        "StageGraph validation failed: model instance '{instance_id}' has no stage with a model"
                    )));
                }
                1 => {}
                _ => {
                    return Err(EngineError::InvariantViolation(format!(
                        "StageGraph validation failed: model instance '{instance_id}' is configured by multiple stages ({})",
                        owners.join(", ")
                    )));
                }
            }
        }
        Ok(())
    }

    /// Detect-then-classify graph used by `graph-template`.
    pub fn template() -> Self {
        let mut detect_model = ModelConfig::new("models/vehicle-detection.xml");
        detect_model.converter = StageKind::Detect.default_converter();
        detect_model.output_descriptors = vec![vinfer_core::backend::LayerDescriptor {
            name: "detection_out".into(),
            labels: vec!["background".into(), "car".into(), "person".into()],
            ..Default::default()
        }];
        let mut detect = StageConfig::new(StageKind::Detect, "detect", "vehicle-det");
        detect.model = Some(detect_model);

        let mut classify_model = ModelConfig::new("models/vehicle-attributes.xml");
        classify_model.converter = StageKind::Classify.default_converter();
        classify_model.object_classes = vec!["car".into()];
        classify_model.batch_size = 4;
        classify_model.output_descriptors = vec![vinfer_core::backend::LayerDescriptor {
            name: "color".into(),
            labels: vec!["white".into(), "gray".into(), "red".into(), "blue".into()],
            ..Default::default()
        }];
        let mut classify = StageConfig::new(StageKind::Classify, "classify", "vehicle-attr");
        classify.model = Some(classify_model);
        classify.inference_interval = 2;

        Self {
            graph_schema_version: GRAPH_SCHEMA_VERSION,
            stages: vec![detect, classify],
        }
    }
}
