//! Converters from output tensors to attached metadata.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use vinfer_core::backend::{LayerDescriptor, NoopPostProcessor, PostProcessor, RegionTarget};
use vinfer_core::error::{EngineError, Result};
use vinfer_core::types::{OutputTensor, Rect, TensorMap, TensorMeta};

use crate::model::ModelConfig;

/// Which converter turns a model's outputs into metadata.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConverterKind {
    /// Attach nothing.
    None,
    /// Attach every output row as-is.
    #[default]
    Raw,
    /// SSD-style `[.., 7]` boxes become new regions.
    Detection,
    /// Argmax over each row becomes a labelled tensor.
    Classification,
}

/// Build the post-processor selected by `config.converter`.
pub fn converter_for(model: &str, config: &ModelConfig) -> Arc<dyn PostProcessor> {
    match config.converter {
        ConverterKind::None => Arc::new(NoopPostProcessor),
        ConverterKind::Raw => Arc::new(RawConverter {
            model: model.to_string(),
        }),
        ConverterKind::Detection => Arc::new(DetectionConverter {
            threshold: config.threshold,
        }),
        ConverterKind::Classification => Arc::new(ClassificationConverter {
            model: model.to_string(),
        }),
    }
}

fn item<'a>(tensor: &'a OutputTensor, layer: &str, target: &RegionTarget) -> Result<&'a [f32]> {
    tensor.item(target.batch_index).ok_or_else(|| {
        EngineError::PostProcess(format!(
            "layer '{layer}' has no row {} (batch {})",
            target.batch_index,
            tensor.batch()
        ))
    })
}

/// Layers to read: the described ones when descriptors exist, else all.
fn selected_layers<'a>(
    outputs: &'a TensorMap,
    layers: &'a [LayerDescriptor],
) -> Result<Vec<(&'a str, &'a OutputTensor, Option<&'a LayerDescriptor>)>> {
    if layers.is_empty() {
        return Ok(outputs
            .iter()
            .map(|(name, tensor)| (name.as_str(), tensor, None))
            .collect());
    }
    layers
        .iter()
        .map(|desc| {
            outputs
                .get(&desc.name)
                .map(|tensor| (desc.name.as_str(), tensor, Some(desc)))
                .ok_or_else(|| EngineError::MissingLayer(desc.name.clone()))
        })
        .collect()
}

// ─── Raw ─────────────────────────────────────────────────────────────────────

/// Attaches each output row to the request's region.
pub struct RawConverter {
    model: String,
}

impl PostProcessor for RawConverter {
    fn process(
        &self,
        outputs: &TensorMap,
        targets: &[RegionTarget],
        layers: &[LayerDescriptor],
    ) -> Result<()> {
        let selected = selected_layers(outputs, layers)?;
        for target in targets {
            let mut meta = target.buffer.meta();
            for (name, tensor, _) in &selected {
                let data = item(tensor, name, target)?;
                meta.attach(
                    target.region,
                    TensorMeta {
                        layer: name.to_string(),
                        model: self.model.clone(),
                        dims: tensor.item_dims().to_vec(),
                        data: data.to_vec(),
                        ..Default::default()
                    },
                )?;
            }
        }
        Ok(())
    }
}

// ─── Detection ───────────────────────────────────────────────────────────────

const DETECTION_FIELDS: usize = 7;

/// Decodes SSD-style rows
/// `[image_id, label_id, confidence, x_min, y_min, x_max, y_max]`.
///
/// Coordinates are normalized to the submitted crop and mapped back to frame
/// coordinates.  A row with a negative `image_id` ends the list.
pub struct DetectionConverter {
    threshold: f32,
}

impl DetectionConverter {
    fn to_frame_rect(roi: Rect, row: &[f32], width: u32, height: u32) -> Option<Rect> {
        let map = |v: f32, origin: u32, extent: u32| -> f32 {
            origin as f32 + v.clamp(0.0, 1.0) * extent as f32
        };
        let x0 = map(row[3], roi.x, roi.width);
        let y0 = map(row[4], roi.y, roi.height);
        let x1 = map(row[5], roi.x, roi.width);
        let y1 = map(row[6], roi.y, roi.height);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Rect::new(
            x0.round() as u32,
            y0.round() as u32,
            (x1 - x0).round() as u32,
            (y1 - y0).round() as u32,
        )
        .clamp_to(width, height)
    }
}

impl PostProcessor for DetectionConverter {
    fn process(
        &self,
        outputs: &TensorMap,
        targets: &[RegionTarget],
        layers: &[LayerDescriptor],
    ) -> Result<()> {
        let (name, tensor, desc) = selected_layers(outputs, layers)?
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::MissingLayer("detection output".into()))?;
        if tensor.item_dims().last() != Some(&DETECTION_FIELDS) {
            return Err(EngineError::PostProcess(format!(
                "detection layer '{name}' must end in {DETECTION_FIELDS} fields, got {:?}",
                tensor.dims
            )));
        }
        for target in targets {
            let info = target.buffer.info();
            let mut meta = target.buffer.meta();
            for row in item(tensor, name, target)?.chunks_exact(DETECTION_FIELDS) {
                if row[0] < 0.0 {
                    break;
                }
                let confidence = row[2];
                if confidence < self.threshold {
                    continue;
                }
                let Some(rect) = Self::to_frame_rect(target.roi, row, info.width, info.height)
                else {
                    continue;
                };
                let label_id = row[1].max(0.0) as usize;
                let label = desc
                    .and_then(|d| d.label(label_id))
                    .map(str::to_string);
                meta.add_region(rect, label, Some(label_id), confidence);
            }
        }
        Ok(())
    }
}

// ─── Classification ──────────────────────────────────────────────────────────

/// Attaches the argmax of every described layer as a labelled tensor.
pub struct ClassificationConverter {
    model: String,
}

impl PostProcessor for ClassificationConverter {
    fn process(
        &self,
        outputs: &TensorMap,
        targets: &[RegionTarget],
        layers: &[LayerDescriptor],
    ) -> Result<()> {
        let selected = selected_layers(outputs, layers)?;
        for target in targets {
            let mut meta = target.buffer.meta();
            for (name, tensor, desc) in &selected {
                let row = item(tensor, name, target)?;
                let Some((label_id, confidence)) = row
                    .iter()
                    .copied()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(&b.1))
                else {
                    continue;
                };
                meta.attach(
                    target.region,
                    TensorMeta {
                        layer: name.to_string(),
                        model: self.model.clone(),
                        dims: tensor.item_dims().to_vec(),
                        data: row.to_vec(),
                        label: desc.and_then(|d| d.label(label_id)).map(str::to_string),
                        label_id: Some(label_id),
                        confidence: Some(confidence),
                    },
                )?;
            }
        }
        Ok(())
    }
}
