//! Deterministic frame source and model functions for runs without real
//! media or model files.

use std::sync::Arc;

use vinfer_core::error::Result;
use vinfer_core::io::FrameSource;
use vinfer_core::types::{
    BufferHandle, Frame, FrameInfo, FrameMeta, ImageView, OutputTensor, PixelFormat, Rect,
    TensorMap,
};
use vinfer_engine::InferFn;

use crate::model::ModelConfig;
use crate::postproc::ConverterKind;

const REGION_LABELS: [&str; 3] = ["car", "person", "bicycle"];

/// Frames of a fixed size whose pixels encode the frame index, each with a
/// row of pre-attached, labelled regions.
pub struct SyntheticSource {
    info: FrameInfo,
    total: u64,
    next: u64,
    regions_per_frame: u32,
    frame_interval_us: i64,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32, total: u64, regions_per_frame: u32) -> Self {
        Self {
            info: FrameInfo::packed(width, height, PixelFormat::Bgr),
            total,
            next: 0,
            regions_per_frame,
            frame_interval_us: 33_333,
        }
    }

    fn regions(&self, index: u64) -> FrameMeta {
        let mut meta = FrameMeta::default();
        if self.regions_per_frame == 0 {
            return meta;
        }
        let slot = (self.info.width / self.regions_per_frame).max(1);
        for i in 0..self.regions_per_frame {
            let label = REGION_LABELS[(index as usize + i as usize) % REGION_LABELS.len()];
            meta.add_region(
                Rect::new(i * slot, self.info.height / 4, slot, self.info.height / 2),
                Some(label.to_string()),
                None,
                1.0,
            );
        }
        meta
    }
}

impl FrameSource for SyntheticSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.next >= self.total {
            return Ok(None);
        }
        let index = self.next;
        self.next += 1;
        let pixels = vec![(index % 256) as u8; self.info.byte_size()];
        let buffer = BufferHandle::new(self.info, pixels, self.regions(index));
        Ok(Some(Frame::new(
            buffer,
            index,
            index as i64 * self.frame_interval_us,
        )))
    }
}

/// Model function producing outputs shaped for `config.converter`.
///
/// Values are derived from each image's mean intensity so results are
/// reproducible per frame.
pub fn synthetic_infer(config: &ModelConfig) -> InferFn {
    let layer = config
        .output_descriptors
        .first()
        .map(|d| d.name.clone());
    let classes = config
        .output_descriptors
        .first()
        .map_or(0, |d| d.labels.len())
        .max(2);
    match config.converter {
        ConverterKind::Detection => {
            let layer = layer.unwrap_or_else(|| "detection_out".into());
            Arc::new(move |images: &[ImageView]| -> Result<TensorMap> {
                let mut data = Vec::with_capacity(images.len() * 7);
                for image in images {
                    let label = (image.mean_intensity() as usize % (classes - 1)) + 1;
                    data.extend_from_slice(&[0.0, label as f32, 0.9, 0.25, 0.25, 0.75, 0.75]);
                }
                let mut out = TensorMap::new();
                out.insert(layer.clone(), OutputTensor::new(vec![images.len(), 1, 7], data)?);
                Ok(out)
            })
        }
        ConverterKind::Classification => {
            let layer = layer.unwrap_or_else(|| "prob".into());
            Arc::new(move |images: &[ImageView]| -> Result<TensorMap> {
                let mut data = Vec::with_capacity(images.len() * classes);
                for image in images {
                    let winner = image.mean_intensity() as usize % classes;
                    let rest = 0.2 / (classes - 1) as f32;
                    data.extend((0..classes).map(|c| if c == winner { 0.8 } else { rest }));
                }
                let mut out = TensorMap::new();
                out.insert(layer.clone(), OutputTensor::new(vec![images.len(), classes], data)?);
                Ok(out)
            })
        }
        ConverterKind::Raw | ConverterKind::None => {
            let layer = layer.unwrap_or_else(|| "output".into());
            Arc::new(move |images: &[ImageView]| -> Result<TensorMap> {
                let mut data = Vec::with_capacity(images.len() * 3);
                for image in images {
                    let roi = image.roi();
                    data.extend_from_slice(&[
                        image.mean_intensity(),
                        roi.width as f32,
                        roi.height as f32,
                    ]);
                }
                let mut out = TensorMap::new();
                out.insert(layer.clone(), OutputTensor::new(vec![images.len(), 3], data)?);
                Ok(out)
            })
        }
    }
}
