//! Region selection: which parts of a frame go to the model.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::trace;

use vinfer_core::types::{Frame, Rect, RegionRef};

use crate::model::accepts_class;

/// How a stage builds inference requests from a frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionMode {
    /// One request covering the whole frame.
    #[default]
    FullFrame,
    /// One request per attached region of interest.
    RoiList,
}

#[derive(Clone, Debug)]
pub struct CollectorConfig {
    pub mode: RegionMode,
    /// Run inference on every Nth frame.  Must be at least 1.
    pub interval: u64,
    /// Stage-level class filter.  Overrides the model's when non-empty.
    pub object_classes: Vec<String>,
    /// Regions narrower or shorter than this after clamping are dropped.
    pub min_region_size: u32,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            mode: RegionMode::FullFrame,
            interval: 1,
            object_classes: Vec::new(),
            min_region_size: 0,
        }
    }
}

/// A region chosen for inference, with its rectangle clamped to the frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SelectedRegion {
    pub region: RegionRef,
    pub rect: Rect,
}

/// Per-stage region selector.
pub struct RegionCollector {
    config: CollectorConfig,
    frames_seen: AtomicU64,
}

impl RegionCollector {
    pub fn new(mut config: CollectorConfig) -> Self {
        config.interval = config.interval.max(1);
        Self {
            config,
            frames_seen: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> RegionMode {
        self.config.mode
    }

    /// Advance the frame counter; `true` when this frame is due for
    /// inference (frames N, 2N, … counting from 1).
    pub fn tick(&self) -> bool {
        let n = self.frames_seen.fetch_add(1, Ordering::Relaxed) + 1;
        n % self.config.interval == 0
    }

    /// Regions of `frame` that pass the mode, size and class filters.
    ///
    /// `model_classes` is the model's allow-list; the stage's own list wins
    /// when it is non-empty.
    pub fn collect(&self, frame: &Frame, model_classes: &[String]) -> Vec<SelectedRegion> {
        let info = frame.info();
        match self.config.mode {
            RegionMode::FullFrame => vec![SelectedRegion {
                region: RegionRef::FullFrame,
                rect: info.full_rect(),
            }],
            RegionMode::RoiList => {
                let classes = if self.config.object_classes.is_empty() {
                    model_classes
                } else {
                    self.config.object_classes.as_slice()
                };
                let min = self.config.min_region_size;
                let meta = frame.buffer.meta();
                let selected = meta
                    .regions
                    .iter()
                    .filter_map(|roi| {
                        if !accepts_class(classes, roi.label.as_deref()) {
                            trace!(region = roi.id, label = ?roi.label, "Region filtered by class");
                            return None;
                        }
                        let rect = roi.rect.clamp_to(info.width, info.height)?;
                        if rect.width < min || rect.height < min {
                            trace!(region = roi.id, ?rect, "Region below minimum size");
                            return None;
                        }
                        Some(SelectedRegion {
                            region: RegionRef::Roi(roi.id),
                            rect,
                        })
                    })
                    .collect();
                selected
            }
        }
    }
}
