//! Frame, region and tensor types shared across the stage core.
//!
//! # Ownership model
//!
//! [`BufferHandle`] wraps buffer data via `Arc`.  This provides:
//!
//! - **Shared ownership**: cloning a handle increments a reference count.
//!   Pixel storage is never copied.
//! - **Copy-on-write**: metadata may only be written through a handle that is
//!   [writable](BufferHandle::is_writable) (sole reference).  Otherwise the
//!   writer calls [`duplicate`](BufferHandle::duplicate), which yields a new
//!   buffer identity sharing the pixels and owning a private metadata copy.
//! - **Identity**: handle equality compares [`BufferId`]s, never contents.
//!
//! # Invariants
//!
//! 1. Pixel storage is immutable once wrapped.  Duplicates share it.
//! 2. `pixels.len()` ≥ `format.byte_size(width, height, stride)` for every
//!    buffer that maps successfully.
//! 3. Region ids are unique within one [`FrameMeta`] and survive duplication.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EngineError, Result};

// ─── Pixel format ────────────────────────────────────────────────────────────

/// Host pixel format of a frame buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// Interleaved 8-bit BGR, 3 bytes per pixel.
    Bgr,
    /// Interleaved 8-bit BGRX, 4 bytes per pixel (X ignored).
    Bgrx,
    /// Interleaved 8-bit RGB, 3 bytes per pixel.
    Rgb,
    /// Single 8-bit luminance plane.
    Gray8,
    /// Y plane of `height × stride` bytes followed by an interleaved UV plane
    /// of `(height / 2) × stride` bytes.  Crops address the Y plane.
    Nv12,
}

impl PixelFormat {
    /// Bytes per pixel in the first (addressable) plane.
    #[inline]
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Bgr | Self::Rgb => 3,
            Self::Bgrx => 4,
            Self::Gray8 | Self::Nv12 => 1,
        }
    }

    /// Minimum storage size in bytes for the given dimensions.
    #[inline]
    pub const fn byte_size(self, height: u32, stride: usize) -> usize {
        match self {
            Self::Nv12 => stride * (height as usize) + stride * (height as usize).div_ceil(2),
            _ => stride * (height as usize),
        }
    }
}

/// Geometry and layout of a frame buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameInfo {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Row stride in bytes of the first plane.
    pub stride: usize,
}

impl FrameInfo {
    /// Dense layout: stride equals `width × bytes_per_pixel`.
    pub fn packed(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            stride: width as usize * format.bytes_per_pixel(),
        }
    }

    #[inline]
    pub fn byte_size(&self) -> usize {
        self.format.byte_size(self.height, self.stride)
    }

    /// Rectangle covering the whole frame.
    pub fn full_rect(&self) -> Rect {
        Rect::new(0, 0, self.width, self.height)
    }
}

// ─── Geometry ────────────────────────────────────────────────────────────────

/// Axis-aligned rectangle in pixel coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Intersect with `[0, width) × [0, height)`.  `None` when nothing is left.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<Rect> {
        let x0 = self.x.min(width);
        let y0 = self.y.min(height);
        let x1 = self.x.saturating_add(self.width).min(width);
        let y1 = self.y.saturating_add(self.height).min(height);
        let clamped = Rect::new(x0, y0, x1 - x0, y1 - y0);
        (!clamped.is_empty()).then_some(clamped)
    }
}

// ─── Attached metadata ───────────────────────────────────────────────────────

/// One inference result attached to a frame or region.
///
/// Raw converters fill `dims`/`data`; classification converters also set
/// `label` and `confidence`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TensorMeta {
    /// Name of the output layer the result came from.
    pub layer: String,
    /// Model instance that produced the result.
    pub model: String,
    pub dims: Vec<usize>,
    pub data: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_id: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// A rectangular area of interest, optionally tagged with a class.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RegionOfInterest {
    /// Unique within the owning frame.
    pub id: u32,
    pub rect: Rect,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_id: Option<usize>,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub tensors: Vec<TensorMeta>,
}

/// Reference to the region an inference request was built from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegionRef {
    /// Synthetic region covering the entire frame.
    FullFrame,
    /// Attached region, by [`RegionOfInterest::id`].
    Roi(u32),
}

/// All metadata attached to one buffer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameMeta {
    pub regions: Vec<RegionOfInterest>,
    /// Results of full-frame requests.
    pub tensors: Vec<TensorMeta>,
    next_region_id: u32,
}

impl FrameMeta {
    /// Attach a new region and return its id.
    pub fn add_region(
        &mut self,
        rect: Rect,
        label: Option<String>,
        label_id: Option<usize>,
        confidence: f32,
    ) -> u32 {
        let id = self
            .regions
            .iter()
            .map(|r| r.id + 1)
            .max()
            .unwrap_or(0)
            .max(self.next_region_id);
        self.next_region_id = id + 1;
        self.regions.push(RegionOfInterest {
            id,
            rect,
            label,
            label_id,
            confidence,
            tensors: Vec::new(),
        });
        id
    }

    pub fn region(&self, id: u32) -> Option<&RegionOfInterest> {
        self.regions.iter().find(|r| r.id == id)
    }

    pub fn region_mut(&mut self, id: u32) -> Option<&mut RegionOfInterest> {
        self.regions.iter_mut().find(|r| r.id == id)
    }

    /// Attach a tensor to the frame (`FullFrame`) or to an existing region.
    pub fn attach(&mut self, target: RegionRef, tensor: TensorMeta) -> Result<()> {
        match target {
            RegionRef::FullFrame => {
                self.tensors.push(tensor);
                Ok(())
            }
            RegionRef::Roi(id) => {
                let region = self.region_mut(id).ok_or_else(|| {
                    EngineError::PostProcess(format!("region {id} is not attached to the frame"))
                })?;
                region.tensors.push(tensor);
                Ok(())
            }
        }
    }
}

// ─── Buffer handle ───────────────────────────────────────────────────────────

/// Process-unique identity of one buffer allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

impl BufferId {
    fn next() -> Self {
        Self(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

struct BufferData {
    id: BufferId,
    info: FrameInfo,
    pixels: Arc<[u8]>,
    meta: Mutex<FrameMeta>,
}

/// Reference-counted, copy-on-write media buffer.
///
/// # Thread safety
///
/// `BufferHandle` is `Send + Sync`.  Metadata sits behind a mutex so that
/// result writers on different engine threads can attach to the same
/// writable buffer; whether a handle *may* be written is decided by the
/// owner through [`is_writable`](Self::is_writable).
#[derive(Clone)]
pub struct BufferHandle {
    inner: Arc<BufferData>,
}

// Compile-time proof that BufferHandle is Send + Sync.
#[allow(dead_code)]
const _: () = {
    fn assert_send_sync<T: Send + Sync>() {}
    fn check() {
        assert_send_sync::<BufferHandle>();
    }
};

impl BufferHandle {
    pub fn new(info: FrameInfo, pixels: impl Into<Arc<[u8]>>, meta: FrameMeta) -> Self {
        Self {
            inner: Arc::new(BufferData {
                id: BufferId::next(),
                info,
                pixels: pixels.into(),
                meta: Mutex::new(meta),
            }),
        }
    }

    /// Zero-filled buffer with dense layout.
    pub fn zeroed(info: FrameInfo) -> Self {
        Self::new(info, vec![0u8; info.byte_size()], FrameMeta::default())
    }

    #[inline]
    pub fn id(&self) -> BufferId {
        self.inner.id
    }

    #[inline]
    pub fn info(&self) -> FrameInfo {
        self.inner.info
    }

    /// `true` when this handle is the only reference to the buffer.
    #[inline]
    pub fn is_writable(&self) -> bool {
        Arc::strong_count(&self.inner) == 1
    }

    /// New buffer identity sharing pixel storage with a private metadata copy.
    pub fn duplicate(&self) -> Self {
        let meta = self.meta().clone();
        let copy = Self {
            inner: Arc::new(BufferData {
                id: BufferId::next(),
                info: self.inner.info,
                pixels: Arc::clone(&self.inner.pixels),
                meta: Mutex::new(meta),
            }),
        };
        debug!(
            from = self.inner.id.0,
            to = copy.inner.id.0,
            regions = copy.meta().regions.len(),
            "Buffer duplicated for writing"
        );
        copy
    }

    /// Lock the metadata block.
    ///
    /// A poisoned lock is recovered: metadata updates are single pushes, so a
    /// panicking writer cannot leave it half-written.
    pub fn meta(&self) -> MutexGuard<'_, FrameMeta> {
        self.inner
            .meta
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Read-only view of the whole frame.
    ///
    /// Fails with [`EngineError::BufferMap`] when the storage is smaller than
    /// the layout declared by [`FrameInfo`].
    pub fn map(&self) -> Result<ImageView> {
        let info = self.inner.info;
        let need = info.byte_size();
        let have = self.inner.pixels.len();
        if have < need {
            return Err(EngineError::BufferMap(format!(
                "buffer {} holds {have} bytes, {:?} {}x{} stride {} needs {need}",
                self.inner.id.0, info.format, info.width, info.height, info.stride
            )));
        }
        if info.stride < info.width as usize * info.format.bytes_per_pixel() {
            return Err(EngineError::BufferMap(format!(
                "buffer {} stride {} is shorter than one row of {} pixels",
                self.inner.id.0, info.stride, info.width
            )));
        }
        Ok(ImageView {
            pixels: Arc::clone(&self.inner.pixels),
            info,
            roi: info.full_rect(),
        })
    }
}

impl PartialEq for BufferHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for BufferHandle {}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHandle")
            .field("id", &self.inner.id)
            .field("info", &self.inner.info)
            .field("refs", &Arc::strong_count(&self.inner))
            .finish()
    }
}

// ─── Frame ───────────────────────────────────────────────────────────────────

/// One unit of media flowing through a stage.
#[derive(Clone, Debug)]
pub struct Frame {
    pub buffer: BufferHandle,
    /// Zero-based frame index within the stream.
    pub index: u64,
    /// Presentation timestamp in microseconds.
    pub pts: i64,
}

impl Frame {
    pub fn new(buffer: BufferHandle, index: u64, pts: i64) -> Self {
        Self { buffer, index, pts }
    }

    #[inline]
    pub fn info(&self) -> FrameInfo {
        self.buffer.info()
    }
}

// ─── Image view ──────────────────────────────────────────────────────────────

/// Read-only view of a rectangle inside mapped pixel storage.
///
/// Holds the pixel `Arc`, not the buffer handle, so in-flight requests never
/// count against a buffer's writability.
#[derive(Clone)]
pub struct ImageView {
    pixels: Arc<[u8]>,
    info: FrameInfo,
    roi: Rect,
}

impl ImageView {
    #[inline]
    pub fn info(&self) -> FrameInfo {
        self.info
    }

    /// Rectangle this view covers, in frame coordinates.
    #[inline]
    pub fn roi(&self) -> Rect {
        self.roi
    }

    /// Narrow the view to `rect` clamped to the frame extent.
    pub fn crop(&self, rect: Rect) -> Result<ImageView> {
        let clamped = rect
            .clamp_to(self.info.width, self.info.height)
            .ok_or_else(|| {
                EngineError::BufferMap(format!(
                    "crop {rect:?} lies outside {}x{} frame",
                    self.info.width, self.info.height
                ))
            })?;
        Ok(ImageView {
            pixels: Arc::clone(&self.pixels),
            info: self.info,
            roi: clamped,
        })
    }

    /// Bytes of row `y` (relative to the view) inside the view's columns.
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        if y >= self.roi.height {
            return None;
        }
        let bpp = self.info.format.bytes_per_pixel();
        let start = (self.roi.y + y) as usize * self.info.stride + self.roi.x as usize * bpp;
        let end = start + self.roi.width as usize * bpp;
        self.pixels.get(start..end)
    }

    /// Mean byte value over the view; a cheap content signature.
    pub fn mean_intensity(&self) -> f32 {
        let mut sum = 0u64;
        let mut count = 0u64;
        for y in 0..self.roi.height {
            if let Some(row) = self.row(y) {
                sum += row.iter().map(|&b| b as u64).sum::<u64>();
                count += row.len() as u64;
            }
        }
        if count == 0 {
            0.0
        } else {
            sum as f32 / count as f32
        }
    }
}

impl fmt::Debug for ImageView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageView")
            .field("info", &self.info)
            .field("roi", &self.roi)
            .finish()
    }
}

// ─── Output tensors ──────────────────────────────────────────────────────────

/// One output layer for a whole batch.  `dims[0]` is the batch axis.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputTensor {
    pub dims: Vec<usize>,
    pub data: Vec<f32>,
}

impl OutputTensor {
    pub fn new(dims: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = dims.iter().product();
        if expected != data.len() {
            return Err(EngineError::PostProcess(format!(
                "tensor dims {dims:?} describe {expected} values but {} were produced",
                data.len()
            )));
        }
        Ok(Self { dims, data })
    }

    pub fn batch(&self) -> usize {
        self.dims.first().copied().unwrap_or(0)
    }

    /// Dims of one batch item.
    pub fn item_dims(&self) -> &[usize] {
        self.dims.get(1..).unwrap_or(&[])
    }

    /// Values of batch item `index`.
    pub fn item(&self, index: usize) -> Option<&[f32]> {
        let per_item: usize = self.item_dims().iter().product();
        let start = index.checked_mul(per_item)?;
        self.data.get(start..start + per_item)
    }
}

/// Output layers of one batch, keyed by layer name.
pub type TensorMap = std::collections::BTreeMap<String, OutputTensor>;

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> FrameInfo {
        FrameInfo::packed(8, 4, PixelFormat::Bgr)
    }

    #[test]
    fn clamp_rejects_regions_outside_frame() {
        assert_eq!(Rect::new(10, 0, 4, 4).clamp_to(8, 4), None);
        assert_eq!(
            Rect::new(6, 2, 10, 10).clamp_to(8, 4),
            Some(Rect::new(6, 2, 2, 2))
        );
    }

    #[test]
    fn duplicate_shares_pixels_but_not_metadata() {
        let original = BufferHandle::zeroed(info());
        original
            .meta()
            .add_region(Rect::new(0, 0, 2, 2), Some("car".into()), None, 0.9);
        let copy = original.duplicate();
        assert_ne!(original, copy);

        copy.meta()
            .attach(RegionRef::Roi(0), TensorMeta::default())
            .expect("region 0 exists on the copy");
        assert!(original.meta().regions[0].tensors.is_empty());
        assert_eq!(copy.meta().regions[0].tensors.len(), 1);
    }

    #[test]
    fn writability_tracks_handle_count() {
        let handle = BufferHandle::zeroed(info());
        assert!(handle.is_writable());
        let view = handle.map().expect("map");
        assert!(handle.is_writable(), "image views do not hold the handle");
        let second = handle.clone();
        assert!(!handle.is_writable());
        drop(second);
        assert!(handle.is_writable());
        drop(view);
    }

    #[test]
    fn map_rejects_short_storage() {
        let handle = BufferHandle::new(info(), vec![0u8; 10], FrameMeta::default());
        let err = handle.map().expect_err("storage is too small");
        assert!(err.to_string().contains("needs 96"));
    }

    #[test]
    fn crop_rows_address_region_columns() {
        let info = FrameInfo::packed(4, 2, PixelFormat::Gray8);
        let handle = BufferHandle::new(info, (0u8..8).collect::<Vec<_>>(), FrameMeta::default());
        let view = handle.map().expect("map").crop(Rect::new(1, 1, 2, 5)).expect("crop");
        assert_eq!(view.roi(), Rect::new(1, 1, 2, 1));
        assert_eq!(view.row(0), Some(&[5u8, 6][..]));
        assert_eq!(view.row(1), None);
    }

    #[test]
    fn region_ids_stay_unique_after_removal() {
        let mut meta = FrameMeta::default();
        let a = meta.add_region(Rect::new(0, 0, 1, 1), None, None, 1.0);
        let b = meta.add_region(Rect::new(0, 0, 1, 1), None, None, 1.0);
        meta.regions.retain(|r| r.id != b);
        let c = meta.add_region(Rect::new(0, 0, 1, 1), None, None, 1.0);
        assert_ne!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn tensor_items_follow_batch_axis() {
        let t = OutputTensor::new(vec![2, 3], vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).expect("dims");
        assert_eq!(t.batch(), 2);
        assert_eq!(t.item(1), Some(&[3.0, 4.0, 5.0][..]));
        assert_eq!(t.item(2), None);
        assert!(OutputTensor::new(vec![2, 2], vec![0.0]).is_err());
    }
}
