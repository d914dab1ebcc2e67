//! Float image with per-channel planes and typed metadata.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};

/// Channel layout of an [`Image`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channels {
    Mono,
    Rgb,
}

impl Channels {
    pub fn count(self) -> usize {
        match self {
            Channels::Mono => 1,
            Channels::Rgb => 3,
        }
    }
}

/// Open-ended metadata keyed by value type.
///
/// Values are shared behind `Arc`, so cloning an image does not copy its
/// metadata payloads.
#[derive(Clone, Default)]
pub struct Metadata {
    entries: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the value stored under `T`.
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) {
        self.entries.insert(TypeId::of::<T>(), Arc::new(value));
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
    }

    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<T>())
    }

    pub fn remove<T: Any + Send + Sync>(&mut self) -> bool {
        self.entries.remove(&TypeId::of::<T>()).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge metadata of several images; the first image wins on conflicts.
    pub fn merge<'a>(sources: impl IntoIterator<Item = &'a Metadata>) -> Metadata {
        let mut merged = Metadata::new();
        for source in sources {
            for (key, value) in &source.entries {
                merged
                    .entries
                    .entry(*key)
                    .or_insert_with(|| Arc::clone(value));
            }
        }
        merged
    }
}

impl fmt::Debug for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metadata")
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// Where an image came from. Used for deterministic ordering and manual
/// reference selection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceInfo {
    pub file_name: String,
}

/// Marks an image as a keyframe for consensus dedistortion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsensusKeyframe;

/// Marks a reference chosen for consensus stacking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsensusReference;

/// Result of a solar limb ellipse fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EllipseFit {
    pub eccentricity: f64,
}

static NEXT_IMAGE_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_IMAGE_ID.fetch_add(1, Ordering::Relaxed)
}

/// A floating point image. One plane for mono, three for RGB.
///
/// Every image carries a process-unique content id. Clones share it; any
/// mutable pixel access assigns a fresh one, so caches keyed by id never see
/// stale pixels.
#[derive(Debug, Clone)]
pub struct Image {
    id: u64,
    width: usize,
    height: usize,
    channels: Channels,
    planes: Vec<Vec<f32>>,
    metadata: Metadata,
}

impl Image {
    /// Create a mono image from row-major pixel data.
    ///
    /// # Panics
    ///
    /// Panics if `data.len() != width * height`.
    pub fn mono(width: usize, height: usize, data: Vec<f32>) -> Self {
        assert_eq!(
            data.len(),
            width * height,
            "pixel count must match {width}x{height}"
        );
        Self {
            id: next_id(),
            width,
            height,
            channels: Channels::Mono,
            planes: vec![data],
            metadata: Metadata::new(),
        }
    }

    /// Create an RGB image from three row-major planes.
    ///
    /// # Panics
    ///
    /// Panics if any plane does not hold `width * height` pixels.
    pub fn rgb(width: usize, height: usize, planes: [Vec<f32>; 3]) -> Self {
        for plane in &planes {
            assert_eq!(
                plane.len(),
                width * height,
                "pixel count must match {width}x{height}"
            );
        }
        Self {
            id: next_id(),
            width,
            height,
            channels: Channels::Rgb,
            planes: planes.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    pub fn channels(&self) -> Channels {
        self.channels
    }

    pub fn is_mono(&self) -> bool {
        self.channels == Channels::Mono
    }

    pub fn plane(&self, channel: usize) -> &[f32] {
        &self.planes[channel]
    }

    pub fn plane_mut(&mut self, channel: usize) -> &mut [f32] {
        self.id = next_id();
        &mut self.planes[channel]
    }

    /// First plane. For mono images this is the whole image.
    pub fn data(&self) -> &[f32] {
        &self.planes[0]
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        self.id = next_id();
        &mut self.planes[0]
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.planes[0][y * self.width + x]
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    pub fn with_metadata<T: std::any::Any + Send + Sync>(mut self, value: T) -> Self {
        self.metadata.insert(value);
        self
    }

    /// New mono image with the same size and metadata but different pixels.
    pub fn with_data(&self, data: Vec<f32>) -> Self {
        let mut image = Image::mono(self.width, self.height, data);
        image.metadata = self.metadata.clone();
        image
    }

    pub fn file_name(&self) -> Option<&str> {
        self.metadata.get::<SourceInfo>().map(|s| s.file_name.as_str())
    }

    /// Check that every image is mono and sized like the first one.
    pub(crate) fn check_mono_set(images: &[&Image]) -> Result<(usize, usize)> {
        let first = images.first().ok_or(Error::EmptyImageList)?;
        let expected = first.dimensions();
        for (index, image) in images.iter().enumerate() {
            if !image.is_mono() {
                return Err(Error::NotMono {
                    index,
                    channels: image.channels.count(),
                });
            }
            if image.dimensions() != expected {
                return Err(Error::DimensionMismatch {
                    index,
                    expected,
                    actual: image.dimensions(),
                });
            }
        }
        Ok(expected)
    }
}

/// Bilinear sample with edge clamping. Coordinates are in pixels.
#[inline]
pub(crate) fn bilinear_clamped(data: &[f32], width: usize, height: usize, x: f64, y: f64) -> f32 {
    let max_x = (width - 1) as f64;
    let max_y = (height - 1) as f64;
    let x = x.clamp(0.0, max_x);
    let y = y.clamp(0.0, max_y);

    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let fx = (x - x0 as f64) as f32;
    let fy = (y - y0 as f64) as f32;

    let p00 = data[y0 * width + x0];
    let p10 = data[y0 * width + x1];
    let p01 = data[y1 * width + x0];
    let p11 = data[y1 * width + x1];

    let top = p00 + fx * (p10 - p00);
    let bottom = p01 + fx * (p11 - p01);
    top + fy * (bottom - top)
}
