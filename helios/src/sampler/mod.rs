//! Displacement sampling: correlate reference and target tiles at a set of
//! positions and keep the confident measurements.
//!
//! Positions are grouped by tile size because batched correlation needs
//! uniform tiles. Each group goes to the accelerator when one holds both
//! images, otherwise to the CPU batch correlator.


use std::collections::BTreeMap;

use glam::DVec2;
use tracing::{debug, warn};

use crate::correlation::{TileCorrelator, TileShift};
use crate::gpu::{BufferId, GpuSession};
use crate::image::Image;
use crate::sampling::{IntegralImage, SamplePosition, SignalEvaluator};

/// Tiles correlated per CPU batch. Bounds the memory held by extracted tiles.
const CPU_BATCH_TILES: usize = 512;

/// One measured displacement at a tile center.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplacementSample {
    pub x: f64,
    pub y: f64,
    pub dx: f64,
    pub dy: f64,
    pub tile_size: usize,
    pub confidence: f64,
}

impl DisplacementSample {
    pub fn from_shift(position: &SamplePosition, shift: TileShift) -> Self {
        let center = position.center();
        Self {
            x: center.x,
            y: center.y,
            dx: shift.dx,
            dy: shift.dy,
            tile_size: position.tile_size,
            confidence: shift.confidence,
        }
    }

    pub fn position(&self) -> DVec2 {
        DVec2::new(self.x, self.y)
    }

    pub fn displacement(&self) -> DVec2 {
        DVec2::new(self.dx, self.dy)
    }
}

/// Positions split into size-homogeneous groups, ordered by tile size.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TileGroups {
    groups: BTreeMap<usize, Vec<SamplePosition>>,
}

impl TileGroups {
    /// Keep positions that fit the image and have signal in both images.
    pub fn new(positions: &[SamplePosition], reference: &Image, target: &Image, signal_threshold: f32) -> Self {
        let (width, height) = reference.dimensions();
        let signal = SignalEvaluator::new(
            IntegralImage::new(reference.data(), width, height),
            IntegralImage::new(target.data(), width, height),
            signal_threshold,
        );

        let mut groups: BTreeMap<usize, Vec<SamplePosition>> = BTreeMap::new();
        for position in positions {
            if position.fits(width, height) && signal.has_signal(position) {
                groups.entry(position.tile_size).or_default().push(*position);
            }
        }
        Self { groups }
    }

    pub fn from_groups(groups: BTreeMap<usize, Vec<SamplePosition>>) -> Self {
        Self { groups }
    }

    pub fn is_empty(&self) -> bool {
        self.groups.values().all(Vec::is_empty)
    }

    pub fn total(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &[SamplePosition])> {
        self.groups.iter().map(|(&size, p)| (size, p.as_slice()))
    }

    pub fn insert(&mut self, tile_size: usize, positions: Vec<SamplePosition>) {
        self.groups.entry(tile_size).or_default().extend(positions);
    }
}

impl IntoIterator for TileGroups {
    type Item = (usize, Vec<SamplePosition>);
    type IntoIter = std::collections::btree_map::IntoIter<usize, Vec<SamplePosition>>;

    fn into_iter(self) -> Self::IntoIter {
        self.groups.into_iter()
    }
}

/// Outcome of the device phase for one image pair.
#[derive(Debug, Default)]
pub struct DeviceMeasurement {
    pub samples: Vec<DisplacementSample>,
    /// Groups left for the CPU.
    pub remaining: TileGroups,
}

impl DeviceMeasurement {
    /// Everything left for the CPU.
    pub fn cpu_only(groups: TileGroups) -> Self {
        Self {
            samples: Vec::new(),
            remaining: groups,
        }
    }

    /// Run the remaining groups on the CPU and return all samples.
    pub fn finish(self, correlator: &TileCorrelator, reference: &Image, target: &Image) -> Vec<DisplacementSample> {
        let mut samples = self.samples;
        samples.extend(correlate_groups(correlator, reference, target, &self.remaining));
        samples
    }
}

/// Correlate the groups the device accepts between two resident images.
///
/// Small groups, unsupported tile sizes and failed dispatches are handed
/// back for the CPU. Must run inside the session's lock.
pub fn correlate_on_device(
    session: &mut GpuSession<'_>,
    reference: BufferId,
    target: BufferId,
    dimensions: (usize, usize),
    groups: TileGroups,
) -> DeviceMeasurement {
    let (width, height) = dimensions;
    let mut measurement = DeviceMeasurement::default();
    for (size, positions) in groups {
        if !session.accepts_group(size, positions.len()) {
            measurement.remaining.insert(size, positions);
            continue;
        }
        match session.correlate_batched(reference, target, width, height, size, &positions) {
            Ok(shifts) => measurement.samples.extend(
                positions
                    .iter()
                    .zip(shifts)
                    .map(|(p, s)| DisplacementSample::from_shift(p, s)),
            ),
            Err(e) => {
                warn!(tile_size = size, error = %e, "Device correlation failed, using CPU");
                measurement.remaining.insert(size, positions);
            }
        }
    }
    measurement
}

/// Copy `size × size` tiles at `positions` back to back.
pub(crate) fn extract_tiles(data: &[f32], width: usize, positions: &[SamplePosition], size: usize) -> Vec<f32> {
    let mut tiles = Vec::with_capacity(positions.len() * size * size);
    for p in positions {
        for y in p.y..p.y + size {
            let row = y * width + p.x;
            tiles.extend_from_slice(&data[row..row + size]);
        }
    }
    tiles
}

/// CPU correlation of one tile-size group.
pub fn correlate_group(
    correlator: &TileCorrelator,
    reference: &Image,
    target: &Image,
    tile_size: usize,
    positions: &[SamplePosition],
) -> Vec<DisplacementSample> {
    let batches = common::parallel::par_for_batches(positions, CPU_BATCH_TILES, |_, batch| {
        let references = extract_tiles(reference.data(), reference.width(), batch, tile_size);
        let targets = extract_tiles(target.data(), target.width(), batch, tile_size);
        let shifts = correlator.ncc_batch(&references, &targets, tile_size);
        batch
            .iter()
            .zip(shifts)
            .map(|(p, s)| DisplacementSample::from_shift(p, s))
            .collect::<Vec<_>>()
    });
    batches.into_iter().flatten().collect()
}

/// Correlate every group on the CPU.
pub fn correlate_groups(
    correlator: &TileCorrelator,
    reference: &Image,
    target: &Image,
    groups: &TileGroups,
) -> Vec<DisplacementSample> {
    let mut samples = Vec::with_capacity(groups.total());
    for (size, positions) in groups.iter() {
        debug!(tile_size = size, tiles = positions.len(), "CPU tile correlation");
        samples.extend(correlate_group(correlator, reference, target, size, positions));
    }
    samples
}

/// Drop the `round(percentile · n)` least confident samples.
///
/// The cut is computed from the samples themselves on every call. Retained
/// samples keep their input order.
pub fn reject_low_confidence(samples: Vec<DisplacementSample>, percentile: f64) -> Vec<DisplacementSample> {
    let n = samples.len();
    let drop = ((percentile.clamp(0.0, 1.0) * n as f64).round() as usize).min(n);
    if drop == 0 {
        return samples;
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        samples[a]
            .confidence
            .total_cmp(&samples[b].confidence)
            .then(a.cmp(&b))
    });
    let mut keep = vec![true; n];
    for &i in &order[..drop] {
        keep[i] = false;
    }

    samples
        .into_iter()
        .zip(keep)
        .filter_map(|(s, k)| k.then_some(s))
        .collect()
}
