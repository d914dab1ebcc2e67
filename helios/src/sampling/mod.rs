//! Where to measure displacement.
//!
//! A sampling strategy turns an image into tile positions: a uniform grid, or
//! sparse interest points on strong gradients. Positions without enough
//! signal are dropped, and an empty result is a valid outcome.

mod grid;
mod interest;
mod signal;


use glam::DVec2;

use crate::config::{SamplingConfig, SamplingStrategy};
use crate::image::Image;

pub(crate) use grid::grid_positions;
pub use interest::{InterestPointDetector, MAX_INTEREST_POINTS};
pub(crate) use signal::{IntegralImage, SignalEvaluator};

/// Top-left corner and edge of a square sampling tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SamplePosition {
    pub x: usize,
    pub y: usize,
    pub tile_size: usize,
}

impl SamplePosition {
    pub fn new(x: usize, y: usize, tile_size: usize) -> Self {
        Self { x, y, tile_size }
    }

    pub fn center(&self) -> DVec2 {
        let half = self.tile_size as f64 / 2.0;
        DVec2::new(self.x as f64 + half, self.y as f64 + half)
    }

    pub fn fits(&self, width: usize, height: usize) -> bool {
        self.x + self.tile_size <= width && self.y + self.tile_size <= height
    }
}

/// Select tile positions on `source`.
///
/// Grid positions are spaced by `increment`; interest points ignore it. Every
/// returned tile lies inside the image, has a mean of at least the configured
/// signal threshold and appears once.
pub fn select_positions(
    source: &Image,
    tile_size: usize,
    increment: usize,
    config: &SamplingConfig,
    detector: &InterestPointDetector,
) -> Vec<SamplePosition> {
    let (width, height) = source.dimensions();
    let mut positions = match config.strategy {
        SamplingStrategy::Grid => {
            let integral = IntegralImage::new(source.data(), width, height);
            let threshold = config.signal_threshold as f64;
            let mut positions = grid_positions(width, height, tile_size, increment);
            positions.retain(|p| integral.area_mean(p.x, p.y, p.tile_size, p.tile_size) >= threshold);
            positions
        }
        SamplingStrategy::InterestPoint { multiscale } => detector
            .detect(source, tile_size, multiscale, config.signal_threshold)
            .to_vec(),
    };
    positions.sort_unstable();
    positions.dedup();
    positions
}
