//! Dense distortion maps.
//!
//! A [`DistortionMap`] stores a displacement vector every `step` pixels. Cell
//! `(col, row)` holds the displacement at pixel `(col · step, row · step)`.
//! Warping an image by a map samples `image(p + d(p))`, so maps compose:
//! warping by `a` then by `b` equals warping once by `a.append(&b)`.

mod filter;
mod io;

#[cfg(test)]
mod tests;

use std::sync::LazyLock;

use glam::DVec2;
use rayon::prelude::*;

use crate::config::GridFilterConfig;

pub use filter::filter_and_smooth;

/// Keys cubic kernel parameter.
const KEYS_A: f64 = -0.5;

/// Resolution of the bicubic weight table.
const LUT_SIZE: usize = 256;

/// Bicubic weights for taps `-1, 0, 1, 2` at `LUT_SIZE` fractional offsets.
static BICUBIC_LUT: LazyLock<Vec<[f64; 4]>> = LazyLock::new(|| {
    (0..LUT_SIZE)
        .map(|i| {
            let t = i as f64 / LUT_SIZE as f64;
            [keys(1.0 + t), keys(t), keys(1.0 - t), keys(2.0 - t)]
        })
        .collect()
});

fn keys(x: f64) -> f64 {
    let x = x.abs();
    if x <= 1.0 {
        (KEYS_A + 2.0) * x * x * x - (KEYS_A + 3.0) * x * x + 1.0
    } else if x < 2.0 {
        KEYS_A * x * x * x - 5.0 * KEYS_A * x * x + 8.0 * KEYS_A * x - 4.0 * KEYS_A
    } else {
        0.0
    }
}

#[inline]
fn bicubic_weights(t: f64) -> [f64; 4] {
    let index = ((t * LUT_SIZE as f64) as usize).min(LUT_SIZE - 1);
    BICUBIC_LUT[index]
}

/// Regular grid of displacement vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct DistortionMap {
    step: usize,
    tile_size: usize,
    cols: usize,
    rows: usize,
    values: Vec<DVec2>,
    /// Cells holding a measurement. Unmeasured cells are filled by
    /// [`filter_and_smooth`].
    sampled: Vec<bool>,
}

impl DistortionMap {
    /// Zero map covering a `width × height` image, one cell every `step`
    /// pixels plus a margin of one tile.
    pub fn new(width: usize, height: usize, step: usize, tile_size: usize) -> Self {
        let step = step.max(1);
        let cols = (width + tile_size) / step + 1;
        let rows = (height + tile_size) / step + 1;
        Self::with_grid(step, tile_size, cols, rows)
    }

    pub(crate) fn with_grid(step: usize, tile_size: usize, cols: usize, rows: usize) -> Self {
        Self {
            step,
            tile_size,
            cols,
            rows,
            values: vec![DVec2::ZERO; cols * rows],
            sampled: vec![false; cols * rows],
        }
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn tile_size(&self) -> usize {
        self.tile_size
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn values(&self) -> &[DVec2] {
        &self.values
    }

    /// Pixel position of cell `(col, row)`.
    pub fn cell_position(&self, col: usize, row: usize) -> DVec2 {
        DVec2::new((col * self.step) as f64, (row * self.step) as f64)
    }

    pub fn get(&self, col: usize, row: usize) -> DVec2 {
        self.values[row * self.cols + col]
    }

    pub fn is_sampled(&self, col: usize, row: usize) -> bool {
        self.sampled[row * self.cols + col]
    }

    pub fn sampled_count(&self) -> usize {
        self.sampled.iter().filter(|&&s| s).count()
    }

    pub fn set(&mut self, col: usize, row: usize, value: DVec2) {
        let index = row * self.cols + col;
        self.values[index] = value;
        self.sampled[index] = true;
    }

    /// Store a measurement at the cell nearest to pixel `(x, y)`. Positions
    /// outside the grid are ignored.
    pub fn record(&mut self, x: f64, y: f64, value: DVec2) {
        if x < 0.0 || y < 0.0 {
            return;
        }
        let col = (x / self.step as f64).round() as usize;
        let row = (y / self.step as f64).round() as usize;
        if col < self.cols && row < self.rows {
            self.set(col, row, value);
        }
    }

    fn mark_all_sampled(&mut self) {
        self.sampled.fill(true);
    }

    fn extent(&self) -> DVec2 {
        DVec2::new(
            ((self.cols - 1) * self.step) as f64,
            ((self.rows - 1) * self.step) as f64,
        )
    }

    fn contains(&self, x: f64, y: f64) -> bool {
        let extent = self.extent();
        x >= 0.0 && y >= 0.0 && x <= extent.x && y <= extent.y
    }

    /// Displacement at pixel `(x, y)` by bicubic interpolation of the grid.
    /// Zero outside the grid.
    pub fn find_distortion(&self, x: f64, y: f64) -> DVec2 {
        if !self.contains(x, y) {
            return DVec2::ZERO;
        }
        let gx = x / self.step as f64;
        let gy = y / self.step as f64;
        let cx = gx.floor();
        let cy = gy.floor();
        let wx = bicubic_weights(gx - cx);
        let wy = bicubic_weights(gy - cy);
        let cx = cx as isize;
        let cy = cy as isize;

        let max_col = self.cols as isize - 1;
        let max_row = self.rows as isize - 1;
        let mut sum = DVec2::ZERO;
        for (j, &wyj) in wy.iter().enumerate() {
            let row = (cy + j as isize - 1).clamp(0, max_row) as usize;
            let mut line = DVec2::ZERO;
            for (i, &wxi) in wx.iter().enumerate() {
                let col = (cx + i as isize - 1).clamp(0, max_col) as usize;
                line += self.values[row * self.cols + col] * wxi;
            }
            sum += line * wyj;
        }
        sum
    }

    /// Displacement of the grid cell nearest to `(x, y)`. Zero outside.
    pub fn find_distortion_nearest(&self, x: f64, y: f64) -> DVec2 {
        if !self.contains(x, y) {
            return DVec2::ZERO;
        }
        let col = ((x / self.step as f64).round() as usize).min(self.cols - 1);
        let row = ((y / self.step as f64).round() as usize).min(self.rows - 1);
        self.get(col, row)
    }

    /// Mean displacement magnitude over all cells.
    pub fn total_distortion(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().map(|v| v.length()).sum::<f64>() / self.values.len() as f64
    }

    pub fn negate(&self) -> Self {
        let mut negated = self.clone();
        for v in &mut negated.values {
            *v = -*v;
        }
        negated
    }

    /// Cell-wise mean. Maps on a different grid are resampled onto the first
    /// map's grid. `None` for an empty list.
    pub fn average(maps: &[&DistortionMap]) -> Option<Self> {
        let (first, rest) = maps.split_first()?;
        let mut average = (*first).clone();
        for other in rest {
            average.for_each_cell(|p, v| *v += other.lookup_on_grid(first, p));
        }
        let scale = 1.0 / maps.len() as f64;
        for v in &mut average.values {
            *v *= scale;
        }
        average.mark_all_sampled();
        Some(average)
    }

    /// Map equivalent to warping by `self` and then by `next`:
    /// `composed(p) = next(p) + self(p + next(p))`.
    ///
    /// The result lives on the finer of the two grids.
    pub fn append(&self, next: &DistortionMap) -> Self {
        let mut composed = if next.step < self.step {
            next.clone()
        } else {
            self.clone()
        };
        composed.for_each_cell(|p, v| {
            let d = next.find_distortion(p.x, p.y);
            let q = p + d;
            *v = d + self.find_distortion(q.x, q.y);
        });
        composed.mark_all_sampled();
        composed
    }

    /// Compose a sequence of maps, first applied first.
    pub fn synthesize(maps: &[DistortionMap]) -> Option<Self> {
        let (first, rest) = maps.split_first()?;
        Some(rest.iter().fold(first.clone(), |acc, next| acc.append(next)))
    }

    /// Mean tile size of `maps`, rounded to a power of two, at least 16.
    /// The default tile size when `maps` is empty.
    pub fn turbulence_scale<'a>(maps: impl IntoIterator<Item = &'a DistortionMap>) -> usize {
        let (count, sum) = maps
            .into_iter()
            .fold((0usize, 0.0f64), |(n, s), m| (n + 1, s + m.tile_size as f64));
        if count == 0 {
            return crate::config::DEFAULT_TILE_SIZE;
        }
        let power = (sum / count as f64).max(1.0).log2().round() as u32;
        (1usize << power).max(crate::config::ABSOLUTE_MIN_TILE_SIZE)
    }

    /// Fill gaps, replace outliers and smooth. See [`filter_and_smooth`].
    pub fn filter_and_smooth(&mut self, config: &GridFilterConfig) {
        filter_and_smooth(self, config);
    }

    /// Per-pixel displacement for a `width × height` image, interleaved
    /// `dx, dy` as `f32`.
    pub fn dense_field(&self, width: usize, height: usize) -> Vec<f32> {
        let mut field = vec![0.0f32; width * height * 2];
        field
            .par_chunks_mut((width * 2).max(1))
            .enumerate()
            .for_each(|(y, row)| {
                for x in 0..width {
                    let d = self.find_distortion(x as f64, y as f64);
                    row[2 * x] = d.x as f32;
                    row[2 * x + 1] = d.y as f32;
                }
            });
        field
    }

    fn lookup_on_grid(&self, grid: &DistortionMap, p: DVec2) -> DVec2 {
        if self.step == grid.step && self.cols == grid.cols && self.rows == grid.rows {
            let col = p.x as usize / self.step;
            let row = p.y as usize / self.step;
            self.get(col, row)
        } else {
            self.find_distortion(p.x, p.y)
        }
    }

    fn for_each_cell(&mut self, f: impl Fn(DVec2, &mut DVec2) + Sync) {
        let cols = self.cols;
        let step = self.step as f64;
        self.values
            .par_chunks_mut(cols)
            .enumerate()
            .for_each(|(row, line)| {
                for (col, v) in line.iter_mut().enumerate() {
                    f(DVec2::new(col as f64 * step, row as f64 * step), v);
                }
            });
    }
}

/// Ordered per-iteration maps attached to a registered image.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DistortionMaps {
    maps: Vec<DistortionMap>,
}

impl DistortionMaps {
    pub fn new(maps: Vec<DistortionMap>) -> Self {
        Self { maps }
    }

    pub fn push(&mut self, map: DistortionMap) {
        self.maps.push(map);
    }

    pub fn extend(&mut self, maps: impl IntoIterator<Item = DistortionMap>) {
        self.maps.extend(maps);
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    pub fn maps(&self) -> &[DistortionMap] {
        &self.maps
    }

    pub fn last(&self) -> Option<&DistortionMap> {
        self.maps.last()
    }

    /// Single map equivalent to applying all maps in order.
    pub fn synthesize(&self) -> Option<DistortionMap> {
        DistortionMap::synthesize(&self.maps)
    }

    /// Registration error: residual distortion of the last iteration.
    pub fn error(&self) -> f64 {
        self.last().map_or(0.0, DistortionMap::total_distortion)
    }

    /// Local registration error at pixel `(x, y)`.
    pub fn interpolate_tile_error(&self, x: f64, y: f64) -> f64 {
        self.last()
            .map_or(0.0, |map| map.find_distortion(x, y).length())
    }

    /// Mean tile size of the maps, rounded to a power of two, at least 16.
    pub fn estimate_turbulence_scale(&self) -> usize {
        DistortionMap::turbulence_scale(&self.maps)
    }
}
