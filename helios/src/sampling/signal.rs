//! Tile signal checks backed by summed-area tables.

use rayon::prelude::*;

use super::SamplePosition;

/// Summed-area table for O(1) rectangle sums.
#[derive(Debug, Clone)]
pub(crate) struct IntegralImage {
    width: usize,
    height: usize,
    /// `(width + 1) × (height + 1)`, first row and column zero.
    sums: Vec<f64>,
}

impl IntegralImage {
    pub fn new(data: &[f32], width: usize, height: usize) -> Self {
        debug_assert_eq!(data.len(), width * height);
        let stride = width + 1;
        let mut sums = vec![0.0f64; stride * (height + 1)];

        // Row prefix sums in parallel, then a sequential column pass.
        sums.par_chunks_mut(stride)
            .skip(1)
            .zip(data.par_chunks(width.max(1)))
            .for_each(|(row, pixels)| {
                let mut acc = 0.0;
                for (x, &v) in pixels.iter().enumerate() {
                    acc += v as f64;
                    row[x + 1] = acc;
                }
            });
        for y in 1..=height {
            for x in 1..=width {
                sums[y * stride + x] += sums[(y - 1) * stride + x];
            }
        }

        Self {
            width,
            height,
            sums,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Sum over `[x0, x0 + w) × [y0, y0 + h)`, clipped to the image.
    pub fn area_sum(&self, x0: usize, y0: usize, w: usize, h: usize) -> f64 {
        let x1 = (x0 + w).min(self.width);
        let y1 = (y0 + h).min(self.height);
        let x0 = x0.min(x1);
        let y0 = y0.min(y1);
        let stride = self.width + 1;
        self.sums[y1 * stride + x1] - self.sums[y0 * stride + x1] - self.sums[y1 * stride + x0]
            + self.sums[y0 * stride + x0]
    }

    /// Mean over `[x0, x0 + w) × [y0, y0 + h)`, clipped to the image. Empty
    /// areas give 0.
    pub fn area_mean(&self, x0: usize, y0: usize, w: usize, h: usize) -> f64 {
        let cw = (x0 + w).min(self.width).saturating_sub(x0);
        let ch = (y0 + h).min(self.height).saturating_sub(y0);
        if cw == 0 || ch == 0 {
            return 0.0;
        }
        self.area_sum(x0, y0, w, h) / (cw * ch) as f64
    }
}

/// Decides whether a tile carries enough signal in both images.
#[derive(Debug, Clone)]
pub(crate) struct SignalEvaluator {
    reference: IntegralImage,
    target: IntegralImage,
    threshold: f64,
}

impl SignalEvaluator {
    pub fn new(reference: IntegralImage, target: IntegralImage, threshold: f32) -> Self {
        Self {
            reference,
            target,
            threshold: threshold as f64,
        }
    }

    pub fn has_signal(&self, position: &SamplePosition) -> bool {
        let SamplePosition { x, y, tile_size } = *position;
        self.reference.area_mean(x, y, tile_size, tile_size) >= self.threshold
            && self.target.area_mean(x, y, tile_size, tile_size) >= self.threshold
    }

    pub fn retain(&self, positions: &mut Vec<SamplePosition>) {
        positions.retain(|p| self.has_signal(p));
    }
}
