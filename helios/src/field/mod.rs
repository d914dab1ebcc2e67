//! Sparse displacement samples interpolated onto a regular grid.
//!
//! Samples come from the displacement sampler at arbitrary positions. Each
//! grid node is computed from its `k` nearest samples with a radial weight:
//!
//! - thin-plate: `1 / (1 + |r² ln r|)`, optionally scaled by
//!   `(tile_size / base_tile_size)²`
//! - Gaussian RBF: `exp(-(ε / ratio)² r²)` where `ratio` is the tile-size
//!   ratio when tile weighting is on
//! - inverse distance: `1 / r^p`
//!
//! A node that coincides with a sample takes that sample's value.

use glam::DVec2;
use rayon::prelude::*;

use crate::config::{FieldConfig, FieldInterpolation, GridFilterConfig};
use crate::distortion::DistortionMap;
use crate::sampler::DisplacementSample;
use crate::spatial::KdTree;

/// Squared distance under which a query hits a sample exactly.
const EXACT_HIT: f64 = 1e-10;

#[derive(Debug, Clone, Default)]
pub struct SparseDistortionField {
    width: usize,
    height: usize,
    config: FieldConfig,
    samples: Vec<DisplacementSample>,
}

impl SparseDistortionField {
    pub fn new(width: usize, height: usize, config: FieldConfig) -> Self {
        Self {
            width,
            height,
            config,
            samples: Vec::new(),
        }
    }

    pub fn add(&mut self, sample: DisplacementSample) {
        self.samples.push(sample);
    }

    pub fn extend(&mut self, samples: impl IntoIterator<Item = DisplacementSample>) {
        self.samples.extend(samples);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Sum of sample displacement magnitudes.
    pub fn total_displacement(&self) -> f64 {
        self.samples.iter().map(|s| s.displacement().length()).sum()
    }

    /// Interpolated displacement at `p`. Zero for an empty field.
    pub fn query(&self, p: DVec2) -> DVec2 {
        let positions: Vec<DVec2> = self.samples.iter().map(DisplacementSample::position).collect();
        let tree = KdTree::build(&positions);
        self.query_with(&tree, p)
    }

    fn query_with(&self, tree: &KdTree, p: DVec2) -> DVec2 {
        let neighbors = tree.k_nearest(p, self.config.neighbors_k);
        let mut sum = DVec2::ZERO;
        let mut weight_sum = 0.0;

        for neighbor in &neighbors {
            let sample = &self.samples[neighbor.index];
            let dist_sq = neighbor.dist_sq;
            if dist_sq < EXACT_HIT && self.config.kind != FieldInterpolation::GaussianRbf {
                return sample.displacement();
            }
            let weight = self.weight(sample, dist_sq);
            sum += sample.displacement() * weight;
            weight_sum += weight;
        }

        if weight_sum < 1e-10 {
            DVec2::ZERO
        } else {
            sum / weight_sum
        }
    }

    fn tile_ratio(&self, sample: &DisplacementSample) -> f64 {
        sample.tile_size as f64 / self.config.base_tile_size as f64
    }

    fn weight(&self, sample: &DisplacementSample, dist_sq: f64) -> f64 {
        match self.config.kind {
            FieldInterpolation::ThinPlate => {
                let phi = dist_sq * dist_sq.sqrt().ln();
                let weight = 1.0 / (1.0 + phi.abs());
                if self.config.tile_weighting {
                    let ratio = self.tile_ratio(sample);
                    weight * ratio * ratio
                } else {
                    weight
                }
            }
            FieldInterpolation::GaussianRbf => {
                let epsilon = if self.config.tile_weighting {
                    self.config.rbf_epsilon / self.tile_ratio(sample)
                } else {
                    self.config.rbf_epsilon
                };
                (-epsilon * epsilon * dist_sq).exp()
            }
            FieldInterpolation::InverseDistance => {
                1.0 / dist_sq.sqrt().powf(self.config.idw_power)
            }
        }
    }

    /// Evaluate the field at every node of a `step` grid, then filter and
    /// smooth the result.
    pub fn to_regular_grid(&self, step: usize, tile_size: usize, filter: &GridFilterConfig) -> DistortionMap {
        let mut map = DistortionMap::new(self.width, self.height, step, tile_size);
        if self.samples.is_empty() {
            return map;
        }

        let positions: Vec<DVec2> = self.samples.iter().map(DisplacementSample::position).collect();
        let tree = KdTree::build(&positions);
        let cols = map.cols();
        let nodes: Vec<(usize, usize)> = (0..map.rows())
            .flat_map(|row| (0..cols).map(move |col| (col, row)))
            .collect();
        let values: Vec<DVec2> = nodes
            .par_iter()
            .map(|&(col, row)| self.query_with(&tree, map.cell_position(col, row)))
            .collect();
        for (&(col, row), value) in nodes.iter().zip(values) {
            map.set(col, row, value);
        }

        map.filter_and_smooth(filter);
        map
    }
}
