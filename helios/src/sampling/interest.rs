//! Sparse interest-point sampling on gradient maxima.

use std::collections::HashMap;
use std::sync::Arc;

use glam::DVec2;
use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::debug;

use super::SamplePosition;
use super::signal::IntegralImage;
use crate::config::MIN_TILE_SIZE;
use crate::image::Image;
use crate::spatial::KdTree;

/// Upper bound on points emitted per detection.
pub const MAX_INTEREST_POINTS: usize = 8192;

/// Fraction of the interior gradient maximum a candidate must exceed.
const GRADIENT_THRESHOLD: f32 = 0.15;

/// Minimum distance between accepted points, as a fraction of the tile size.
const SPACING: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CacheKey {
    image: u64,
    tile_size: usize,
    multiscale: bool,
}

/// Detects interest points and memoizes them per image and tile size.
///
/// One detector lives for one engine run. In consensus mode every image is
/// the source of many directed comparisons, so detections are reused.
#[derive(Debug, Default)]
pub struct InterestPointDetector {
    cache: Mutex<HashMap<CacheKey, Arc<Vec<SamplePosition>>>>,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    x: usize,
    y: usize,
    score: f32,
}

impl InterestPointDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.lock().len()
    }

    /// Interest points of `image` for `tile_size`.
    ///
    /// With `multiscale`, layers of `2·ts`, `ts` and `max(32, ts/2)` are
    /// detected from coarse to fine; finer layers only add points away from
    /// the ones already taken.
    pub fn detect(
        &self,
        image: &Image,
        tile_size: usize,
        multiscale: bool,
        signal_threshold: f32,
    ) -> Arc<Vec<SamplePosition>> {
        let key = CacheKey {
            image: image.id(),
            tile_size,
            multiscale,
        };
        if let Some(hit) = self.cache.lock().get(&key) {
            return Arc::clone(hit);
        }

        // Detection runs outside the lock; a racing insert of the same key
        // produces identical points.
        let points = Arc::new(detect_layers(image, tile_size, multiscale, signal_threshold));
        let mut cache = self.cache.lock();
        Arc::clone(cache.entry(key).or_insert(points))
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }
}

fn layer_sizes(tile_size: usize, multiscale: bool, width: usize, height: usize) -> Vec<usize> {
    let limit = width.min(height);
    let mut sizes = if multiscale {
        vec![tile_size * 2, tile_size, (tile_size / 2).max(MIN_TILE_SIZE)]
    } else {
        vec![tile_size]
    };
    sizes.retain(|&s| s <= limit);
    sizes.dedup();
    sizes
}

fn detect_layers(
    image: &Image,
    tile_size: usize,
    multiscale: bool,
    signal_threshold: f32,
) -> Vec<SamplePosition> {
    let (width, height) = image.dimensions();
    let gradient = gradient_magnitude(image.data(), width, height);
    let integral = IntegralImage::new(image.data(), width, height);

    let mut accepted: Vec<SamplePosition> = Vec::new();
    for size in layer_sizes(tile_size, multiscale, width, height) {
        if accepted.len() >= MAX_INTEREST_POINTS {
            break;
        }
        let taken: Vec<DVec2> = accepted.iter().map(SamplePosition::center).collect();
        let taken = KdTree::build(&taken);
        let layer = detect_layer(&gradient, &integral, size, signal_threshold, &taken);
        let room = MAX_INTEREST_POINTS - accepted.len();
        debug!(tile_size = size, points = layer.len().min(room), "Interest layer");
        accepted.extend(layer.into_iter().take(room));
    }
    accepted
}

/// Central-difference gradient magnitude. Border pixels are zero.
fn gradient_magnitude(data: &[f32], width: usize, height: usize) -> Vec<f32> {
    let mut gradient = vec![0.0f32; width * height];
    if width < 3 || height < 3 {
        return gradient;
    }
    gradient
        .par_chunks_mut(width)
        .enumerate()
        .skip(1)
        .take(height - 2)
        .for_each(|(y, row)| {
            for x in 1..width - 1 {
                let gx = data[y * width + x + 1] - data[y * width + x - 1];
                let gy = data[(y + 1) * width + x] - data[(y - 1) * width + x];
                row[x] = 0.5 * (gx * gx + gy * gy).sqrt();
            }
        });
    gradient
}

fn detect_layer(
    gradient: &[f32],
    integral: &IntegralImage,
    tile_size: usize,
    signal_threshold: f32,
    taken: &KdTree,
) -> Vec<SamplePosition> {
    let width = integral.width();
    let height = integral.height();
    let half = tile_size / 2;
    // Centers whose tile fits and whose 8-neighborhood exists.
    let x_range = half.max(1)..(width + half + 1).saturating_sub(tile_size).min(width - 1);
    let y_range = half.max(1)..(height + half + 1).saturating_sub(tile_size).min(height - 1);
    if x_range.is_empty() || y_range.is_empty() {
        return Vec::new();
    }

    let interior_max = y_range
        .clone()
        .into_par_iter()
        .map(|y| {
            gradient[y * width + x_range.start..y * width + x_range.end]
                .iter()
                .copied()
                .fold(0.0f32, f32::max)
        })
        .reduce(|| 0.0, f32::max);
    if interior_max <= 0.0 {
        return Vec::new();
    }
    let threshold = GRADIENT_THRESHOLD * interior_max;

    let mut candidates: Vec<Candidate> = y_range
        .into_par_iter()
        .flat_map_iter(|y| {
            let x_range = x_range.clone();
            x_range.filter_map(move |x| {
                let score = gradient[y * width + x];
                if score <= threshold || !is_strict_maximum(gradient, width, x, y) {
                    return None;
                }
                let mean = integral.area_mean(x - half, y - half, tile_size, tile_size);
                (mean >= signal_threshold as f64).then_some(Candidate { x, y, score })
            })
        })
        .collect();

    candidates.sort_unstable_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(a.y.cmp(&b.y))
            .then(a.x.cmp(&b.x))
    });

    let spacing = SPACING * tile_size as f64;
    let centers: Vec<DVec2> = candidates
        .iter()
        .map(|c| DVec2::new(c.x as f64, c.y as f64))
        .collect();
    let tree = KdTree::build(&centers);
    let mut suppressed = vec![false; candidates.len()];
    let mut points = Vec::new();

    for (i, candidate) in candidates.iter().enumerate() {
        if suppressed[i] {
            continue;
        }
        if taken.any_within(centers[i], spacing) {
            continue;
        }
        for neighbor in tree.radius_search(centers[i], spacing) {
            suppressed[neighbor.index] = true;
        }
        points.push(SamplePosition {
            x: candidate.x - half,
            y: candidate.y - half,
            tile_size,
        });
        if points.len() >= MAX_INTEREST_POINTS {
            break;
        }
    }
    points
}

fn is_strict_maximum(gradient: &[f32], width: usize, x: usize, y: usize) -> bool {
    let center = gradient[y * width + x];
    for ny in y - 1..=y + 1 {
        for nx in x - 1..=x + 1 {
            if (nx, ny) != (x, y) && gradient[ny * width + nx] >= center {
                return false;
            }
        }
    }
    true
}
