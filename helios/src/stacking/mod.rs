//! Fusing registered frames into one image.
//!
//! [`stack`] measures a displacement map for every frame against a chosen
//! reference and averages the displaced samples with global frame weights.
//! [`stack_onto`] does the same against a caller supplied reference, weighting
//! every sample by its similarity to that reference. [`stack_dedistorted`]
//! measures nothing: its frames were registered by dedistortion and are
//! weighted by the error recorded in their [`DistortionMaps`].
//!
//! Output pixels that no frame contributes to stay zero.

mod reference;
mod sharpness;

#[cfg(test)]
mod tests;

use std::time::Instant;

use glam::DVec2;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::config::{DEFAULT_SIGNAL_THRESHOLD, StackConfig, StackDedistortedConfig};
use crate::correlation::TileCorrelator;
use crate::distortion::{DistortionMap, DistortionMaps};
use crate::error::{Error, Result};
use crate::image::{Image, Metadata, bilinear_clamped};
use crate::progress::Progress;
use crate::sampler::extract_tiles;
use crate::sampling::{IntegralImage, SamplePosition, grid_positions};

pub use reference::{StackReference, choose_reference};
pub use sharpness::{estimate_sharpness, sharpness_map};

/// Decay of frame weights with registration error.
const ERROR_DECAY: f64 = -2.0;

/// Decay of sample weights with relative intensity difference.
const SIMILARITY_DECAY: f64 = -8.0;

/// Stack `images` onto a reference chosen by `config.reference`.
///
/// Frames are weighted globally: uniformly, or by their sharpness when the
/// reference is picked by sharpness. A single image is returned unchanged.
///
/// # Errors
///
/// Invalid configuration, an empty or mixed image set, or a manual reference
/// that matches no frame.
pub fn stack(images: &[Image], config: &StackConfig, progress: &Progress) -> Result<Image> {
    config.validate()?;
    let refs: Vec<&Image> = images.iter().collect();
    Image::check_mono_set(&refs)?;
    if images.len() == 1 {
        return Ok(images[0].clone());
    }

    let start = Instant::now();
    let reference = choose_reference(images, config)?;
    let maps = measure_displacements(images, &reference.image, config, progress);
    let data = assemble(images, &maps, &Weighting::Global(&reference.weights), progress);

    info!(
        frames = images.len(),
        selection = ?config.reference,
        elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
        "Stacked frames"
    );
    Ok(stacked_image(reference.image.dimensions(), data, images))
}

/// Stack `images` onto an explicit `reference`.
///
/// Every sample is weighted by the lower of two similarities: between the
/// tile averages of frame and reference around the pixel, and between the
/// frame's own pixel and its displaced sample. Frames that disagree with
/// the reference fade out locally. A single image is returned unchanged.
///
/// # Errors
///
/// As [`stack`]. The reference is validated as if appended to `images`.
pub fn stack_onto(images: &[Image], reference: &Image, config: &StackConfig, progress: &Progress) -> Result<Image> {
    config.validate()?;
    let refs: Vec<&Image> = images.iter().chain(std::iter::once(reference)).collect();
    Image::check_mono_set(&refs)?;
    if images.is_empty() {
        return Err(Error::EmptyImageList);
    }
    if images.len() == 1 {
        return Ok(images[0].clone());
    }

    let start = Instant::now();
    let maps = measure_displacements(images, reference, config, progress);
    let (width, height) = reference.dimensions();
    let similarity = Similarity {
        reference: IntegralImage::new(reference.data(), width, height),
        frames: images
            .par_iter()
            .map(|image| IntegralImage::new(image.data(), width, height))
            .collect(),
        tile_size: config.tile_size,
    };
    let data = assemble(images, &maps, &Weighting::Similarity(similarity), progress);

    info!(
        frames = images.len(),
        elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
        "Stacked frames onto explicit reference"
    );
    Ok(stacked_image((width, height), data, images))
}

/// Displacement of every frame against `reference`, one map per frame.
///
/// Tiles lie on a grid with spacing `config.increment()`. Tiles whose
/// reference average does not exceed the signal threshold record a zero
/// displacement; the others record the phase-correlation shift at their
/// centre. Unmeasured cells are filled and the map smoothed by the grid
/// filter.
pub(crate) fn measure_displacements(
    images: &[Image],
    reference: &Image,
    config: &StackConfig,
    progress: &Progress,
) -> Vec<DistortionMap> {
    let (width, height) = reference.dimensions();
    let tile_size = config.tile_size;
    let increment = config.increment();
    let integral = IntegralImage::new(reference.data(), width, height);

    let (signal, blank): (Vec<SamplePosition>, Vec<SamplePosition>) =
        grid_positions(width, height, tile_size, increment)
            .into_iter()
            .partition(|p| integral.area_mean(p.x, p.y, tile_size, tile_size) > DEFAULT_SIGNAL_THRESHOLD as f64);
    debug!(
        tiles = signal.len(),
        blank = blank.len(),
        tile_size,
        increment,
        "Measuring stacking displacements"
    );

    let area = tile_size * tile_size;
    let reference_tiles = extract_tiles(reference.data(), width, &signal, tile_size);
    let correlator = TileCorrelator::new(config.correlation.clone());
    let stage = progress.child("displacements");
    let counter = stage.counter(images.len());

    let maps = images
        .par_iter()
        .map(|image| {
            let mut map = DistortionMap::new(width, height, increment, tile_size);
            for p in &blank {
                let c = p.center();
                map.record(c.x, c.y, DVec2::ZERO);
            }
            let shifts: Vec<_> = signal
                .par_iter()
                .enumerate()
                .map(|(i, p)| {
                    let target = extract_tiles(image.data(), width, std::slice::from_ref(p), tile_size);
                    correlator.correlate(&reference_tiles[i * area..(i + 1) * area], &target, tile_size)
                })
                .collect();
            for (p, shift) in signal.iter().zip(shifts) {
                let c = p.center();
                map.record(c.x, c.y, shift.vector());
            }
            map.filter_and_smooth(&config.filter);
            counter.tick(1);
            map
        })
        .collect();
    stage.complete();
    maps
}

/// Tile-average lookups for similarity weighting.
#[derive(Debug)]
struct Similarity {
    reference: IntegralImage,
    frames: Vec<IntegralImage>,
    tile_size: usize,
}

impl Similarity {
    fn tile_weight(&self, frame: usize, x: usize, y: usize) -> f64 {
        let offset = self.tile_size / 2;
        let x0 = x.saturating_sub(offset);
        let y0 = y.saturating_sub(offset);
        let r = self.reference.area_mean(x0, y0, self.tile_size, self.tile_size);
        let f = self.frames[frame].area_mean(x0, y0, self.tile_size, self.tile_size);
        similarity(r, f)
    }
}

#[derive(Debug)]
enum Weighting<'a> {
    /// One weight per frame.
    Global(&'a [f64]),
    Similarity(Similarity),
}

/// `exp(-8 |a - b| / max(a, b))`: one for equal values, small for values
/// far apart relative to their level.
fn similarity(a: f64, b: f64) -> f64 {
    (SIMILARITY_DECAY * (a - b).abs() / (a.max(b) + 1e-5)).exp()
}

/// Weighted average of the displaced frame samples at every pixel.
///
/// Frame `i` contributes `image_i(p + d_i(p))` when that position lies
/// within half a pixel of the image.
fn assemble(images: &[Image], maps: &[DistortionMap], weighting: &Weighting<'_>, progress: &Progress) -> Vec<f32> {
    let (width, height) = images[0].dimensions();
    let stage = progress.child("assembly");
    let counter = stage.counter(height);
    let mut data = vec![0.0f32; width * height];

    data.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
        for (x, out) in row.iter_mut().enumerate() {
            let mut sum = 0.0;
            let mut total = 0.0;
            for (i, (image, map)) in images.iter().zip(maps).enumerate() {
                let d = map.find_distortion(x as f64, y as f64);
                let sx = x as f64 + d.x;
                let sy = y as f64 + d.y;
                if sx < -0.5 || sy < -0.5 || sx > width as f64 - 0.5 || sy > height as f64 - 0.5 {
                    continue;
                }
                let value = bilinear_clamped(image.data(), width, height, sx, sy) as f64;
                let weight = match weighting {
                    Weighting::Global(weights) => weights[i],
                    Weighting::Similarity(s) => s
                        .tile_weight(i, x, y)
                        .min(similarity(image.get(x, y) as f64, value)),
                };
                sum += weight * value;
                total += weight;
            }
            if total > 0.0 {
                *out = (sum / total) as f32;
            }
        }
        counter.tick(1);
    });
    stage.complete();
    data
}

/// Mono result sized like the sources, carrying their merged metadata.
fn stacked_image<'a>(dimensions: (usize, usize), data: Vec<f32>, sources: impl IntoIterator<Item = &'a Image>) -> Image {
    let mut image = Image::mono(dimensions.0, dimensions.1, data);
    *image.metadata_mut() = Metadata::merge(sources.into_iter().map(Image::metadata));
    image
}

/// A frame registered by dedistortion with its recorded maps.
#[derive(Debug)]
struct Registered<'a> {
    image: &'a Image,
    maps: &'a DistortionMaps,
}

/// Stack frames registered by dedistortion.
///
/// Every frame must carry [`DistortionMaps`]; its registration error is the
/// residual distortion of the last map. In global mode frames are weighted
/// by `exp(-2 · error / max_error)` and only the best
/// `ceil(best_fraction · n)` are averaged. With `local_weights` the choice is
/// made per pixel from the local error and the local sharpness of each frame.
/// A single image is returned unchanged.
///
/// # Errors
///
/// [`Error::MissingDistortionMaps`] for a frame without maps, plus the usual
/// image set checks.
pub fn stack_dedistorted(images: &[Image], config: &StackDedistortedConfig, progress: &Progress) -> Result<Image> {
    config.validate()?;
    let refs: Vec<&Image> = images.iter().collect();
    Image::check_mono_set(&refs)?;
    if images.len() == 1 {
        return Ok(images[0].clone());
    }

    let registered = images
        .iter()
        .enumerate()
        .map(|(index, image)| {
            image
                .metadata()
                .get::<DistortionMaps>()
                .filter(|maps| !maps.is_empty())
                .map(|maps| Registered { image, maps })
                .ok_or(Error::MissingDistortionMaps { index })
        })
        .collect::<Result<Vec<_>>>()?;

    let keep = config.keep_count(images.len());
    let stacked = if config.local_weights {
        let data = stack_local(&registered, keep, progress);
        stacked_image(images[0].dimensions(), data, images)
    } else {
        stack_global(&registered, keep, progress)
    };
    info!(
        frames = images.len(),
        kept = keep,
        local = config.local_weights,
        "Stacked dedistorted frames"
    );
    Ok(stacked)
}

fn stack_global(registered: &[Registered<'_>], keep: usize, progress: &Progress) -> Image {
    let errors: Vec<f64> = registered.iter().map(|r| r.maps.error()).collect();
    let max_error = errors.iter().copied().fold(0.0, f64::max);
    let mut ranked: Vec<(f64, &Image)> = registered
        .iter()
        .zip(&errors)
        .map(|(r, &error)| {
            let weight = if max_error > 0.0 {
                (ERROR_DECAY * error / max_error).exp()
            } else {
                1.0
            };
            (weight, r.image)
        })
        .collect();
    ranked.sort_by(|a, b| b.0.total_cmp(&a.0));
    ranked.truncate(keep);
    debug!(weights = ?ranked.iter().map(|(w, _)| *w).collect::<Vec<_>>(), "Global frame weights");

    let (width, height) = ranked[0].1.dimensions();
    let stage = progress.child("stacking");
    let counter = stage.counter(height);
    let total: f64 = ranked.iter().map(|(w, _)| w).sum();
    let mut data = vec![0.0f32; width * height];
    data.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
        for (x, out) in row.iter_mut().enumerate() {
            let sum: f64 = ranked.iter().map(|(w, image)| w * image.get(x, y) as f64).sum();
            *out = (sum / total) as f32;
        }
        counter.tick(1);
    });
    stage.complete();
    stacked_image((width, height), data, ranked.iter().map(|(_, image)| *image))
}

/// Per-pixel selection of the best `keep` frames by local error and
/// sharpness.
///
/// Weight of frame `i` at a pixel is `exp(-2 · e_i / max e) · s_i / max s`.
/// Where every frame has zero local error or zero sharpness, the first
/// `keep` frames are averaged uniformly.
fn stack_local(registered: &[Registered<'_>], keep: usize, progress: &Progress) -> Vec<f32> {
    let (width, height) = registered[0].image.dimensions();
    let tile_size = DistortionMap::turbulence_scale(registered.iter().filter_map(|r| r.maps.last()));
    debug!(tile_size, "Local stacking weights");

    let sharpness: Vec<Vec<f32>> = registered
        .par_iter()
        .map(|r| sharpness_map(r.image.data(), width, height, tile_size))
        .collect();

    let stage = progress.child("stacking");
    let counter = stage.counter(height);
    let n = registered.len();
    let mut data = vec![0.0f32; width * height];
    data.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
        let mut errors = vec![0.0f64; n];
        let mut ranked: Vec<(f64, usize)> = Vec::with_capacity(n);
        for (x, out) in row.iter_mut().enumerate() {
            let index = y * width + x;
            let mut max_error = 0.0f64;
            let mut max_sharpness = 0.0f64;
            for (i, r) in registered.iter().enumerate() {
                errors[i] = r.maps.interpolate_tile_error(x as f64, y as f64);
                max_error = max_error.max(errors[i]);
                max_sharpness = max_sharpness.max(sharpness[i][index] as f64);
            }

            ranked.clear();
            if max_error > 0.0 && max_sharpness > 0.0 {
                ranked.extend((0..n).map(|i| {
                    let error_weight = (ERROR_DECAY * errors[i] / max_error).exp();
                    let sharpness_weight = sharpness[i][index] as f64 / max_sharpness;
                    (error_weight * sharpness_weight, i)
                }));
                ranked.sort_by(|a, b| b.0.total_cmp(&a.0));
                ranked.truncate(keep);
            } else {
                ranked.extend((0..keep).map(|i| (1.0, i)));
            }

            let mut sum = 0.0;
            let mut total = 0.0;
            for &(weight, i) in &ranked {
                sum += weight * registered[i].image.get(x, y) as f64;
                total += weight;
            }
            if total > 0.0 {
                *out = (sum / total) as f32;
            }
        }
        counter.tick(1);
    });
    stage.complete();
    data
}
