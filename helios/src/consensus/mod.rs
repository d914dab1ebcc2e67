//! Consensus-reference dedistortion.
//!
//! No frame is privileged. Each round every image is compared with a set of
//! partners in both directions; the map `i → j` measures roughly
//! `d_j - d_i`, so the negated mean over partners moves image `i` toward the
//! mean geometry of the set. Rounds follow the single-reference stopping
//! rule applied to the mean correction magnitude.

#[cfg(test)]
mod tests;

use std::collections::BTreeSet;

use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::config::{ConsensusConfig, WarpInterpolation};
use crate::dedistort::{ConvergenceTracker, MapEstimator, RoundOutcome};
use crate::distortion::{DistortionMap, DistortionMaps};
use crate::error::{Error, Result};
use crate::gpu::{BufferId, DeviceError, GpuContext, GpuImageCache, GpuSession};
use crate::image::{ConsensusKeyframe, Image};
use crate::progress::Progress;
use crate::sampler::{DeviceMeasurement, TileGroups, correlate_on_device};
use crate::sampling::InterestPointDetector;
use crate::warp::warp_image;

/// Partners of image `index` in round `iteration`.
///
/// All other images when they number at most `max_comparisons`, otherwise a
/// subsample drawn with seed `seed_base + index + iteration * count`.
/// Returned in ascending order.
pub fn partners(index: usize, count: usize, iteration: usize, config: &ConsensusConfig) -> Vec<usize> {
    let mut others: Vec<usize> = (0..count).filter(|&j| j != index).collect();
    if others.len() <= config.max_comparisons {
        return others;
    }
    let seed = config.seed_base + (index + iteration * count) as u64;
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    others.shuffle(&mut rng);
    others.truncate(config.max_comparisons);
    others.sort_unstable();
    others
}

/// Directed pairs `(source, target)` measured in round `iteration`: both
/// directions of every sampled partnership, sorted.
pub fn directed_pairs(count: usize, iteration: usize, config: &ConsensusConfig) -> Vec<(usize, usize)> {
    let mut unordered = BTreeSet::new();
    for i in 0..count {
        for j in partners(i, count, iteration, config) {
            unordered.insert((i.min(j), i.max(j)));
        }
    }
    let mut pairs: Vec<(usize, usize)> = unordered
        .into_iter()
        .flat_map(|(a, b)| [(a, b), (b, a)])
        .collect();
    pairs.sort_unstable();
    pairs
}

/// Indices of `images` ordered by file name. Unnamed images sort first, ties
/// keep input order.
fn file_name_order(images: &[Image]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..images.len()).collect();
    order.sort_by(|&a, &b| images[a].file_name().cmp(&images[b].file_name()));
    order
}

/// How correlation reaches the device for one call.
enum DeviceMode<'a> {
    Cpu,
    /// The whole set stays resident across rounds.
    Resident {
        context: &'a GpuContext,
        cache: GpuImageCache,
    },
    /// A cache of `capacity` images rebuilt every round.
    PerRound {
        context: &'a GpuContext,
        capacity: usize,
    },
}

impl<'a> DeviceMode<'a> {
    fn select(gpu: Option<&'a GpuContext>, count: usize, dimensions: (usize, usize), tile_size: usize) -> Self {
        let Some(context) = gpu else {
            return DeviceMode::Cpu;
        };
        let budget = context.memory_budget(dimensions.0, dimensions.1, tile_size);
        if budget.fits(count) {
            debug!(count, "All images resident on device");
            DeviceMode::Resident {
                context,
                cache: GpuImageCache::new(count),
            }
        } else if budget.max_resident_images >= 2 {
            debug!(
                capacity = budget.max_resident_images,
                "Per-round device cache"
            );
            DeviceMode::PerRound {
                context,
                capacity: budget.max_resident_images,
            }
        } else {
            debug!("Device budget too small, using CPU");
            DeviceMode::Cpu
        }
    }

    /// Device phase for every pair of a round.
    fn measure(
        &mut self,
        current: &[Image],
        pairs: &[(usize, usize)],
        groups: Vec<TileGroups>,
    ) -> Vec<DeviceMeasurement> {
        match self {
            DeviceMode::Cpu => groups.into_iter().map(DeviceMeasurement::cpu_only).collect(),
            DeviceMode::Resident { context, cache } => {
                measure_pairs(*context, cache, current, pairs, groups, false)
            }
            DeviceMode::PerRound { context, capacity } => {
                let mut cache = GpuImageCache::new(*capacity);
                measure_pairs(*context, &mut cache, current, pairs, groups, true)
            }
        }
    }

    /// Warp every original by its accumulated correction. Resident buffers
    /// are overwritten in place with the warped pixels.
    fn warp_all(
        &mut self,
        originals: &[Image],
        totals: &[Option<DistortionMap>],
        interpolation: WarpInterpolation,
    ) -> Vec<Image> {
        let cpu = |i: usize| match &totals[i] {
            Some(total) => warp_image(&originals[i], total, interpolation),
            None => originals[i].clone(),
        };

        let DeviceMode::Resident { context, cache } = self else {
            return (0..originals.len()).into_par_iter().map(cpu).collect();
        };

        let context = *context;
        let result = context.execute_with_lock(|session| -> std::result::Result<Vec<Image>, DeviceError> {
            let mut warped = Vec::with_capacity(originals.len());
            for (i, original) in originals.iter().enumerate() {
                let buffer = cache.replace(session, i, original)?;
                let image = match &totals[i] {
                    Some(total) => {
                        let (width, height) = original.dimensions();
                        let field = total.dense_field(width, height);
                        original.with_data(session.warp(buffer, width, height, &field, interpolation)?)
                    }
                    None => original.clone(),
                };
                warped.push(image);
            }
            Ok(warped)
        });

        match result {
            Ok(warped) => warped,
            Err(e) => {
                warn!(error = %e, "Device warp failed, continuing on CPU");
                let mut cache = std::mem::replace(cache, GpuImageCache::new(0));
                cache.release_all(context);
                *self = DeviceMode::Cpu;
                (0..originals.len()).into_par_iter().map(cpu).collect()
            }
        }
    }

    fn release(self) {
        if let DeviceMode::Resident { context, mut cache } = self {
            debug!(
                hits = cache.hits(),
                misses = cache.misses(),
                "Resident image cache"
            );
            context.execute_with_lock(|session| cache.clear(session));
        }
    }
}

/// Device phase for all pairs of a round in a single lock entry. After the
/// first upload failure the remaining pairs go to the CPU.
fn measure_pairs(
    context: &GpuContext,
    cache: &mut GpuImageCache,
    current: &[Image],
    pairs: &[(usize, usize)],
    groups: Vec<TileGroups>,
    clear_after: bool,
) -> Vec<DeviceMeasurement> {
    context.execute_with_lock(|session| {
        let mut device_ok = true;
        let mut measurements = Vec::with_capacity(pairs.len());
        for (&(i, j), groups) in pairs.iter().zip(groups) {
            if !device_ok {
                measurements.push(DeviceMeasurement::cpu_only(groups));
                continue;
            }
            match upload(session, cache, current, i, j) {
                Ok((r, t)) => measurements.push(correlate_on_device(
                    session,
                    r,
                    t,
                    current[i].dimensions(),
                    groups,
                )),
                Err(e) => {
                    warn!(error = %e, "Device upload failed, remaining pairs use CPU");
                    device_ok = false;
                    measurements.push(DeviceMeasurement::cpu_only(groups));
                }
            }
        }
        if clear_after {
            cache.clear(session);
        }
        measurements
    })
}

fn upload(
    session: &mut GpuSession<'_>,
    cache: &mut GpuImageCache,
    images: &[Image],
    source: usize,
    target: usize,
) -> std::result::Result<(BufferId, BufferId), DeviceError> {
    let r = cache.get_or_upload(session, source, &images[source])?;
    let t = cache.get_or_upload(session, target, &images[target])?;
    Ok((r, t))
}

/// Register a set of frames onto their common mean geometry.
///
/// At least one image must carry [`ConsensusKeyframe`]. Images are processed
/// in file-name order; the result is returned in input order, each image
/// tagged with its accumulated [`DistortionMaps`]. A single image is
/// returned unchanged.
pub fn dedistort_consensus(
    images: &[Image],
    config: &ConsensusConfig,
    gpu: Option<&GpuContext>,
    progress: &Progress,
) -> Result<Vec<Image>> {
    config.validate()?;
    let refs: Vec<&Image> = images.iter().collect();
    let dimensions = Image::check_mono_set(&refs)?;
    if !images
        .iter()
        .any(|image| image.metadata().contains::<ConsensusKeyframe>())
    {
        return Err(Error::MissingConsensusKeyframe);
    }
    if images.len() == 1 {
        return Ok(images.to_vec());
    }
    if images.len() < config.min_recommended_images {
        warn!(
            count = images.len(),
            recommended = config.min_recommended_images,
            "Few images for consensus dedistortion, the mean geometry is poorly constrained"
        );
    }

    let order = file_name_order(images);
    let originals: Vec<Image> = order.iter().map(|&i| images[i].clone()).collect();
    let count = originals.len();

    let dedistort = &config.dedistort;
    let detector = InterestPointDetector::new();
    let estimator = MapEstimator::new(dedistort, &detector);
    let tile_size = dedistort.effective_tile_size();
    let mut device = DeviceMode::select(gpu, count, dimensions, tile_size);

    let mut tracker = ConvergenceTracker::new();
    let mut histories: Vec<DistortionMaps> = vec![DistortionMaps::default(); count];
    let mut current = originals.clone();

    for iteration in 0..dedistort.iterations {
        let stage = progress.child(&format!("iteration {}", iteration + 1));
        let pairs = directed_pairs(count, iteration, config);
        stage.update(0.0, "sampling");

        let groups: Vec<TileGroups> = pairs
            .par_iter()
            .map(|&(i, j)| estimator.groups(&current[i], &current[j], tile_size))
            .collect();
        let measurements = device.measure(&current, &pairs, groups);

        stage.update(0.3, "estimating");
        let counter = stage.counter(pairs.len());
        let maps: Vec<DistortionMap> = pairs
            .par_iter()
            .zip(measurements)
            .map(|(&(i, j), measurement)| {
                let map = estimator.estimate_with(&current[i], &current[j], measurement);
                counter.tick(1);
                map
            })
            .collect();

        let corrections: Vec<DistortionMap> = (0..count)
            .into_par_iter()
            .map(|i| {
                let own: Vec<&DistortionMap> = pairs
                    .iter()
                    .zip(&maps)
                    .filter(|((source, _), _)| *source == i)
                    .map(|(_, map)| map)
                    .collect();
                DistortionMap::average(&own)
                    .map(|average| average.negate())
                    .unwrap_or_else(|| {
                        DistortionMap::new(dimensions.0, dimensions.1, dedistort.increment_for(tile_size), tile_size)
                    })
            })
            .collect();

        let distortion =
            corrections.iter().map(DistortionMap::total_distortion).sum::<f64>() / count as f64;
        let outcome = tracker.check(distortion);
        debug!(
            iteration,
            pairs = pairs.len(),
            distortion,
            ?outcome,
            "Consensus round"
        );

        if outcome == RoundOutcome::Diverged {
            warn!(
                iteration,
                distortion,
                previous = tracker.last(),
                "Mean distortion increased, discarding round"
            );
            break;
        }

        for (history, correction) in histories.iter_mut().zip(corrections) {
            history.push(correction);
        }
        let totals: Vec<Option<DistortionMap>> = histories.iter().map(DistortionMaps::synthesize).collect();
        stage.update(0.8, "warping");
        current = device.warp_all(&originals, &totals, dedistort.warp);
        stage.complete();

        if outcome == RoundOutcome::Converged {
            break;
        }
    }
    device.release();

    info!(
        images = count,
        rounds = histories.first().map_or(0, DistortionMaps::len),
        distortion = tracker.last(),
        "Consensus dedistortion finished"
    );
    progress.complete();

    let mut results: Vec<Option<Image>> = vec![None; count];
    for ((image, history), &input_index) in current.into_iter().zip(histories).zip(&order) {
        results[input_index] = Some(image.with_metadata(history));
    }
    Ok(results.into_iter().flatten().collect())
}
