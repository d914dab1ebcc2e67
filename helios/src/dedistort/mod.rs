//! Local distortion estimation and the single-reference dedistortion loop.
//!
//! One estimation pass runs the shared pipeline: select tile positions on the
//! source image, correlate tile pairs (device first, CPU for the rest), drop
//! the least confident samples, interpolate them onto a regular grid and
//! filter the grid. With `refine` the pass repeats at halved tile sizes on
//! the partially corrected target and the level maps are composed.
//!
//! The loop warps the *original* target by the composition of all retained
//! round maps, so interpolation blur does not compound.

mod convergence;


use tracing::{debug, info, warn};

use crate::config::{DedistortConfig, MIN_TILE_SIZE, WarpInterpolation};
use crate::correlation::TileCorrelator;
use crate::distortion::{DistortionMap, DistortionMaps};
use crate::error::Result;
use crate::field::SparseDistortionField;
use crate::gpu::{BufferId, DeviceError, GpuContext, GpuImageCache, GpuSession};
use crate::image::Image;
use crate::progress::Progress;
use crate::sampler::{
    DeviceMeasurement, DisplacementSample, TileGroups, correlate_groups, correlate_on_device,
    reject_low_confidence,
};
use crate::sampling::{InterestPointDetector, select_positions};
use crate::warp::warp_image;

pub use convergence::{ConvergenceTracker, RoundOutcome};

/// Estimates distortion maps between image pairs.
///
/// Owns the correlator so FFT plans are shared by every pair of a run.
#[derive(Debug)]
pub struct MapEstimator<'a> {
    config: &'a DedistortConfig,
    correlator: TileCorrelator,
    detector: &'a InterestPointDetector,
}

impl<'a> MapEstimator<'a> {
    pub fn new(config: &'a DedistortConfig, detector: &'a InterestPointDetector) -> Self {
        Self {
            config,
            correlator: TileCorrelator::new(config.correlation.clone()),
            detector,
        }
    }

    pub fn config(&self) -> &DedistortConfig {
        self.config
    }

    pub fn correlator(&self) -> &TileCorrelator {
        &self.correlator
    }

    /// Tile sizes of the estimation levels, coarsest first.
    pub fn level_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![self.config.effective_tile_size()];
        if self.config.refine {
            while let Some(&last) = sizes.last()
                && last / 2 >= MIN_TILE_SIZE
            {
                sizes.push(last / 2);
            }
        }
        sizes
    }

    /// Tile groups for measuring `source → target`. Positions are selected
    /// on `source`.
    pub fn groups(&self, source: &Image, target: &Image, tile_size: usize) -> TileGroups {
        let sampling = self.config.sampling_config();
        let increment = self.config.increment_for(tile_size);
        let positions = select_positions(source, tile_size, increment, &sampling, self.detector);
        TileGroups::new(&positions, source, target, sampling.signal_threshold)
    }

    /// Confidence-filtered samples interpolated onto a regular grid.
    pub fn grid_from_samples(
        &self,
        samples: Vec<DisplacementSample>,
        dimensions: (usize, usize),
        tile_size: usize,
    ) -> DistortionMap {
        let (width, height) = dimensions;
        let step = self.config.increment_for(tile_size);
        let samples = reject_low_confidence(samples, self.config.rejection_percentile);
        if samples.is_empty() {
            warn!(tile_size, "No usable displacement samples, distortion map left at zero");
            return DistortionMap::new(width, height, step, tile_size);
        }

        let mut field = SparseDistortionField::new(width, height, self.config.field.clone());
        field.extend(samples);
        field.to_regular_grid(step, tile_size, &self.config.filter)
    }

    /// Map that warps `target` onto `source`, given the first level's
    /// measurement. Refinement levels run on the CPU.
    pub fn estimate_with(&self, source: &Image, target: &Image, first: DeviceMeasurement) -> DistortionMap {
        let dimensions = source.dimensions();
        let levels = self.level_sizes();

        let samples = first.finish(&self.correlator, source, target);
        debug!(tile_size = levels[0], samples = samples.len(), "Level measured");
        let mut map = self.grid_from_samples(samples, dimensions, levels[0]);

        for &tile_size in &levels[1..] {
            let warped = warp_image(target, &map, self.config.warp);
            let groups = self.groups(source, &warped, tile_size);
            let samples = correlate_groups(&self.correlator, source, &warped, &groups);
            debug!(tile_size, samples = samples.len(), "Refinement level measured");
            let residual = self.grid_from_samples(samples, dimensions, tile_size);
            map = map.append(&residual);
        }
        map
    }

    /// CPU-only estimation of the map that warps `target` onto `source`.
    pub fn estimate(&self, source: &Image, target: &Image) -> DistortionMap {
        let groups = self.groups(source, target, self.config.effective_tile_size());
        self.estimate_with(source, target, DeviceMeasurement::cpu_only(groups))
    }
}

/// Resident reference and target for the single-reference loop.
struct ResidentPair<'a> {
    context: &'a GpuContext,
    cache: GpuImageCache,
}

impl<'a> ResidentPair<'a> {
    const REFERENCE: usize = 0;
    const TARGET: usize = 1;

    fn new(context: &'a GpuContext, dimensions: (usize, usize), tile_size: usize) -> Option<Self> {
        let (width, height) = dimensions;
        let budget = context.memory_budget(width, height, tile_size);
        if !budget.fits(2) {
            debug!(
                max_resident = budget.max_resident_images,
                "Images do not fit the device budget, using CPU"
            );
            return None;
        }
        Some(Self {
            context,
            cache: GpuImageCache::new(2),
        })
    }

    /// Device phase for one round. Failures hand all groups to the CPU.
    fn measure(&mut self, reference: &Image, target: &Image, groups: TileGroups) -> DeviceMeasurement {
        let cache = &mut self.cache;
        self.context.execute_with_lock(|session| {
            match upload_pair(session, cache, reference, target) {
                Ok((r, t)) => correlate_on_device(session, r, t, reference.dimensions(), groups),
                Err(e) => {
                    warn!(error = %e, "Device upload failed, using CPU");
                    DeviceMeasurement::cpu_only(groups)
                }
            }
        })
    }

    fn release(mut self) {
        let cache = &mut self.cache;
        self.context.execute_with_lock(|session| cache.clear(session));
    }
}

fn upload_pair(
    session: &mut GpuSession<'_>,
    cache: &mut GpuImageCache,
    reference: &Image,
    target: &Image,
) -> std::result::Result<(BufferId, BufferId), DeviceError> {
    let r = cache.get_or_upload(session, ResidentPair::REFERENCE, reference)?;
    let t = cache.replace(session, ResidentPair::TARGET, target)?;
    Ok((r, t))
}

/// Register `target` onto `reference`.
///
/// Returns the target warped by the composition of all retained round maps,
/// tagged with those maps as [`DistortionMaps`] metadata.
pub fn dedistort(
    reference: &Image,
    target: &Image,
    config: &DedistortConfig,
    gpu: Option<&GpuContext>,
    progress: &Progress,
) -> Result<Image> {
    config.validate()?;
    let dimensions = Image::check_mono_set(&[reference, target])?;

    let detector = InterestPointDetector::new();
    let estimator = MapEstimator::new(config, &detector);
    let tile_size = config.effective_tile_size();
    let mut resident = gpu.and_then(|context| ResidentPair::new(context, dimensions, tile_size));

    let mut tracker = ConvergenceTracker::new();
    let mut maps = DistortionMaps::default();
    let mut current = target.clone();

    for round in 0..config.iterations {
        progress.update(round as f64 / config.iterations as f64, "estimating");

        let groups = estimator.groups(reference, &current, tile_size);
        let measurement = match resident.as_mut() {
            Some(pair) => pair.measure(reference, &current, groups),
            None => DeviceMeasurement::cpu_only(groups),
        };
        let map = estimator.estimate_with(reference, &current, measurement);
        let distortion = map.total_distortion();
        let outcome = tracker.check(distortion);
        debug!(round, distortion, ?outcome, "Dedistort round");

        if outcome == RoundOutcome::Diverged {
            warn!(
                round,
                distortion,
                previous = tracker.last(),
                "Distortion increased, discarding round"
            );
            break;
        }

        maps.push(map);
        if let Some(total) = maps.synthesize() {
            current = warp_image(target, &total, config.warp);
        }
        if outcome == RoundOutcome::Converged {
            break;
        }
    }

    if let Some(pair) = resident {
        pair.release();
    }

    info!(
        rounds = maps.len(),
        distortion = tracker.last(),
        "Dedistortion finished"
    );
    progress.complete();
    Ok(current.with_metadata(maps))
}

/// Warp `image` by a recorded map sequence, e.g. maps measured on another
/// channel of the same exposure. An empty sequence returns the image as is.
pub fn apply_distortion_maps(image: &Image, maps: &DistortionMaps, interpolation: WarpInterpolation) -> Image {
    match maps.synthesize() {
        Some(total) => warp_image(image, &total, interpolation),
        None => image.clone(),
    }
}
