//! Helios - local distortion estimation and stacking for solar images.
//!
//! Atmospheric turbulence bends every frame of a solar capture differently.
//! This crate measures those local distortions and undoes them:
//!
//! - Tile correlation (phase correlation and normalized cross-correlation)
//!   with sub-pixel peak refinement
//! - Grid or interest-point sampling, sparse-to-dense field interpolation and
//!   outlier filtering into [`DistortionMap`]s
//! - Iterative dedistortion against a reference frame, or against the
//!   consensus geometry of a whole set of frames
//! - Stacking of registered frames with sharpness, similarity or
//!   registration-error weights
//! - Optional compute-device acceleration with resident image buffers and a
//!   CPU fallback
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use helios::{DedistortConfig, Engine, StackDedistortedConfig};
//!
//! let engine = Engine::new();
//! let config = DedistortConfig::default().with_iterations(3);
//! let registered: Vec<_> = frames
//!     .iter()
//!     .map(|frame| engine.dedistort(&reference, frame, &config))
//!     .collect::<helios::Result<_>>()?;
//! let stacked = engine.stack_dedistorted(&registered, &StackDedistortedConfig::default())?;
//! ```

pub(crate) mod config;
pub(crate) mod consensus;
pub(crate) mod correlation;
pub(crate) mod dedistort;
pub(crate) mod distortion;
pub(crate) mod error;
pub(crate) mod field;
pub mod gpu;
pub(crate) mod image;
pub(crate) mod progress;
pub(crate) mod sampler;
pub(crate) mod sampling;
pub(crate) mod spatial;
pub(crate) mod stacking;
pub(crate) mod warp;

#[cfg(test)]
pub mod testing;

use std::sync::Arc;

// ============================================================================
// Core types
// ============================================================================

pub use error::{Error, Result};
pub use image::{Channels, ConsensusKeyframe, ConsensusReference, EllipseFit, Image, Metadata, SourceInfo};
pub use progress::{Progress, ProgressCallback, ProgressCounter, ProgressEvent};

// ============================================================================
// Configuration
// ============================================================================

pub use config::{
    ABSOLUTE_MIN_TILE_SIZE, CONVERGENCE_THRESHOLD, ConsensusConfig, CorrelationConfig, DEFAULT_SAMPLING,
    DEFAULT_SIGNAL_THRESHOLD, DEFAULT_TILE_SIZE, DedistortConfig, FieldConfig, FieldInterpolation, GpuConfig,
    GridFilterConfig, MIN_DEDISTORT_STEP, MIN_STACK_STEP, MIN_TILE_SIZE, ReferenceSelection, SamplingConfig,
    SamplingStrategy, StackConfig, StackDedistortedConfig, WarpInterpolation,
};

// ============================================================================
// Measurement
// ============================================================================

pub use correlation::{TileCorrelator, TileShift};
pub use distortion::{DistortionMap, DistortionMaps, filter_and_smooth};
pub use field::SparseDistortionField;
pub use sampler::{
    DeviceMeasurement, DisplacementSample, TileGroups, correlate_group, correlate_groups, correlate_on_device,
    reject_low_confidence,
};
pub use sampling::{InterestPointDetector, MAX_INTEREST_POINTS, SamplePosition, select_positions};
pub use spatial::{KdTree, Neighbor};
pub use warp::{warp_image, warp_plane};

// ============================================================================
// Engines
// ============================================================================

pub use consensus::{dedistort_consensus, directed_pairs, partners};
pub use dedistort::{ConvergenceTracker, MapEstimator, RoundOutcome, apply_distortion_maps, dedistort};
pub use gpu::GpuContext;
pub use stacking::{
    StackReference, choose_reference, estimate_sharpness, sharpness_map, stack, stack_dedistorted, stack_onto,
};

/// Entry point bundling an optional compute device and a progress sink.
///
/// Every method forwards to the free function of the same name. Without a
/// device everything runs on the CPU.
#[derive(Debug, Clone, Default)]
pub struct Engine {
    gpu: Option<Arc<GpuContext>>,
    progress: Progress,
}

impl Engine {
    /// CPU-only engine without progress reporting.
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine on the first wgpu adapter, or CPU-only when none is usable.
    #[cfg(feature = "wgpu")]
    pub fn with_default_device(config: GpuConfig) -> Self {
        match GpuContext::wgpu(config) {
            Ok(context) => Self::new().with_gpu(context),
            Err(e) => {
                tracing::warn!(error = %e, "No compute device, running on CPU");
                Self::new()
            }
        }
    }

    pub fn with_gpu(mut self, context: Arc<GpuContext>) -> Self {
        self.gpu = Some(context);
        self
    }

    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }

    pub fn gpu(&self) -> Option<&Arc<GpuContext>> {
        self.gpu.as_ref()
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    pub fn dedistort(&self, reference: &Image, target: &Image, config: &DedistortConfig) -> Result<Image> {
        dedistort::dedistort(reference, target, config, self.gpu.as_deref(), &self.progress)
    }

    pub fn dedistort_consensus(&self, images: &[Image], config: &ConsensusConfig) -> Result<Vec<Image>> {
        consensus::dedistort_consensus(images, config, self.gpu.as_deref(), &self.progress)
    }

    pub fn stack(&self, images: &[Image], config: &StackConfig) -> Result<Image> {
        stacking::stack(images, config, &self.progress)
    }

    pub fn stack_onto(&self, images: &[Image], reference: &Image, config: &StackConfig) -> Result<Image> {
        stacking::stack_onto(images, reference, config, &self.progress)
    }

    pub fn stack_dedistorted(&self, images: &[Image], config: &StackDedistortedConfig) -> Result<Image> {
        stacking::stack_dedistorted(images, config, &self.progress)
    }
}
