//! Configuration types for dedistortion, consensus and stacking.
//!
//! All configuration structs and their enums live here. Every public engine
//! operation calls the matching `validate()` before doing any work.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Smallest tile edge accepted anywhere in the engine.
pub const ABSOLUTE_MIN_TILE_SIZE: usize = 16;

/// Tiles below this edge use plain cross-correlation instead of phase
/// correlation. Also the floor for coarse-to-fine refinement.
pub const MIN_TILE_SIZE: usize = 32;

/// Minimum grid increment for dedistortion sampling.
pub const MIN_DEDISTORT_STEP: usize = 8;

/// Minimum grid increment for stacking sampling.
pub const MIN_STACK_STEP: usize = 2;

pub const DEFAULT_TILE_SIZE: usize = 32;
pub const DEFAULT_SAMPLING: f64 = 0.5;

/// Signal threshold used when the caller gives none.
pub const DEFAULT_SIGNAL_THRESHOLD: f32 = 1.0;

/// Relative improvement below which an iteration loop is considered converged.
pub const CONVERGENCE_THRESHOLD: f64 = 0.01;

// =============================================================================
// Sampling
// =============================================================================

/// How candidate tile positions are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SamplingStrategy {
    /// Uniform lattice with spacing `tile_size * sampling`.
    #[default]
    Grid,
    /// Sparse gradient maxima. `multiscale` adds coarse and detail layers.
    InterestPoint { multiscale: bool },
}

/// Sampling parameters for one estimation pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    pub strategy: SamplingStrategy,
    /// Minimum tile average, in both images, for a position to be sampled.
    pub signal_threshold: f32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            strategy: SamplingStrategy::Grid,
            signal_threshold: DEFAULT_SIGNAL_THRESHOLD,
        }
    }
}

// =============================================================================
// Correlation
// =============================================================================

/// Tile correlation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationConfig {
    /// Tiles with an edge below this use raw cross-correlation.
    pub cross_correlation_below: usize,
    /// Sigma, in pixels, of the Gaussian taper applied to the normalized
    /// cross-power spectrum. Shapes the correlation peak so the log-parabola
    /// sub-pixel fit is exact. 0 disables the taper.
    pub spectral_taper: f64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            cross_correlation_below: MIN_TILE_SIZE,
            spectral_taper: 1.0,
        }
    }
}

impl CorrelationConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.spectral_taper >= 0.0 && self.spectral_taper.is_finite()) {
            return Err(Error::invalid(
                "spectral_taper",
                format!("must be finite and >= 0, got {}", self.spectral_taper),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Sparse field interpolation
// =============================================================================

/// Radial weighting used when interpolating sparse samples onto a grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FieldInterpolation {
    /// Thin-plate kernel weight `1 / (1 + |r² ln r|)`.
    #[default]
    ThinPlate,
    /// Gaussian radial basis `exp(-(eps * r)²)`.
    GaussianRbf,
    /// Inverse distance weighting `1 / r^p`.
    InverseDistance,
}

/// Sparse distortion field settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConfig {
    /// Number of nearest samples used per grid node.
    pub neighbors_k: usize,
    /// Reference tile size for tile-size weighting.
    pub base_tile_size: usize,
    /// Weight samples by `(tile_size / base_tile_size)²`.
    pub tile_weighting: bool,
    pub kind: FieldInterpolation,
    pub idw_power: f64,
    pub rbf_epsilon: f64,
}

impl Default for FieldConfig {
    fn default() -> Self {
        Self {
            neighbors_k: 12,
            base_tile_size: 64,
            tile_weighting: false,
            kind: FieldInterpolation::ThinPlate,
            idw_power: 2.0,
            rbf_epsilon: 0.01,
        }
    }
}

impl FieldConfig {
    pub fn validate(&self) -> Result<()> {
        if self.neighbors_k == 0 {
            return Err(Error::invalid("neighbors_k", "must be at least 1"));
        }
        if self.base_tile_size == 0 {
            return Err(Error::invalid("base_tile_size", "must be positive"));
        }
        if self.idw_power <= 0.0 || self.rbf_epsilon <= 0.0 {
            return Err(Error::invalid(
                "field",
                "idw_power and rbf_epsilon must be positive",
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Grid filtering
// =============================================================================

/// Outlier removal and smoothing applied to every estimated distortion grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridFilterConfig {
    /// Radius, in grid cells, searched when filling unsampled cells.
    pub search_radius: usize,
    /// Half size of the MAD window (2 gives 5x5).
    pub half_window: usize,
    /// Cells further than `mad_threshold * MAD` from the local median are
    /// replaced by the median.
    pub mad_threshold: f32,
    /// Gaussian smoothing sigma in grid cells. 0 disables smoothing.
    pub sigma: f32,
}

impl Default for GridFilterConfig {
    fn default() -> Self {
        Self {
            search_radius: 3,
            half_window: 2,
            mad_threshold: 3.0,
            sigma: 1.0,
        }
    }
}

impl GridFilterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.mad_threshold <= 0.0 {
            return Err(Error::invalid("mad_threshold", "must be positive"));
        }
        if self.sigma < 0.0 {
            return Err(Error::invalid("sigma", "must not be negative"));
        }
        Ok(())
    }
}

// =============================================================================
// Warping
// =============================================================================

/// Resampling kernel used when warping an image by a distortion map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WarpInterpolation {
    Bilinear,
    #[default]
    Lanczos3,
}

// =============================================================================
// Dedistortion
// =============================================================================

/// Settings for single-reference dedistortion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedistortConfig {
    /// Correlation tile edge in pixels. Clamped up to 16.
    pub tile_size: usize,
    /// Grid spacing as a fraction of the tile size.
    pub sampling: f64,
    /// Minimum tile average for a position to be sampled.
    pub background_threshold: Option<f32>,
    /// Maximum number of estimate-and-warp rounds.
    pub iterations: usize,
    /// Use interest-point sampling instead of the uniform grid.
    pub sparse: bool,
    /// With `sparse`, also sample at coarser and finer tile sizes.
    pub multiscale: bool,
    /// Coarse-to-fine refinement within each round.
    pub refine: bool,
    /// Fraction of lowest-confidence samples dropped before interpolation.
    pub rejection_percentile: f64,
    pub warp: WarpInterpolation,
    pub field: FieldConfig,
    pub filter: GridFilterConfig,
    pub correlation: CorrelationConfig,
}

impl Default for DedistortConfig {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
            sampling: DEFAULT_SAMPLING,
            background_threshold: None,
            iterations: 1,
            sparse: false,
            multiscale: false,
            refine: false,
            rejection_percentile: 0.5,
            warp: WarpInterpolation::default(),
            field: FieldConfig::default(),
            filter: GridFilterConfig::default(),
            correlation: CorrelationConfig::default(),
        }
    }
}

impl DedistortConfig {
    pub fn with_tile_size(mut self, tile_size: usize) -> Self {
        self.tile_size = tile_size;
        self
    }

    pub fn with_sampling(mut self, sampling: f64) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_background_threshold(mut self, threshold: f32) -> Self {
        self.background_threshold = Some(threshold);
        self
    }

    pub fn with_sparse(mut self, sparse: bool, multiscale: bool) -> Self {
        self.sparse = sparse;
        self.multiscale = multiscale;
        self
    }

    pub fn sampling_strategy(&self) -> SamplingStrategy {
        if self.sparse {
            SamplingStrategy::InterestPoint {
                multiscale: self.multiscale,
            }
        } else {
            SamplingStrategy::Grid
        }
    }

    pub fn sampling_config(&self) -> SamplingConfig {
        SamplingConfig {
            strategy: self.sampling_strategy(),
            signal_threshold: self
                .background_threshold
                .unwrap_or(DEFAULT_SIGNAL_THRESHOLD),
        }
    }

    /// Tile size actually used, never below [`ABSOLUTE_MIN_TILE_SIZE`].
    pub fn effective_tile_size(&self) -> usize {
        self.tile_size.max(ABSOLUTE_MIN_TILE_SIZE)
    }

    /// Grid increment for a given tile size.
    pub fn increment_for(&self, tile_size: usize) -> usize {
        ((tile_size as f64 * self.sampling) as usize).max(MIN_DEDISTORT_STEP)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tile_size < ABSOLUTE_MIN_TILE_SIZE {
            return Err(Error::InvalidTileSize(self.tile_size));
        }
        if !(self.sampling > 0.0 && self.sampling.is_finite()) {
            return Err(Error::invalid(
                "sampling",
                format!("must be positive, got {}", self.sampling),
            ));
        }
        if self.iterations == 0 {
            return Err(Error::invalid("iterations", "must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.rejection_percentile) {
            return Err(Error::invalid(
                "rejection_percentile",
                format!("must be in [0, 1), got {}", self.rejection_percentile),
            ));
        }
        if let Some(threshold) = self.background_threshold
            && !threshold.is_finite()
        {
            return Err(Error::invalid("background_threshold", "must be finite"));
        }
        self.field.validate()?;
        self.filter.validate()?;
        self.correlation.validate()
    }
}

/// Settings for consensus-reference dedistortion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusConfig {
    pub dedistort: DedistortConfig,
    /// Maximum number of partners compared with each image per round.
    pub max_comparisons: usize,
    /// Partner subsampling seed is `seed_base + i + iteration * n`.
    pub seed_base: u64,
    /// Below this many images a warning is logged.
    pub min_recommended_images: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            dedistort: DedistortConfig::default(),
            max_comparisons: 30,
            seed_base: 42,
            min_recommended_images: 5,
        }
    }
}

impl ConsensusConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_comparisons == 0 {
            return Err(Error::invalid("max_comparisons", "must be at least 1"));
        }
        self.dedistort.validate()
    }
}

// =============================================================================
// Stacking
// =============================================================================

/// How the stacking reference frame is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReferenceSelection {
    First,
    Average,
    Median,
    /// Lowest ellipse-fit eccentricity.
    Eccentricity,
    /// Sharpest frame; frame weights become their sharpness.
    #[default]
    Sharpness,
    /// Frame named by `StackConfig::manual_reference`.
    Manual,
    /// Sharpest frame, tagged as consensus reference.
    Consensus,
}

/// Settings for [`crate::stack`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackConfig {
    pub tile_size: usize,
    pub sampling: f64,
    pub reference: ReferenceSelection,
    /// File name of the reference frame for [`ReferenceSelection::Manual`].
    pub manual_reference: Option<String>,
    pub correlation: CorrelationConfig,
    pub filter: GridFilterConfig,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
            sampling: DEFAULT_SAMPLING,
            reference: ReferenceSelection::default(),
            manual_reference: None,
            correlation: CorrelationConfig::default(),
            filter: GridFilterConfig::default(),
        }
    }
}

impl StackConfig {
    pub fn increment(&self) -> usize {
        ((self.tile_size as f64 * self.sampling) as usize).max(MIN_STACK_STEP)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tile_size < ABSOLUTE_MIN_TILE_SIZE || !self.tile_size.is_power_of_two() {
            return Err(Error::InvalidTileSize(self.tile_size));
        }
        if !(self.sampling > 0.0 && self.sampling.is_finite()) {
            return Err(Error::invalid(
                "sampling",
                format!("must be positive, got {}", self.sampling),
            ));
        }
        self.correlation.validate()?;
        self.filter.validate()
    }
}

/// Settings for [`crate::stack_dedistorted`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackDedistortedConfig {
    /// Fraction of best frames kept. Clamped to `[0, 1]`.
    pub best_fraction: f64,
    /// Per-pixel weighting from local error and sharpness.
    pub local_weights: bool,
}

impl Default for StackDedistortedConfig {
    fn default() -> Self {
        Self {
            best_fraction: 1.0,
            local_weights: false,
        }
    }
}

impl StackDedistortedConfig {
    pub fn validate(&self) -> Result<()> {
        if self.best_fraction.is_nan() {
            return Err(Error::invalid("best_fraction", "must be a number"));
        }
        Ok(())
    }

    /// Number of frames kept out of `n`, at least one.
    pub fn keep_count(&self, n: usize) -> usize {
        let ratio = self.best_fraction.clamp(0.0, 1.0);
        ((ratio * n as f64).ceil() as usize).clamp(1, n.max(1))
    }
}

// =============================================================================
// Accelerator
// =============================================================================

/// Accelerator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuConfig {
    /// Device memory, in bytes, assumed for budgets when the backend cannot
    /// report a fixed capacity.
    pub device_memory: u64,
    /// Tile-size groups smaller than this are correlated on the CPU.
    pub min_tiles_for_gpu: usize,
    /// Tile sizes the correlation kernel is compiled for.
    pub supported_tile_sizes: Vec<usize>,
    /// Tile count reserved in the memory budget for correlation kernels.
    pub budget_tiles: usize,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            device_memory: 1 << 30,
            min_tiles_for_gpu: 100,
            supported_tile_sizes: vec![32, 64, 128],
            budget_tiles: 10_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedistort_defaults_validate() {
        assert!(DedistortConfig::default().validate().is_ok());
        assert!(ConsensusConfig::default().validate().is_ok());
        assert!(StackConfig::default().validate().is_ok());
        assert!(StackDedistortedConfig::default().validate().is_ok());
    }

    #[test]
    fn test_tile_size_below_minimum_rejected() {
        let config = DedistortConfig::default().with_tile_size(8);
        assert!(matches!(config.validate(), Err(Error::InvalidTileSize(8))));
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let config = DedistortConfig::default().with_iterations(0);
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidParameter {
                name: "iterations",
                ..
            })
        ));
    }

    #[test]
    fn test_increment_never_below_minimum() {
        let config = DedistortConfig::default().with_sampling(0.1);
        assert_eq!(config.increment_for(32), MIN_DEDISTORT_STEP);
        let config = DedistortConfig::default().with_sampling(0.5);
        assert_eq!(config.increment_for(64), 32);

        let stack = StackConfig {
            sampling: 0.01,
            ..Default::default()
        };
        assert_eq!(stack.increment(), MIN_STACK_STEP);
    }

    #[test]
    fn test_stack_requires_power_of_two_tiles() {
        let config = StackConfig {
            tile_size: 48,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidTileSize(48))));
    }

    #[test]
    fn test_sampling_strategy_from_flags() {
        let config = DedistortConfig::default();
        assert_eq!(config.sampling_strategy(), SamplingStrategy::Grid);
        let config = config.with_sparse(true, true);
        assert_eq!(
            config.sampling_strategy(),
            SamplingStrategy::InterestPoint { multiscale: true }
        );
    }

    #[test]
    fn test_keep_count_clamps_ratio() {
        let config = StackDedistortedConfig {
            best_fraction: 0.3,
            local_weights: false,
        };
        assert_eq!(config.keep_count(10), 3);
        assert_eq!(config.keep_count(1), 1);

        let config = StackDedistortedConfig {
            best_fraction: 7.0,
            local_weights: false,
        };
        assert_eq!(config.keep_count(4), 4);

        let config = StackDedistortedConfig {
            best_fraction: -1.0,
            local_weights: false,
        };
        assert_eq!(config.keep_count(4), 1);
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = ConsensusConfig {
            max_comparisons: 12,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: ConsensusConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
