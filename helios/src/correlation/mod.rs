//! Tile correlation.
//!
//! Two estimators share one FFT pipeline:
//!
//! - [`TileCorrelator::correlate`]: phase correlation on Hann-windowed tiles
//!   (raw cross-correlation for tiles under 32 pixels), refined to sub-pixel
//!   precision by a log-parabola fit around the peak.
//! - [`TileCorrelator::ncc`]: normalized cross-correlation. Same peak logic,
//!   but the peak height divided by the tile energies gives a confidence in
//!   `[0, 1]`. This is the estimator used by the displacement sampler, on CPU
//!   and on the accelerator.
//!
//! Shifts follow one convention: the returned `(dx, dy)` is the displacement
//! that maps the target onto the reference, i.e. `target(p + d) ≈ reference(p)`.

mod fft;
mod peak;
mod window;


use std::collections::HashMap;
use std::sync::Arc;

use glam::DVec2;
use parking_lot::Mutex;
use rayon::prelude::*;
use rustfft::num_complex::Complex;

use crate::config::CorrelationConfig;

pub(crate) use fft::{Fft2d, fft_shift, signed_frequency};
pub(crate) use peak::{Peak, find_peak, refine};
#[cfg(feature = "wgpu")]
pub(crate) use window::hann;

/// Displacement measured for one tile pair.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TileShift {
    pub dx: f64,
    pub dy: f64,
    /// Peak quality in `[0, 1]`.
    pub confidence: f64,
}

impl TileShift {
    pub const ZERO: TileShift = TileShift {
        dx: 0.0,
        dy: 0.0,
        confidence: 0.0,
    };

    pub fn vector(&self) -> DVec2 {
        DVec2::new(self.dx, self.dy)
    }
}

/// Per tile size FFT plans and windows.
#[derive(Debug)]
struct TilePlan {
    fft: Fft2d,
    window: Vec<f32>,
    taper: Option<Vec<f32>>,
}

/// Correlates tile pairs.
///
/// Holds the FFT plans and window functions for every tile size it has seen,
/// so one instance should be shared across a whole estimation pass.
#[derive(Debug)]
pub struct TileCorrelator {
    config: CorrelationConfig,
    plans: Mutex<HashMap<usize, Arc<TilePlan>>>,
}

impl Default for TileCorrelator {
    fn default() -> Self {
        Self::new(CorrelationConfig::default())
    }
}

impl TileCorrelator {
    pub fn new(config: CorrelationConfig) -> Self {
        Self {
            config,
            plans: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CorrelationConfig {
        &self.config
    }

    fn plan(&self, size: usize) -> Arc<TilePlan> {
        let mut plans = self.plans.lock();
        let plan = plans.entry(size).or_insert_with(|| {
            let sigma = self.config.spectral_taper;
            Arc::new(TilePlan {
                fft: Fft2d::new(size),
                window: window::hann(size),
                taper: (sigma > 0.0).then(|| window::spectral_taper(size, sigma)),
            })
        });
        Arc::clone(plan)
    }

    /// Shift between two `size × size` tiles.
    ///
    /// Tiles smaller than `cross_correlation_below` use raw cross-correlation;
    /// larger tiles use phase correlation.
    pub fn correlate(&self, reference: &[f32], target: &[f32], size: usize) -> TileShift {
        debug_assert_eq!(reference.len(), size * size);
        debug_assert_eq!(target.len(), size * size);

        let plan = self.plan(size);
        if size < self.config.cross_correlation_below {
            let r = centered(reference, None);
            let t = centered(target, None);
            return normalized_peak(&plan, &r, &t);
        }

        let r = centered(reference, Some(&plan.window));
        let t = centered(target, Some(&plan.window));
        let mut spectrum = cross_power(&plan.fft, &r, &t);
        for c in spectrum.iter_mut() {
            let magnitude = c.norm();
            *c = if magnitude > 1e-10 {
                *c / magnitude
            } else {
                Complex::default()
            };
        }
        if let Some(taper) = &plan.taper {
            for (c, &w) in spectrum.iter_mut().zip(taper) {
                *c *= w;
            }
        }

        let (offset, peak) = locate(&plan.fft, spectrum);
        // A tapered delta peaks at 1 / (2πσ²).
        let peak_scale = match plan.taper {
            Some(_) => {
                let sigma = self.config.spectral_taper;
                2.0 * std::f64::consts::PI * sigma * sigma
            }
            None => 1.0,
        };
        TileShift {
            dx: -offset.x,
            dy: -offset.y,
            confidence: (peak.value as f64 * peak_scale).clamp(0.0, 1.0),
        }
    }

    /// Normalized cross-correlation of zero-mean, Hann-windowed tiles.
    ///
    /// Flat tiles give [`TileShift::ZERO`].
    pub fn ncc(&self, reference: &[f32], target: &[f32], size: usize) -> TileShift {
        debug_assert_eq!(reference.len(), size * size);
        debug_assert_eq!(target.len(), size * size);

        let plan = self.plan(size);
        let r = centered(reference, Some(&plan.window));
        let t = centered(target, Some(&plan.window));
        normalized_peak(&plan, &r, &t)
    }

    /// [`TileCorrelator::ncc`] over tiles packed back to back.
    pub fn ncc_batch(&self, references: &[f32], targets: &[f32], size: usize) -> Vec<TileShift> {
        let area = size * size;
        debug_assert_eq!(references.len(), targets.len());
        debug_assert_eq!(references.len() % area.max(1), 0);

        references
            .par_chunks(area)
            .zip(targets.par_chunks(area))
            .map(|(r, t)| self.ncc(r, t, size))
            .collect()
    }
}

/// Subtract the mean, then apply the separable window if given.
fn centered(tile: &[f32], window: Option<&[f32]>) -> Vec<f32> {
    let mean = tile.iter().map(|&v| v as f64).sum::<f64>() / tile.len().max(1) as f64;
    let mean = mean as f32;
    match window {
        None => tile.iter().map(|&v| v - mean).collect(),
        Some(w) => {
            let n = w.len();
            tile.iter()
                .enumerate()
                .map(|(i, &v)| (v - mean) * w[i % n] * w[i / n])
                .collect()
        }
    }
}

/// `R · conj(T)`: inverse transform peaks at minus the target's shift.
fn cross_power(fft: &Fft2d, reference: &[f32], target: &[f32]) -> Vec<Complex<f32>> {
    let mut r: Vec<Complex<f32>> = reference.iter().map(|&v| Complex::new(v, 0.0)).collect();
    let mut t: Vec<Complex<f32>> = target.iter().map(|&v| Complex::new(v, 0.0)).collect();
    fft.forward(&mut r);
    fft.forward(&mut t);
    for (a, b) in r.iter_mut().zip(&t) {
        *a *= b.conj();
    }
    r
}

/// Inverse transform a cross spectrum and find its sub-pixel peak.
fn locate(fft: &Fft2d, mut spectrum: Vec<Complex<f32>>) -> (DVec2, Peak) {
    let n = fft.size();
    fft.inverse(&mut spectrum);
    let real: Vec<f32> = spectrum.iter().map(|c| c.re).collect();
    let surface = fft_shift(&real, n);
    let peak = find_peak(&surface, n);
    (refine(&surface, n, peak), peak)
}

fn normalized_peak(plan: &TilePlan, reference: &[f32], target: &[f32]) -> TileShift {
    let energy = |tile: &[f32]| tile.iter().map(|&v| (v as f64) * (v as f64)).sum::<f64>();
    let norm = (energy(reference) * energy(target)).sqrt();
    if norm < 1e-10 {
        return TileShift::ZERO;
    }

    let spectrum = cross_power(&plan.fft, reference, target);
    let (offset, peak) = locate(&plan.fft, spectrum);
    TileShift {
        dx: -offset.x,
        dy: -offset.y,
        confidence: (peak.value as f64 / norm).clamp(0.0, 1.0),
    }
}

/// Shift from a centered correlation surface of side `size` whose peak is
/// normalized by `norm`. Used for surfaces computed off the FFT path.
pub(crate) fn shift_from_surface(surface: &[f32], size: usize, norm: f64) -> TileShift {
    if norm < 1e-10 {
        return TileShift::ZERO;
    }
    let peak = find_peak(surface, size);
    let offset = refine(surface, size, peak);
    TileShift {
        dx: -offset.x,
        dy: -offset.y,
        confidence: (peak.value as f64 / norm).clamp(0.0, 1.0),
    }
}
