//! Testing utilities for helios.

#![allow(dead_code)]

use glam::DVec2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rustfft::num_complex::Complex;

use crate::correlation::{Fft2d, signed_frequency};
use crate::image::{ConsensusKeyframe, Image, SourceInfo};

/// Initialize tracing subscriber for tests.
/// Safe to call multiple times - will only initialize once.
/// Respects RUST_LOG env var, defaults to "info".
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Band-limited periodic `n × n` texture, circularly shifted by `shift`.
///
/// Built from a random spectrum, so a sub-pixel shift is exact: the same
/// seed with a different shift gives the same trigonometric polynomial
/// evaluated at `p - shift`.
pub fn periodic_texture(n: usize, shift: DVec2, seed: u64) -> Vec<f32> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let bandwidth = n as f64 / 5.0;
    let mut spectrum = Vec::with_capacity(n * n);
    for ky in 0..n {
        let fy = signed_frequency(ky, n);
        for kx in 0..n {
            let fx = signed_frequency(kx, n);
            let amplitude = (-(fx * fx + fy * fy) / (2.0 * bandwidth * bandwidth)).exp();
            let re: f64 = rng.random_range(-1.0..1.0);
            let im: f64 = rng.random_range(-1.0..1.0);
            let phase = -2.0 * std::f64::consts::PI * (fx * shift.x + fy * shift.y) / n as f64;
            let value = Complex::new(re, im) * Complex::from_polar(amplitude, phase);
            spectrum.push(Complex::new(value.re as f32, value.im as f32));
        }
    }
    Fft2d::new(n).inverse(&mut spectrum);
    // Lift above the default signal threshold.
    spectrum.iter().map(|c| 100.0 + 1000.0 * c.re).collect()
}

/// `size × size` window from the middle of a `2·size` periodic texture.
///
/// Unlike [`periodic_texture`] itself the content does not wrap around, so
/// a shifted frame brings new structure in at its borders, as a real
/// capture does.
pub fn broadband_frame(size: usize, shift: DVec2, seed: u64) -> Image {
    let n = 2 * size;
    let texture = periodic_texture(n, shift, seed);
    Image::mono(size, size, tile(&texture, n, size / 2, size / 2, size))
}

/// Smooth granulation-like pattern evaluated at continuous coordinates.
#[derive(Debug, Clone)]
pub struct SolarPattern {
    waves: Vec<(DVec2, f64, f64)>,
}

impl SolarPattern {
    pub fn new(seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let waves = (0..40)
            .map(|_| {
                let wavelength: f64 = rng.random_range(6.0..24.0);
                let angle: f64 = rng.random_range(0.0..std::f64::consts::PI);
                let phase: f64 = rng.random_range(0.0..std::f64::consts::TAU);
                let amplitude: f64 = rng.random_range(15.0..30.0);
                let k = DVec2::from_angle(angle) * (std::f64::consts::TAU / wavelength);
                (k, phase, amplitude)
            })
            .collect();
        Self { waves }
    }

    pub fn sample(&self, p: DVec2) -> f32 {
        let v: f64 = self
            .waves
            .iter()
            .map(|(k, phase, amplitude)| amplitude * (k.dot(p) + phase).cos())
            .sum();
        (500.0 + v) as f32
    }

    /// Render `width × height` where pixel `p` shows the pattern at
    /// `p - displacement(p)`.
    pub fn render(
        &self,
        width: usize,
        height: usize,
        displacement: impl Fn(DVec2) -> DVec2,
    ) -> Image {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                let p = DVec2::new(x as f64, y as f64);
                data.push(self.sample(p - displacement(p)));
            }
        }
        Image::mono(width, height, data)
    }

    /// The pattern translated by `shift`.
    pub fn shifted(&self, width: usize, height: usize, shift: DVec2) -> Image {
        self.render(width, height, |_| shift)
    }
}

/// Tag an image with a file name.
pub fn named(image: Image, file_name: &str) -> Image {
    image.with_metadata(SourceInfo {
        file_name: file_name.to_string(),
    })
}

/// Five frames of one pattern with distinct global shifts, the first one
/// tagged as consensus keyframe.
pub fn consensus_set(size: usize, shifts: &[DVec2], seed: u64) -> Vec<Image> {
    let pattern = SolarPattern::new(seed);
    shifts
        .iter()
        .enumerate()
        .map(|(i, &shift)| {
            let image = named(pattern.shifted(size, size, shift), &format!("frame_{i:02}.fits"));
            if i == 0 {
                image.with_metadata(ConsensusKeyframe)
            } else {
                image
            }
        })
        .collect()
}

/// Copy the `size × size` tile with top-left `(x0, y0)`.
pub fn tile(data: &[f32], width: usize, x0: usize, y0: usize, size: usize) -> Vec<f32> {
    let mut tile = Vec::with_capacity(size * size);
    for y in y0..y0 + size {
        tile.extend_from_slice(&data[y * width + x0..y * width + x0 + size]);
    }
    tile
}
