use std::f64::consts::PI;

use super::fft::signed_frequency;

/// Symmetric Hann window, `0.5 (1 - cos(2πi / (n - 1)))`.
pub(crate) fn hann(n: usize) -> Vec<f32> {
    if n < 2 {
        return vec![1.0; n];
    }
    let denom = (n - 1) as f64;
    (0..n)
        .map(|i| (0.5 * (1.0 - (2.0 * PI * i as f64 / denom).cos())) as f32)
        .collect()
}

/// Gaussian low-pass `exp(-|ω|² σ² / 2)` in unshifted FFT layout.
///
/// Multiplying a phase-normalized spectrum by this turns the correlation
/// delta into a sampled Gaussian of width `sigma` pixels.
pub(crate) fn spectral_taper(n: usize, sigma: f64) -> Vec<f32> {
    let scale = 2.0 * PI / n as f64;
    let axis: Vec<f64> = (0..n)
        .map(|k| {
            let w = signed_frequency(k, n) * scale;
            (-0.5 * w * w * sigma * sigma).exp()
        })
        .collect();

    let mut taper = Vec::with_capacity(n * n);
    for &wy in &axis {
        taper.extend(axis.iter().map(|&wx| (wx * wy) as f32));
    }
    taper
}
