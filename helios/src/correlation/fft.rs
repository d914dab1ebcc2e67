//! 2D FFT over square tiles by row-column decomposition.

use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

/// Forward and inverse plans for one square tile size.
pub(crate) struct Fft2d {
    size: usize,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
}

impl std::fmt::Debug for Fft2d {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fft2d").field("size", &self.size).finish()
    }
}

impl Fft2d {
    pub fn new(size: usize) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            size,
            forward: planner.plan_fft_forward(size),
            inverse: planner.plan_fft_inverse(size),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn forward(&self, data: &mut [Complex<f32>]) {
        self.process(self.forward.as_ref(), data);
    }

    /// Inverse transform, scaled by `1 / n²` so it undoes [`Fft2d::forward`].
    pub fn inverse(&self, data: &mut [Complex<f32>]) {
        self.process(self.inverse.as_ref(), data);
        let norm = 1.0 / (self.size * self.size) as f32;
        for c in data.iter_mut() {
            *c *= norm;
        }
    }

    fn process(&self, fft: &dyn Fft<f32>, data: &mut [Complex<f32>]) {
        let n = self.size;
        debug_assert_eq!(data.len(), n * n);
        let mut scratch = vec![Complex::default(); fft.get_inplace_scratch_len()];

        fft.process_with_scratch(data, &mut scratch);
        transpose_square(data, n);
        fft.process_with_scratch(data, &mut scratch);
        transpose_square(data, n);
    }
}

/// In-place transpose of an `n × n` matrix.
pub(crate) fn transpose_square<T>(data: &mut [T], n: usize) {
    for i in 0..n {
        for j in (i + 1)..n {
            data.swap(i * n + j, j * n + i);
        }
    }
}

/// Move the zero-lag bin of an `n × n` surface to `(n / 2, n / 2)`.
pub(crate) fn fft_shift(data: &[f32], n: usize) -> Vec<f32> {
    let half = n / 2;
    let mut shifted = vec![0.0; n * n];
    for y in 0..n {
        let sy = (y + half) % n;
        for x in 0..n {
            shifted[sy * n + (x + half) % n] = data[y * n + x];
        }
    }
    shifted
}

/// Signed frequency index of bin `k` in an `n`-point transform.
#[inline]
pub(crate) fn signed_frequency(k: usize, n: usize) -> f64 {
    if k < n.div_ceil(2) {
        k as f64
    } else {
        k as f64 - n as f64
    }
}
