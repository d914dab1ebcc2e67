//! Frame sharpness measures.

use rayon::prelude::*;
use rustfft::num_complex::Complex;

use crate::correlation::{Fft2d, signed_frequency};

/// Gradient energy of a whole frame.
///
/// Sum of squared central differences over the sum of squared intensities,
/// so the value does not depend on exposure. Zero for blank frames.
pub fn estimate_sharpness(data: &[f32], width: usize, height: usize) -> f64 {
    if width < 3 || height < 3 {
        return 0.0;
    }
    let rows: Vec<usize> = (1..height - 1).collect();
    let (gradient, intensity) = common::parallel::par_map_reduce(
        &rows,
        || (0.0, 0.0),
        |&y| row_energy(data, width, y, 1, width - 1),
        |a, b| (a.0 + b.0, a.1 + b.1),
    );
    ratio(gradient, intensity)
}

/// Per-pixel local sharpness.
///
/// Measured on a grid with stride `tile_size / 2`, each node looking at the
/// `tile_size` window centred on it, then bilinearly upsampled to
/// `width × height`. Full power-of-two windows use the share of spectral
/// energy above a quarter of the window size; windows clipped by the image
/// border fall back to gradient energy.
pub fn sharpness_map(data: &[f32], width: usize, height: usize, tile_size: usize) -> Vec<f32> {
    let stride = (tile_size / 2).max(1);
    let grid_w = width.div_ceil(stride) + 1;
    let grid_h = height.div_ceil(stride) + 1;
    let fft = (tile_size >= 4 && tile_size.is_power_of_two()).then(|| Fft2d::new(tile_size));

    let grid: Vec<f64> = (0..grid_w * grid_h)
        .into_par_iter()
        .map(|i| {
            let cx = (i % grid_w) * stride;
            let cy = (i / grid_w) * stride;
            local_sharpness(data, width, height, cx, cy, tile_size, fft.as_ref())
        })
        .collect();

    let mut map = vec![0.0f32; width * height];
    map.par_chunks_mut(width.max(1)).enumerate().for_each(|(y, row)| {
        let gy = y as f64 / stride as f64;
        let gy0 = gy.floor() as usize;
        let gy1 = (gy0 + 1).min(grid_h - 1);
        let fy = gy - gy0 as f64;
        for (x, out) in row.iter_mut().enumerate() {
            let gx = x as f64 / stride as f64;
            let gx0 = gx.floor() as usize;
            let gx1 = (gx0 + 1).min(grid_w - 1);
            let fx = gx - gx0 as f64;

            let v00 = grid[gy0 * grid_w + gx0];
            let v10 = grid[gy0 * grid_w + gx1];
            let v01 = grid[gy1 * grid_w + gx0];
            let v11 = grid[gy1 * grid_w + gx1];
            let top = v00 + fx * (v10 - v00);
            let bottom = v01 + fx * (v11 - v01);
            *out = (top + fy * (bottom - top)) as f32;
        }
    });
    map
}

fn local_sharpness(
    data: &[f32],
    width: usize,
    height: usize,
    cx: usize,
    cy: usize,
    tile_size: usize,
    fft: Option<&Fft2d>,
) -> f64 {
    let half = tile_size / 2;
    let x0 = cx.saturating_sub(half);
    let y0 = cy.saturating_sub(half);
    let x1 = (cx + half).min(width);
    let y1 = (cy + half).min(height);
    if x1 <= x0 || y1 <= y0 {
        return 0.0;
    }

    match fft {
        Some(fft) if x1 - x0 == tile_size && y1 - y0 == tile_size => {
            spectral_sharpness(data, width, x0, y0, fft)
        }
        _ => gradient_sharpness(data, width, height, x0, x1, y0, y1),
    }
}

/// Share of spectral energy beyond radius `n / 4`.
fn spectral_sharpness(data: &[f32], width: usize, x0: usize, y0: usize, fft: &Fft2d) -> f64 {
    let n = fft.size();
    let mut spectrum: Vec<Complex<f32>> = Vec::with_capacity(n * n);
    for y in y0..y0 + n {
        let row = &data[y * width + x0..y * width + x0 + n];
        spectrum.extend(row.iter().map(|&v| Complex::new(v, 0.0)));
    }
    fft.forward(&mut spectrum);

    let cutoff = (n / 4) as f64;
    let mut high = 0.0;
    let mut total = 0.0;
    for ky in 0..n {
        let fy = signed_frequency(ky, n);
        for kx in 0..n {
            let fx = signed_frequency(kx, n);
            let energy = spectrum[ky * n + kx].norm_sqr() as f64;
            total += energy;
            if (fx * fx + fy * fy).sqrt() > cutoff {
                high += energy;
            }
        }
    }
    if total < 1e-10 { 0.0 } else { high / total }
}

fn gradient_sharpness(
    data: &[f32],
    width: usize,
    height: usize,
    x0: usize,
    x1: usize,
    y0: usize,
    y1: usize,
) -> f64 {
    let xs = x0.max(1)..x1.min(width.saturating_sub(1));
    let ys = y0.max(1)..y1.min(height.saturating_sub(1));
    let (gradient, intensity) = ys
        .map(|y| row_energy(data, width, y, xs.start, xs.end))
        .fold((0.0, 0.0), |a, b| (a.0 + b.0, a.1 + b.1));
    ratio(gradient, intensity)
}

/// Squared gradient and squared intensity sums over `[x0, x1)` of row `y`.
/// The row must have neighbours above and below.
fn row_energy(data: &[f32], width: usize, y: usize, x0: usize, x1: usize) -> (f64, f64) {
    let mut gradient = 0.0;
    let mut intensity = 0.0;
    for x in x0..x1 {
        let i = y * width + x;
        let dx = (data[i + 1] - data[i - 1]) as f64;
        let dy = (data[i + width] - data[i - width]) as f64;
        gradient += dx * dx + dy * dy;
        intensity += (data[i] as f64) * (data[i] as f64);
    }
    (gradient, intensity)
}

fn ratio(gradient: f64, intensity: f64) -> f64 {
    if intensity < 1e-10 { 0.0 } else { gradient / intensity }
}
