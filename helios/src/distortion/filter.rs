//! Gap filling, outlier replacement and smoothing of a distortion grid.

use glam::DVec2;

use super::DistortionMap;
use crate::config::GridFilterConfig;

/// MAD to standard deviation for normally distributed data.
const MAD_TO_SIGMA: f64 = 1.4826;

/// Lower bound on the robust sigma, in pixels. Keeps near-constant windows
/// from flagging sub-pixel noise as outliers.
const MIN_SIGMA: f64 = 0.1;

/// Clean up a freshly estimated grid in three passes:
///
/// 1. Unsampled cells are filled by inverse-distance-squared interpolation of
///    sampled cells within `search_radius`. Cells with no sampled neighbor
///    stay zero.
/// 2. Each component that deviates from its window median by more than
///    `mad_threshold` robust sigmas is replaced by that median.
/// 3. Separable Gaussian smoothing, renormalized at the borders.
///
/// Afterwards every cell counts as sampled.
pub fn filter_and_smooth(map: &mut DistortionMap, config: &GridFilterConfig) {
    if map.values.is_empty() || map.sampled_count() == 0 {
        map.mark_all_sampled();
        return;
    }

    fill_gaps(map, config.search_radius);
    reject_outliers(map, config.half_window, config.mad_threshold as f64);
    if config.sigma > 0.0 {
        gaussian_smooth(map, config.sigma as f64);
    }
    map.mark_all_sampled();
}

fn fill_gaps(map: &mut DistortionMap, radius: usize) {
    let (cols, rows) = (map.cols, map.rows);
    let radius = radius as isize;
    let source = map.values.clone();

    for row in 0..rows {
        for col in 0..cols {
            if map.sampled[row * cols + col] {
                continue;
            }
            let mut sum = DVec2::ZERO;
            let mut weight = 0.0;
            for dy in -radius..=radius {
                for dx in -radius..=radius {
                    let (c, r) = (col as isize + dx, row as isize + dy);
                    if c < 0 || r < 0 || c >= cols as isize || r >= rows as isize {
                        continue;
                    }
                    let index = r as usize * cols + c as usize;
                    if !map.sampled[index] {
                        continue;
                    }
                    let w = 1.0 / (dx * dx + dy * dy) as f64;
                    sum += source[index] * w;
                    weight += w;
                }
            }
            if weight > 0.0 {
                map.values[row * cols + col] = sum / weight;
            }
        }
    }
}

fn reject_outliers(map: &mut DistortionMap, half_window: usize, threshold: f64) {
    let (cols, rows) = (map.cols, map.rows);
    let source = map.values.clone();
    let mut xs = Vec::with_capacity((2 * half_window + 1).pow(2));
    let mut ys = Vec::with_capacity(xs.capacity());
    let mut scratch = Vec::with_capacity(xs.capacity());

    for row in 0..rows {
        for col in 0..cols {
            xs.clear();
            ys.clear();
            let r0 = row.saturating_sub(half_window);
            let r1 = (row + half_window).min(rows - 1);
            let c0 = col.saturating_sub(half_window);
            let c1 = (col + half_window).min(cols - 1);
            for r in r0..=r1 {
                for c in c0..=c1 {
                    let v = source[r * cols + c];
                    xs.push(v.x);
                    ys.push(v.y);
                }
            }

            let v = source[row * cols + col];
            let x = robust_replace(v.x, &mut xs, &mut scratch, threshold);
            let y = robust_replace(v.y, &mut ys, &mut scratch, threshold);
            map.values[row * cols + col] = DVec2::new(x, y);
        }
    }
}

/// `value`, or the window median if `value` is an outlier.
fn robust_replace(value: f64, window: &mut [f64], scratch: &mut Vec<f64>, threshold: f64) -> f64 {
    let median = median_mut(window);
    scratch.clear();
    scratch.extend(window.iter().map(|v| (v - median).abs()));
    let mad = median_mut(scratch);
    let sigma = (mad * MAD_TO_SIGMA).max(MIN_SIGMA);
    if (value - median).abs() > threshold * sigma {
        median
    } else {
        value
    }
}

/// Median by partial sort. Even lengths average the two middle values.
fn median_mut(data: &mut [f64]) -> f64 {
    debug_assert!(!data.is_empty());
    let mid = data.len() / 2;
    let odd = data.len() % 2 == 1;
    let (lower, upper, _) = data.select_nth_unstable_by(mid, f64::total_cmp);
    let upper = *upper;
    if odd {
        upper
    } else {
        let lower = lower.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        (lower + upper) * 0.5
    }
}

fn gaussian_smooth(map: &mut DistortionMap, sigma: f64) {
    let radius = (3.0 * sigma).ceil() as isize;
    let kernel: Vec<f64> = (-radius..=radius)
        .map(|i| (-(i * i) as f64 / (2.0 * sigma * sigma)).exp())
        .collect();
    let (cols, rows) = (map.cols as isize, map.rows as isize);

    let convolve = |source: &[DVec2], horizontal: bool| -> Vec<DVec2> {
        let mut out = vec![DVec2::ZERO; source.len()];
        for row in 0..rows {
            for col in 0..cols {
                let mut sum = DVec2::ZERO;
                let mut weight = 0.0;
                for (k, &w) in kernel.iter().enumerate() {
                    let offset = k as isize - radius;
                    let (c, r) = if horizontal {
                        (col + offset, row)
                    } else {
                        (col, row + offset)
                    };
                    if c < 0 || r < 0 || c >= cols || r >= rows {
                        continue;
                    }
                    sum += source[(r * cols + c) as usize] * w;
                    weight += w;
                }
                out[(row * cols + col) as usize] = sum / weight;
            }
        }
        out
    };

    let horizontal = convolve(&map.values, true);
    map.values = convolve(&horizontal, false);
}
