//! Warping images by distortion maps.
//!
//! The output pixel `p` is the input sampled at `p + d(p)`. Samples that
//! fall outside the image are clamped to the nearest edge pixel.

use std::f32::consts::PI;

use rayon::prelude::*;

use crate::config::WarpInterpolation;
use crate::distortion::DistortionMap;
use crate::image::{Image, bilinear_clamped};

const LANCZOS_RADIUS: i64 = 3;

#[inline]
fn lanczos3(x: f32) -> f32 {
    if x.abs() < 1e-6 {
        return 1.0;
    }
    if x.abs() >= LANCZOS_RADIUS as f32 {
        return 0.0;
    }
    let pi_x = PI * x;
    let pi_x_a = pi_x / LANCZOS_RADIUS as f32;
    (pi_x.sin() / pi_x) * (pi_x_a.sin() / pi_x_a)
}

/// Normalized 6-tap Lanczos-3 weights for fractional offset `t`.
#[inline]
fn lanczos3_weights(t: f32) -> [f32; 6] {
    let mut w = [0.0f32; 6];
    for (i, wi) in w.iter_mut().enumerate() {
        *wi = lanczos3(t - (i as f32 - 2.0));
    }
    let sum: f32 = w.iter().sum();
    if sum.abs() > 1e-10 {
        for wi in &mut w {
            *wi /= sum;
        }
    }
    w
}

/// Lanczos-3 sample with edge clamping.
pub(crate) fn lanczos3_clamped(data: &[f32], width: usize, height: usize, x: f64, y: f64) -> f32 {
    let x = x.clamp(0.0, (width - 1) as f64);
    let y = y.clamp(0.0, (height - 1) as f64);
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let wx = lanczos3_weights((x - x0 as f64) as f32);
    let wy = lanczos3_weights((y - y0 as f64) as f32);

    let max_x = width as i64 - 1;
    let max_y = height as i64 - 1;
    let mut sum = 0.0f32;
    for (j, &wyj) in wy.iter().enumerate() {
        let py = (y0 + j as i64 - 2).clamp(0, max_y) as usize;
        let row = &data[py * width..(py + 1) * width];
        let mut line = 0.0f32;
        for (i, &wxi) in wx.iter().enumerate() {
            let px = (x0 + i as i64 - 2).clamp(0, max_x) as usize;
            line += row[px] * wxi;
        }
        sum += line * wyj;
    }
    sum
}

#[inline]
pub(crate) fn sample(
    data: &[f32],
    width: usize,
    height: usize,
    x: f64,
    y: f64,
    interpolation: WarpInterpolation,
) -> f32 {
    match interpolation {
        WarpInterpolation::Bilinear => bilinear_clamped(data, width, height, x, y),
        WarpInterpolation::Lanczos3 => lanczos3_clamped(data, width, height, x, y),
    }
}

/// Warp one plane by a dense interleaved `dx, dy` field.
pub fn warp_plane(
    data: &[f32],
    width: usize,
    height: usize,
    field: &[f32],
    interpolation: WarpInterpolation,
) -> Vec<f32> {
    debug_assert_eq!(data.len(), width * height);
    debug_assert_eq!(field.len(), width * height * 2);

    let mut out = vec![0.0f32; width * height];
    out.par_chunks_mut(width.max(1))
        .enumerate()
        .for_each(|(y, row)| {
            for (x, v) in row.iter_mut().enumerate() {
                let i = 2 * (y * width + x);
                let sx = x as f64 + field[i] as f64;
                let sy = y as f64 + field[i + 1] as f64;
                *v = sample(data, width, height, sx, sy, interpolation);
            }
        });
    out
}

/// Warp every plane of `image` by `map`. Metadata is kept.
pub fn warp_image(image: &Image, map: &DistortionMap, interpolation: WarpInterpolation) -> Image {
    let (width, height) = image.dimensions();
    let field = map.dense_field(width, height);
    warp_with_field(image, &field, interpolation)
}

pub(crate) fn warp_with_field(image: &Image, field: &[f32], interpolation: WarpInterpolation) -> Image {
    let (width, height) = image.dimensions();
    let mut warped = image.clone();
    for channel in 0..image.channels().count() {
        let plane = warp_plane(image.plane(channel), width, height, field, interpolation);
        warped.plane_mut(channel).copy_from_slice(&plane);
    }
    warped
}

#[cfg(test)]
mod tests {
    use glam::DVec2;

    use super::*;
    use crate::testing::SolarPattern;

    fn constant_map(width: usize, height: usize, d: DVec2) -> DistortionMap {
        let mut map = DistortionMap::new(width, height, 8, 16);
        for row in 0..map.rows() {
            for col in 0..map.cols() {
                map.set(col, row, d);
            }
        }
        map
    }

    #[test]
    fn test_lanczos_weights_partition_of_unity() {
        for t in [0.0, 0.25, 0.5, 0.9] {
            let sum: f32 = lanczos3_weights(t).iter().sum();
            assert!((sum - 1.0).abs() < 1e-5);
        }
        assert_eq!(lanczos3_weights(0.0)[2], 1.0);
    }

    #[test]
    fn test_zero_map_is_identity() {
        let image = SolarPattern::new(1).shifted(48, 40, DVec2::ZERO);
        let map = DistortionMap::new(48, 40, 8, 16);
        for interpolation in [WarpInterpolation::Bilinear, WarpInterpolation::Lanczos3] {
            let warped = warp_image(&image, &map, interpolation);
            for (a, b) in warped.data().iter().zip(image.data()) {
                assert!((a - b).abs() < 1e-3);
            }
        }
    }

    #[test]
    fn test_integer_shift_moves_pixels() {
        let data: Vec<f32> = (0..64).map(|v| v as f32).collect();
        let image = Image::mono(8, 8, data);
        let map = constant_map(8, 8, DVec2::new(1.0, 2.0));
        let warped = warp_image(&image, &map, WarpInterpolation::Lanczos3);
        // out(x, y) = in(x + 1, y + 2)
        assert!((warped.get(3, 1) - image.get(4, 3)).abs() < 1e-4);
        // Clamped at the right and bottom edges.
        assert!((warped.get(7, 7) - image.get(7, 7)).abs() < 1e-4);
    }

    #[test]
    fn test_warp_undoes_shift() {
        let pattern = SolarPattern::new(2);
        let shift = DVec2::new(1.5, -0.75);
        let reference = pattern.shifted(64, 64, DVec2::ZERO);
        let target = pattern.shifted(64, 64, shift);
        let warped = warp_image(&target, &constant_map(64, 64, shift), WarpInterpolation::Lanczos3);

        let mut max_error = 0.0f32;
        for y in 8..56 {
            for x in 8..56 {
                max_error = max_error.max((warped.get(x, y) - reference.get(x, y)).abs());
            }
        }
        // Pattern amplitude is several hundred; interpolation error stays small.
        assert!(max_error < 5.0, "max error {max_error}");
    }

    #[test]
    fn test_rgb_planes_warped_and_metadata_kept() {
        let plane: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let image = Image::rgb(4, 4, [plane.clone(), plane.clone(), plane])
            .with_metadata(crate::image::ConsensusKeyframe);
        let map = constant_map(4, 4, DVec2::new(1.0, 0.0));
        let warped = warp_image(&image, &map, WarpInterpolation::Bilinear);
        for channel in 0..3 {
            assert_eq!(warped.plane(channel)[0], 1.0);
        }
        assert!(warped.metadata().contains::<crate::image::ConsensusKeyframe>());
    }
}
