//! Peak search and sub-pixel refinement on a centered correlation surface.

use glam::DVec2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Peak {
    pub x: usize,
    pub y: usize,
    pub value: f32,
}

/// Maximum of a `size × size` surface. Equal values resolve to the bin
/// closest to the center.
pub(crate) fn find_peak(surface: &[f32], size: usize) -> Peak {
    let center = (size / 2) as isize;
    let dist = |x: usize, y: usize| {
        let dx = x as isize - center;
        let dy = y as isize - center;
        dx * dx + dy * dy
    };

    let mut best = Peak {
        x: size / 2,
        y: size / 2,
        value: f32::NEG_INFINITY,
    };
    for y in 0..size {
        for (x, &value) in surface[y * size..(y + 1) * size].iter().enumerate() {
            if value > best.value || (value == best.value && dist(x, y) < dist(best.x, best.y)) {
                best = Peak { x, y, value };
            }
        }
    }
    best
}

/// Offset of a log-parabola through three samples, clamped to ±1.
#[inline]
pub(crate) fn gaussian_offset(left: f32, center: f32, right: f32) -> f64 {
    let l = (left.max(1e-10) as f64).ln();
    let c = (center.max(1e-10) as f64).ln();
    let r = (right.max(1e-10) as f64).ln();
    let denom = 2.0 * (l + r - 2.0 * c);
    if denom.abs() < 1e-10 {
        return 0.0;
    }
    ((l - r) / denom).clamp(-1.0, 1.0)
}

/// Sub-pixel peak position relative to the surface center. Peaks on the
/// border are not refined.
pub(crate) fn refine(surface: &[f32], size: usize, peak: Peak) -> DVec2 {
    let at = |x: usize, y: usize| surface[y * size + x];
    let (x, y) = (peak.x, peak.y);

    let fx = if x > 0 && x + 1 < size {
        gaussian_offset(at(x - 1, y), peak.value, at(x + 1, y))
    } else {
        0.0
    };
    let fy = if y > 0 && y + 1 < size {
        gaussian_offset(at(x, y - 1), peak.value, at(x, y + 1))
    } else {
        0.0
    };

    let center = (size / 2) as f64;
    DVec2::new(x as f64 - center + fx, y as f64 - center + fy)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gaussian_surface(size: usize, cx: f64, cy: f64) -> Vec<f32> {
        let mut surface = vec![0.0; size * size];
        for y in 0..size {
            for x in 0..size {
                let dx = x as f64 - cx;
                let dy = y as f64 - cy;
                surface[y * size + x] = (-(dx * dx + dy * dy) / 2.0).exp() as f32;
            }
        }
        surface
    }

    #[test]
    fn test_gaussian_fit_is_exact_on_gaussian() {
        let surface = gaussian_surface(16, 9.3, 6.6);
        let peak = find_peak(&surface, 16);
        assert_eq!((peak.x, peak.y), (9, 7));
        let offset = refine(&surface, 16, peak);
        assert!((offset.x - 1.3).abs() < 1e-3, "{offset:?}");
        assert!((offset.y + 1.4).abs() < 1e-3, "{offset:?}");
    }

    #[test]
    fn test_ties_prefer_center() {
        let surface = vec![1.0; 8 * 8];
        let peak = find_peak(&surface, 8);
        assert_eq!((peak.x, peak.y), (4, 4));
    }

    #[test]
    fn test_border_peak_not_refined() {
        let mut surface = vec![0.0; 8 * 8];
        surface[0] = 1.0;
        surface[1] = 0.5;
        let peak = find_peak(&surface, 8);
        assert_eq!(refine(&surface, 8, peak), DVec2::new(-4.0, -4.0));
    }

    #[test]
    fn test_offset_clamped() {
        assert_eq!(gaussian_offset(1.0, 1.0, 1.0), 0.0);
        assert!(gaussian_offset(1.0, 0.2, 1e-9).abs() <= 1.0);
    }
}
